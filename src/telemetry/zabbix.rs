//! Zabbix sender (trapper) protocol client.
//!
//! Every packet in both directions is framed as the `ZBXD` magic, a flag byte
//! (`0x01`, plain JSON), a little-endian `u64` payload length and the JSON
//! payload itself.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::metric::Metric;

const MAGIC: &[u8; 4] = b"ZBXD";
const FLAG_JSON: u8 = 0x01;
const HEADER_SIZE: usize = 13;

/// Upper bound for a response payload. Trapper responses are a few hundred
/// bytes.
const MAX_RESPONSE_SIZE: u64 = 1024 * 1024;

/// Errors from a single trapper submission.
#[derive(Error, Debug)]
pub enum ZabbixError {
    #[error("connecting to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("trapper i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("trapper exchange timed out after {0:?}")]
    Timeout(Duration),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("submission rejected: {info}")]
    Rejected { info: String },

    #[error("encoding request: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct SenderRequest<'a> {
    request: &'static str,
    data: &'a [Metric],
    clock: i64,
}

/// Decoded trapper response.
#[derive(Debug, Clone, Deserialize)]
pub struct SenderResponse {
    pub response: String,
    #[serde(default)]
    pub info: String,
}

/// Frames a JSON payload for the wire.
pub fn encode_packet(payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(HEADER_SIZE + payload.len());
    packet.extend_from_slice(MAGIC);
    packet.push(FLAG_JSON);
    packet.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    packet.extend_from_slice(payload);
    packet
}

/// Validates a frame header and returns the payload length.
pub fn decode_header(header: &[u8; HEADER_SIZE]) -> Result<u64, ZabbixError> {
    if &header[..4] != MAGIC {
        return Err(ZabbixError::Protocol(format!(
            "bad magic {:?}",
            String::from_utf8_lossy(&header[..4])
        )));
    }
    if header[4] != FLAG_JSON {
        return Err(ZabbixError::Protocol(format!(
            "unsupported flags {:#04x}",
            header[4]
        )));
    }
    let mut len = [0u8; 8];
    len.copy_from_slice(&header[5..]);
    Ok(u64::from_le_bytes(len))
}

/// Sends metric batches to one trapper endpoint. Each submission uses a fresh
/// connection.
#[derive(Debug, Clone)]
pub struct ZabbixSender {
    addr: String,
    timeout: Duration,
}

impl ZabbixSender {
    pub fn new(server: &str, port: u16, timeout: Duration) -> Self {
        Self {
            addr: format!("{server}:{port}"),
            timeout,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Submits `metrics` and waits for the trapper's verdict. Anything other
    /// than a `success` response is an error.
    pub async fn send(&self, metrics: &[Metric], clock: i64) -> Result<SenderResponse, ZabbixError> {
        let payload = serde_json::to_vec(&SenderRequest {
            request: "sender data",
            data: metrics,
            clock,
        })?;
        let packet = encode_packet(&payload);

        let response = tokio::time::timeout(self.timeout, self.exchange(&packet))
            .await
            .map_err(|_| ZabbixError::Timeout(self.timeout))??;

        debug!(
            addr = %self.addr,
            metrics = metrics.len(),
            info = %response.info,
            "trapper response",
        );

        if response.response != "success" {
            return Err(ZabbixError::Rejected {
                info: if response.info.is_empty() {
                    response.response
                } else {
                    response.info
                },
            });
        }
        Ok(response)
    }

    async fn exchange(&self, packet: &[u8]) -> Result<SenderResponse, ZabbixError> {
        let mut stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|source| ZabbixError::Connect {
                addr: self.addr.clone(),
                source,
            })?;

        stream.write_all(packet).await?;
        stream.flush().await?;

        let mut header = [0u8; HEADER_SIZE];
        stream.read_exact(&mut header).await?;
        let len = decode_header(&header)?;
        if len > MAX_RESPONSE_SIZE {
            return Err(ZabbixError::Protocol(format!(
                "response of {len} bytes exceeds limit"
            )));
        }

        let mut body = vec![0u8; len as usize];
        stream.read_exact(&mut body).await?;

        serde_json::from_slice(&body)
            .map_err(|e| ZabbixError::Protocol(format!("decoding response: {e}")))
    }
}
