use anyhow::Result;
use tracing::info;

use crate::config::{ExporterKind, ZabbixConfig};

use super::metric::Metric;
use super::zabbix::ZabbixSender;

/// Exporter dispatches metric batches to the Zabbix trapper or to the log.
///
/// Uses enum dispatch rather than trait objects for async dispatch without
/// boxing every export future.
#[derive(Debug, Clone)]
pub enum Exporter {
    Zabbix(ZabbixSender),
    Log,
}

impl Exporter {
    pub fn from_config(kind: ExporterKind, zabbix: &ZabbixConfig) -> Self {
        match kind {
            ExporterKind::Zabbix => {
                Self::Zabbix(ZabbixSender::new(&zabbix.server, zabbix.port, zabbix.timeout))
            }
            ExporterKind::Log => Self::Log,
        }
    }

    /// Returns the exporter name for logging.
    pub fn name(&self) -> &str {
        match self {
            Self::Zabbix(_) => "zabbix",
            Self::Log => "log",
        }
    }

    /// Submit one batch of metrics.
    pub async fn export(&self, metrics: &[Metric], clock: i64) -> Result<()> {
        match self {
            Self::Zabbix(sender) => {
                sender.send(metrics, clock).await?;
            }
            Self::Log => {
                for metric in metrics {
                    info!(
                        host = %metric.host,
                        key = %metric.key,
                        value = %metric.value,
                        clock = metric.clock,
                        "metric",
                    );
                }
            }
        }
        Ok(())
    }
}
