//! Ingest loop: reads raw access-log lines and feeds the log sink and the
//! accounting worker.

pub mod parse;

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, error, info, trace};

use crate::accounting::event::ClassifiedEvent;
use crate::sink::LogSink;
use crate::telemetry::dispatcher::AccountingMailbox;

use self::parse::LineParser;

/// Status codes outside this range are written to the log but not accounted.
const ACCOUNTED_STATUS: std::ops::Range<u16> = 200..400;

/// Counters of one ingest run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    pub lines: u64,
    pub not_matched: u64,
    pub filtered: u64,
    /// Events the accounting worker accepted, as reported on completion.
    pub accounted: u64,
    /// Sink line count acknowledged by the final commit.
    pub committed: u64,
    pub elapsed: Duration,
}

impl IngestReport {
    /// Events that should have reached the aggregator.
    pub fn expected_accounted(&self) -> u64 {
        self.lines.saturating_sub(self.not_matched + self.filtered)
    }

    /// Compares the accounted count with the ingest counters. A mismatch is
    /// logged and reported, never fatal.
    pub fn reconcile(&self) -> bool {
        let expected = self.expected_accounted();
        if self.accounted != expected {
            error!(
                accounted = self.accounted,
                expected,
                lines = self.lines,
                not_matched = self.not_matched,
                filtered = self.filtered,
                "accounting does not match ingested lines",
            );
            return false;
        }
        true
    }

    pub fn lines_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.lines as f64 / secs
    }

    pub fn not_matched_percent(&self) -> f64 {
        if self.lines == 0 {
            return 0.0;
        }
        self.not_matched as f64 * 100.0 / self.lines as f64
    }
}

/// One producer feeding a sink and the accounting mailbox.
#[derive(Debug)]
pub struct Ingest {
    parser: LineParser,
    sink: LogSink,
    mailbox: AccountingMailbox,
}

impl Ingest {
    pub fn new(parser: LineParser, sink: LogSink, mailbox: AccountingMailbox) -> Self {
        Self {
            parser,
            sink,
            mailbox,
        }
    }

    /// Consumes `reader` to the end, then commits the sink and completes the
    /// accounting stream. Lines are passed to the sink byte for byte; only
    /// valid UTF-8 lines are parsed.
    pub async fn run<R>(&self, mut reader: R) -> Result<IngestReport>
    where
        R: AsyncBufRead + Unpin,
    {
        let start = Instant::now();
        let mut report = IngestReport::default();
        let mut buf = Vec::new();

        loop {
            let read = reader
                .read_until(b'\n', &mut buf)
                .await
                .context("reading input")?;
            if read == 0 {
                break;
            }
            strip_line_ending(&mut buf);
            report.lines += 1;

            let event = self.classify_line(&buf, &mut report);

            self.sink
                .submit_line(std::mem::take(&mut buf))
                .await
                .context("writing to log sink")?;

            if let Some(event) = event {
                self.mailbox.submit(event).await?;
            }
        }

        report.committed = self.sink.commit().await.context("committing log sink")?;
        report.accounted = self.mailbox.complete().await?;
        report.elapsed = start.elapsed();

        info!(
            lines = report.lines,
            not_matched = report.not_matched,
            not_matched_percent = report.not_matched_percent(),
            filtered = report.filtered,
            accounted = report.accounted,
            lines_per_second = report.lines_per_second().round(),
            "input complete",
        );

        Ok(report)
    }

    fn classify_line(&self, line: &[u8], report: &mut IngestReport) -> Option<ClassifiedEvent> {
        let Ok(text) = std::str::from_utf8(line) else {
            report.not_matched += 1;
            debug!(line = %String::from_utf8_lossy(line), "line is not valid UTF-8");
            return None;
        };

        match self.parser.parse(text) {
            None => {
                report.not_matched += 1;
                debug!(line = %text, "line not matched");
                None
            }
            Some(parsed) if !ACCOUNTED_STATUS.contains(&parsed.code) => {
                report.filtered += 1;
                trace!(code = parsed.code, "status code not accounted");
                None
            }
            Some(parsed) => Some(ClassifiedEvent::new(
                parsed.domain,
                parsed.uri,
                parsed.time,
                parsed.code,
            )),
        }
    }
}

fn strip_line_ending(buf: &mut Vec<u8>) {
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(lines: u64, not_matched: u64, filtered: u64, accounted: u64) -> IngestReport {
        IngestReport {
            lines,
            not_matched,
            filtered,
            accounted,
            ..Default::default()
        }
    }

    #[test]
    fn test_reconcile_match() {
        assert!(report(10, 3, 2, 5).reconcile());
    }

    #[test]
    fn test_reconcile_mismatch() {
        assert!(!report(10, 3, 2, 4).reconcile());
    }

    #[test]
    fn test_rates_of_empty_run() {
        let r = IngestReport::default();
        assert_eq!(r.lines_per_second(), 0.0);
        assert_eq!(r.not_matched_percent(), 0.0);
    }

    #[test]
    fn test_strip_line_ending() {
        let mut crlf = b"GET /\r\n".to_vec();
        strip_line_ending(&mut crlf);
        assert_eq!(crlf, b"GET /");

        let mut last = b"no newline".to_vec();
        strip_line_ending(&mut last);
        assert_eq!(last, b"no newline");
    }

    #[test]
    fn test_not_matched_percent() {
        assert_eq!(report(8, 2, 0, 6).not_matched_percent(), 25.0);
    }
}
