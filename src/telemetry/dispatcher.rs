//! The accounting worker: owns the [`Aggregator`], drains the accounting
//! mailbox and drives periodic exports.
//!
//! Classification, snapshots and exports all run on this one task, so the
//! statistics table is never shared.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::accounting::event::ClassifiedEvent;
use crate::accounting::Aggregator;
use crate::config::TelemetryConfig;

use super::Telemetry;

/// Messages accepted by the accounting worker.
#[derive(Debug)]
pub enum AccountingMessage {
    /// Account one event.
    Event(ClassifiedEvent),
    /// End of stream: run the final export, reply with the accounted count
    /// and stop.
    Complete { reply: oneshot::Sender<u64> },
    /// Snapshot of the statistics for operators.
    Diagnostics { reply: oneshot::Sender<Diagnostics> },
}

/// Read-only view of the worker's state.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub json: String,
    pub table: String,
    pub accounted: u64,
    pub failed_sends: u64,
    pub discovery_exports: u64,
    pub data_exports: u64,
}

/// State handed back when the worker stops.
#[derive(Debug)]
pub struct DispatchReport {
    pub accounted: u64,
    pub failed_sends: u64,
    pub aggregator: Aggregator,
}

/// How the worker stopped.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// End of stream or closed mailbox.
    Completed(DispatchReport),
    /// Termination signal.
    Signalled(DispatchReport),
}

impl DispatchOutcome {
    pub fn report(&self) -> &DispatchReport {
        match self {
            Self::Completed(report) | Self::Signalled(report) => report,
        }
    }

    pub fn into_report(self) -> DispatchReport {
        match self {
            Self::Completed(report) | Self::Signalled(report) => report,
        }
    }

    pub fn is_signalled(&self) -> bool {
        matches!(self, Self::Signalled(_))
    }
}

/// Producer side of the accounting mailbox. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AccountingMailbox {
    tx: mpsc::Sender<AccountingMessage>,
}

impl AccountingMailbox {
    /// Queues one event, waiting while the mailbox is full.
    pub async fn submit(&self, event: ClassifiedEvent) -> Result<()> {
        self.tx
            .send(AccountingMessage::Event(event))
            .await
            .map_err(|_| anyhow!("accounting worker stopped"))
    }

    /// Signals end of stream and waits for the accounted count.
    pub async fn complete(&self) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AccountingMessage::Complete { reply })
            .await
            .map_err(|_| anyhow!("accounting worker stopped"))?;
        rx.await.context("accounting worker dropped completion reply")
    }

    /// Requests a diagnostics snapshot.
    pub async fn diagnostics(&self) -> Result<Diagnostics> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AccountingMessage::Diagnostics { reply })
            .await
            .map_err(|_| anyhow!("accounting worker stopped"))?;
        rx.await.context("accounting worker dropped diagnostics reply")
    }
}

/// Handle to a running accounting worker.
#[derive(Debug)]
pub struct DispatcherHandle {
    mailbox: AccountingMailbox,
    task: JoinHandle<Result<DispatchOutcome>>,
}

impl DispatcherHandle {
    pub fn mailbox(&self) -> AccountingMailbox {
        self.mailbox.clone()
    }

    /// Waits for the worker to stop and returns its final state.
    pub async fn join(self) -> Result<DispatchOutcome> {
        drop(self.mailbox);
        self.task.await.context("accounting worker panicked")?
    }
}

/// Schedule of the accounting worker.
#[derive(Debug, Clone, Copy)]
struct Schedule {
    discovery_interval: Duration,
    sending_interval: Duration,
    idle_timeout: Duration,
    signal_drain_timeout: Duration,
}

/// The accounting worker.
pub struct Dispatcher {
    aggregator: Aggregator,
    telemetry: Telemetry,
    schedule: Schedule,
    accounted: u64,
}

impl Dispatcher {
    pub fn new(aggregator: Aggregator, telemetry: Telemetry, cfg: &TelemetryConfig) -> Self {
        Self {
            aggregator,
            telemetry,
            schedule: Schedule {
                discovery_interval: cfg.discovery_interval,
                sending_interval: cfg.sending_interval,
                idle_timeout: cfg.idle_timeout,
                signal_drain_timeout: cfg.signal_drain_timeout,
            },
            accounted: 0,
        }
    }

    /// Starts the worker with a mailbox of `capacity` messages.
    pub fn spawn(self, capacity: usize, cancel: CancellationToken) -> DispatcherHandle {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(self.run(rx, cancel));
        DispatcherHandle {
            mailbox: AccountingMailbox { tx },
            task,
        }
    }

    async fn run(
        mut self,
        mut rx: mpsc::Receiver<AccountingMessage>,
        cancel: CancellationToken,
    ) -> Result<DispatchOutcome> {
        info!(
            discovery_interval = ?self.schedule.discovery_interval,
            sending_interval = ?self.schedule.sending_interval,
            idle_timeout = ?self.schedule.idle_timeout,
            "accounting worker started",
        );

        let mut last_discovery = Instant::now();
        let mut last_send = Instant::now();

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    return self.on_signal(&mut rx).await;
                }

                msg = rx.recv() => match msg {
                    Some(AccountingMessage::Event(event)) => self.account(&event),
                    Some(AccountingMessage::Complete { reply }) => {
                        self.final_export().await?;
                        if reply.send(self.accounted).is_err() {
                            warn!("completion requester went away");
                        }
                        return Ok(DispatchOutcome::Completed(self.into_report()));
                    }
                    Some(AccountingMessage::Diagnostics { reply }) => {
                        let _ = reply.send(self.diagnostics()?);
                    }
                    None => {
                        info!("accounting mailbox closed");
                        self.final_export().await?;
                        return Ok(DispatchOutcome::Completed(self.into_report()));
                    }
                },

                _ = tokio::time::sleep(self.schedule.idle_timeout) => {
                    trace!("accounting worker idle");
                }
            }

            if last_discovery.elapsed() >= self.schedule.discovery_interval {
                self.telemetry.send_discovery(&self.aggregator).await?;
                last_discovery = Instant::now();
            }
            if last_send.elapsed() >= self.schedule.sending_interval {
                self.telemetry.send_data(&mut self.aggregator).await;
                last_send = Instant::now();
            }
        }
    }

    fn account(&mut self, event: &ClassifiedEvent) {
        if self.aggregator.classify(event) {
            self.accounted += 1;
        }
    }

    async fn on_signal(
        mut self,
        rx: &mut mpsc::Receiver<AccountingMessage>,
    ) -> Result<DispatchOutcome> {
        let drain = self.schedule.signal_drain_timeout;
        if !drain.is_zero() {
            let deadline = Instant::now() + drain;
            let mut drained = 0u64;
            while Instant::now() < deadline {
                match rx.try_recv() {
                    Ok(AccountingMessage::Event(event)) => {
                        self.account(&event);
                        drained += 1;
                    }
                    Ok(AccountingMessage::Complete { reply }) => {
                        let _ = reply.send(self.accounted);
                        break;
                    }
                    Ok(AccountingMessage::Diagnostics { reply }) => {
                        let _ = reply.send(self.diagnostics()?);
                    }
                    Err(_) => break,
                }
            }
            debug!(drained, "drained accounting mailbox");
        }
        rx.close();

        info!(accounted = self.accounted, "termination signal, running final export");
        self.final_export().await?;
        Ok(DispatchOutcome::Signalled(self.into_report()))
    }

    async fn final_export(&mut self) -> Result<()> {
        self.telemetry.send_discovery(&self.aggregator).await?;
        self.telemetry.send_data(&mut self.aggregator).await;
        let (vhosts, classes) = self.aggregator.vhost_and_class_counts();
        info!(
            accounted = self.accounted,
            vhosts,
            classes,
            failed_sends = self.telemetry.failed_sends(),
            "final export done",
        );
        Ok(())
    }

    fn diagnostics(&self) -> Result<Diagnostics> {
        Ok(Diagnostics {
            json: self.aggregator.to_json()?,
            table: self.aggregator.dump_table(),
            accounted: self.accounted,
            failed_sends: self.telemetry.failed_sends(),
            discovery_exports: self.telemetry.discovery_exports(),
            data_exports: self.telemetry.data_exports(),
        })
    }

    fn into_report(self) -> DispatchReport {
        DispatchReport {
            accounted: self.accounted,
            failed_sends: self.telemetry.failed_sends(),
            aggregator: self.aggregator,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::latency::LatencyClassTable;
    use crate::accounting::mapping::RequestMapper;
    use crate::clock::Clock;
    use crate::config::ExporterKind;

    fn config(drain: Duration) -> TelemetryConfig {
        TelemetryConfig {
            exporter: ExporterKind::Log,
            signal_drain_timeout: drain,
            ..Default::default()
        }
    }

    fn spawn(cfg: &TelemetryConfig, cancel: CancellationToken) -> DispatcherHandle {
        let aggregator = Aggregator::new(LatencyClassTable::default(), RequestMapper::identity());
        let telemetry = Telemetry::new(cfg, Clock::System);
        Dispatcher::new(aggregator, telemetry, cfg).spawn(16, cancel)
    }

    #[tokio::test]
    async fn test_complete_returns_accounted() {
        let handle = spawn(&config(Duration::ZERO), CancellationToken::new());
        let mailbox = handle.mailbox();

        mailbox.submit(ClassifiedEvent::new("dom1", "/a", "100", 200)).await.expect("submit");
        mailbox.submit(ClassifiedEvent::new("dom1", "/a", "x", 200)).await.expect("submit");
        mailbox.submit(ClassifiedEvent::new("dom1", "/a", "200", 200)).await.expect("submit");

        assert_eq!(mailbox.complete().await.expect("complete"), 2);

        let outcome = handle.join().await.expect("join");
        assert!(!outcome.is_signalled());
        let report = outcome.into_report();
        assert_eq!(report.accounted, 2);
        assert_eq!(report.failed_sends, 0);

        // The final export consumed the delta window.
        let bucket = report.aggregator.bucket("dom1", "/a").expect("bucket");
        assert_eq!(bucket.last_count(), 2);
        assert_eq!(bucket.last_sum(), 300);
    }

    #[tokio::test]
    async fn test_submit_after_stop_fails() {
        let handle = spawn(&config(Duration::ZERO), CancellationToken::new());
        let mailbox = handle.mailbox();
        mailbox.complete().await.expect("complete");
        handle.join().await.expect("join");

        assert!(mailbox.submit(ClassifiedEvent::new("d", "/", "1", 200)).await.is_err());
    }

    #[tokio::test]
    async fn test_diagnostics_snapshot() {
        let handle = spawn(&config(Duration::ZERO), CancellationToken::new());
        let mailbox = handle.mailbox();
        mailbox.submit(ClassifiedEvent::new("dom1", "/a", "100", 200)).await.expect("submit");

        let diag = mailbox.diagnostics().await.expect("diagnostics");
        assert_eq!(diag.accounted, 1);
        assert!(diag.json.contains("\"dom1\""));
        assert!(diag.table.contains("dom1"));

        mailbox.complete().await.expect("complete");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sending_interval_triggers_data_export() {
        let handle = spawn(&config(Duration::ZERO), CancellationToken::new());
        let mailbox = handle.mailbox();
        mailbox.submit(ClassifiedEvent::new("dom1", "/a", "100", 200)).await.expect("submit");

        // Idle wake-ups keep the interval checks running while time is paused.
        tokio::time::sleep(Duration::from_secs(125)).await;

        let diag = mailbox.diagnostics().await.expect("diagnostics");
        assert_eq!(diag.data_exports, 1);
        assert_eq!(diag.discovery_exports, 0);

        tokio::time::sleep(Duration::from_secs(15 * 60)).await;
        let diag = mailbox.diagnostics().await.expect("diagnostics");
        assert_eq!(diag.discovery_exports, 1);
        assert!(diag.data_exports >= 7);

        mailbox.complete().await.expect("complete");
    }

    #[tokio::test]
    async fn test_signal_with_drain_accounts_queued_events() {
        let cancel = CancellationToken::new();
        let handle = spawn(&config(Duration::from_secs(1)), cancel.clone());
        let mailbox = handle.mailbox();

        for elapsed in ["1", "2", "3"] {
            mailbox.submit(ClassifiedEvent::new("dom1", "/a", elapsed, 200)).await.expect("submit");
        }
        cancel.cancel();

        let outcome = handle.join().await.expect("join");
        assert!(outcome.is_signalled());
        assert_eq!(outcome.report().accounted, 3);
    }

    #[tokio::test]
    async fn test_signal_stops_worker() {
        let cancel = CancellationToken::new();
        let handle = spawn(&config(Duration::ZERO), cancel.clone());
        let mailbox = handle.mailbox();
        cancel.cancel();

        let outcome = handle.join().await.expect("join");
        assert!(outcome.is_signalled());
        assert!(mailbox.submit(ClassifiedEvent::new("d", "/", "1", 200)).await.is_err());
    }
}
