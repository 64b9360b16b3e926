//! Export of accounted statistics to the monitoring collector.
//!
//! [`Telemetry`] turns the aggregator's buckets into discovery and data
//! metric batches and hands them to an [`Exporter`]. Delivery failures are
//! counted and dropped; the next export resends the cumulative state.

pub mod dispatcher;
pub mod exporter;
pub mod metric;
pub mod zabbix;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::accounting::Aggregator;
use crate::clock::Clock;
use crate::config::TelemetryConfig;

use self::exporter::Exporter;
use self::metric::{discovery_payload, item_key, Metric, MetricKind};

/// Builds and submits discovery and data exports.
#[derive(Debug)]
pub struct Telemetry {
    exporter: Exporter,
    enabled: bool,
    host: String,
    discovery_key: String,
    base_key: String,
    clock: Clock,
    discovery_exports: u64,
    data_exports: u64,
    failed_sends: u64,
}

impl Telemetry {
    pub fn new(cfg: &TelemetryConfig, clock: Clock) -> Self {
        Self::with_exporter(cfg, Exporter::from_config(cfg.exporter, &cfg.zabbix), clock)
    }

    pub fn with_exporter(cfg: &TelemetryConfig, exporter: Exporter, clock: Clock) -> Self {
        Self {
            exporter,
            enabled: cfg.enabled,
            host: cfg.zabbix.host.clone(),
            discovery_key: cfg.zabbix.discovery_key.clone(),
            base_key: cfg.zabbix.base_key.clone(),
            clock,
            discovery_exports: 0,
            data_exports: 0,
            failed_sends: 0,
        }
    }

    /// Number of submissions the collector did not accept.
    pub fn failed_sends(&self) -> u64 {
        self.failed_sends
    }

    /// Discovery exports attempted so far.
    pub fn discovery_exports(&self) -> u64 {
        self.discovery_exports
    }

    /// Data exports attempted so far.
    pub fn data_exports(&self) -> u64 {
        self.data_exports
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Submits the list of known `(origin, class)` pairs.
    ///
    /// A payload that cannot be serialized is returned as an error; delivery
    /// failures are only counted.
    pub async fn send_discovery(&mut self, aggregator: &Aggregator) -> Result<()> {
        if !self.enabled {
            debug!("telemetry disabled, not sending discovery");
            return Ok(());
        }

        let value = discovery_payload(
            aggregator
                .snapshot_for_export()
                .map(|(origin, class, _)| (origin, class)),
        )
        .context("serializing discovery payload")?;

        let clock = self.clock.now().timestamp();
        info!(exporter = self.exporter.name(), value = %value, "sending discovery");
        let metrics = [Metric::new(&self.host, &self.discovery_key, value, clock)];
        self.discovery_exports += 1;
        self.submit(&metrics, clock, "discovery").await;
        Ok(())
    }

    /// Submits cumulative and delta metrics for every bucket and marks the
    /// current totals as exported.
    pub async fn send_data(&mut self, aggregator: &mut Aggregator) {
        if !self.enabled {
            debug!("telemetry disabled, not sending data");
            return;
        }

        let clock = self.clock.now().timestamp();
        let metrics = self.data_metrics(aggregator, clock);
        info!(
            exporter = self.exporter.name(),
            metrics = metrics.len(),
            "sending data",
        );
        self.data_exports += 1;
        self.submit(&metrics, clock, "data").await;
    }

    /// Builds the data export batch. Advances every bucket's delta markers.
    pub fn data_metrics(&self, aggregator: &mut Aggregator, clock: i64) -> Vec<Metric> {
        let mut metrics = Vec::new();

        for (origin, class, bucket) in aggregator.buckets_mut() {
            let mut push = |kind: MetricKind, value: String| {
                metrics.push(Metric::new(
                    &self.host,
                    item_key(&self.base_key, origin, class, kind),
                    value,
                    clock,
                ));
            };

            push(MetricKind::Count, bucket.count().to_string());
            push(MetricKind::Sum, bucket.sum().to_string());

            let rate = match bucket.take_delta_rate() {
                Some(rate) => format!("{rate:.6}"),
                None => "0".to_string(),
            };
            push(MetricKind::Rate, rate);

            for (&threshold, &count) in bucket.classes() {
                push(MetricKind::Class(threshold), count.to_string());
            }
            for (&code, &count) in bucket.codes() {
                push(MetricKind::Code(code), count.to_string());
            }
        }

        metrics
    }

    async fn submit(&mut self, metrics: &[Metric], clock: i64, what: &'static str) {
        if let Err(e) = self.exporter.export(metrics, clock).await {
            self.failed_sends += 1;
            warn!(
                exporter = self.exporter.name(),
                export = what,
                failed_sends = self.failed_sends,
                error = %e,
                "export failed",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Local, TimeZone};

    use super::*;
    use crate::accounting::event::ClassifiedEvent;
    use crate::accounting::latency::LatencyClassTable;
    use crate::accounting::mapping::RequestMapper;
    use crate::config::ExporterKind;

    fn log_telemetry(enabled: bool) -> Telemetry {
        let cfg = TelemetryConfig {
            enabled,
            exporter: ExporterKind::Log,
            ..Default::default()
        };
        let clock = Clock::manual(Local.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        Telemetry::new(&cfg, clock)
    }

    fn aggregator() -> Aggregator {
        let mut agg = Aggregator::new(
            LatencyClassTable::new(vec![0, 500_000]),
            RequestMapper::identity(),
        );
        agg.classify(&ClassifiedEvent::new("dom1", "/a", "100", 200));
        agg.classify(&ClassifiedEvent::new("dom1", "/a", "200", 200));
        agg
    }

    fn value_of<'a>(metrics: &'a [Metric], key: &str) -> Option<&'a str> {
        metrics.iter().find(|m| m.key == key).map(|m| m.value.as_str())
    }

    #[test]
    fn test_data_metrics_layout() {
        let telemetry = log_telemetry(true);
        let mut agg = aggregator();
        let metrics = telemetry.data_metrics(&mut agg, 42);

        // count, sum, rate, two classes, one code.
        assert_eq!(metrics.len(), 6);
        assert!(metrics.iter().all(|m| m.clock == 42));
        assert_eq!(value_of(&metrics, "apache.acc[dom1,/a,count]"), Some("2"));
        assert_eq!(value_of(&metrics, "apache.acc[dom1,/a,sum]"), Some("300"));
        assert_eq!(value_of(&metrics, "apache.acc[dom1,/a,rate]"), Some("150.000000"));
        assert_eq!(value_of(&metrics, "apache.acc[dom1,/a,class.0]"), Some("2"));
        assert_eq!(value_of(&metrics, "apache.acc[dom1,/a,class.500000]"), Some("0"));
        assert_eq!(value_of(&metrics, "apache.acc[dom1,/a,code.200]"), Some("2"));
    }

    #[test]
    fn test_rate_is_zero_without_new_requests() {
        let telemetry = log_telemetry(true);
        let mut agg = aggregator();
        telemetry.data_metrics(&mut agg, 1);

        let bucket = agg.bucket("dom1", "/a").expect("bucket");
        assert_eq!(bucket.last_count(), bucket.count());
        assert_eq!(bucket.last_sum(), bucket.sum());

        let metrics = telemetry.data_metrics(&mut agg, 2);
        assert_eq!(value_of(&metrics, "apache.acc[dom1,/a,rate]"), Some("0"));
        assert_eq!(value_of(&metrics, "apache.acc[dom1,/a,count]"), Some("2"));
    }

    #[tokio::test]
    async fn test_disabled_telemetry_skips_and_keeps_markers() {
        let mut telemetry = log_telemetry(false);
        let mut agg = aggregator();

        telemetry.send_discovery(&agg).await.expect("no error");
        telemetry.send_data(&mut agg).await;

        assert_eq!(telemetry.failed_sends(), 0);
        assert_eq!(telemetry.data_exports(), 0);
        assert_eq!(agg.bucket("dom1", "/a").map(|b| b.last_count()), Some(0));
    }

    #[tokio::test]
    async fn test_log_exporter_advances_markers() {
        let mut telemetry = log_telemetry(true);
        let mut agg = aggregator();

        telemetry.send_discovery(&agg).await.expect("no error");
        telemetry.send_data(&mut agg).await;

        assert_eq!(telemetry.failed_sends(), 0);
        assert_eq!(telemetry.discovery_exports(), 1);
        assert_eq!(telemetry.data_exports(), 1);
        assert_eq!(agg.bucket("dom1", "/a").map(|b| b.last_count()), Some(2));
    }
}
