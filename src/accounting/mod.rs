//! Per-origin, per-request-class accounting of response times.
//!
//! The [`Aggregator`] owns the statistics table outright. It is moved into the
//! dispatcher worker and only ever touched from that task, so neither
//! classification nor export snapshots need locking.

pub mod bucket;
pub mod event;
pub mod latency;
pub mod mapping;
pub mod render;

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use tracing::{debug, trace};

use crate::config::AccountingConfig;

use self::bucket::AccountingBucket;
use self::event::ClassifiedEvent;
use self::latency::LatencyClassTable;
use self::mapping::RequestMapper;

/// Statistics table keyed by origin, then request class.
pub type StatsTable = BTreeMap<String, BTreeMap<String, AccountingBucket>>;

/// Accounts classified events into per-`(origin, class)` buckets.
#[derive(Debug, Clone)]
pub struct Aggregator {
    latency: LatencyClassTable,
    mapper: RequestMapper,
    stats: StatsTable,
}

impl Aggregator {
    pub fn new(latency: LatencyClassTable, mapper: RequestMapper) -> Self {
        Self {
            latency,
            mapper,
            stats: BTreeMap::new(),
        }
    }

    /// Builds an aggregator from the accounting section of the config.
    pub fn from_config(cfg: &AccountingConfig) -> Result<Self> {
        let mapper = RequestMapper::from_config(&cfg.static_content_regex, &cfg.request_mappings)
            .context("building request mapper")?;
        Ok(Self::new(
            LatencyClassTable::new(cfg.latency_classes.clone()),
            mapper,
        ))
    }

    /// Accounts one event.
    ///
    /// Returns `false` and leaves the table untouched when the elapsed-time
    /// field is not numeric or the event carries the reserved end-of-stream
    /// origin.
    pub fn classify(&mut self, event: &ClassifiedEvent) -> bool {
        if event.has_reserved_origin() {
            debug!("reserved origin is never accounted");
            return false;
        }

        let Some(elapsed) = event.elapsed_micros() else {
            debug!(elapsed = %event.elapsed, "unable to parse elapsed time");
            return false;
        };

        let latency_class = self.latency.classify(elapsed);
        let thresholds = self.latency.thresholds();
        let per_origin = self.stats.entry(event.origin.clone()).or_default();

        for class in self.mapper.resolve(&event.request) {
            trace!(
                origin = %event.origin,
                class,
                elapsed,
                code = event.status_code,
                "account request",
            );
            per_origin
                .entry(class.to_string())
                .or_insert_with(|| AccountingBucket::new(thresholds))
                .record(elapsed, event.status_code, latency_class);
        }

        true
    }

    /// Read-only traversal of every bucket, ordered by origin then class.
    pub fn snapshot_for_export(&self) -> impl Iterator<Item = (&str, &str, &AccountingBucket)> {
        self.stats.iter().flat_map(|(origin, classes)| {
            classes
                .iter()
                .map(move |(class, bucket)| (origin.as_str(), class.as_str(), bucket))
        })
    }

    /// Mutable traversal used by the data export to advance delta markers.
    pub(crate) fn buckets_mut(&mut self) -> impl Iterator<Item = (&str, &str, &mut AccountingBucket)> {
        self.stats.iter_mut().flat_map(|(origin, classes)| {
            classes
                .iter_mut()
                .map(move |(class, bucket)| (origin.as_str(), class.as_str(), bucket))
        })
    }

    /// Looks up a single bucket.
    pub fn bucket(&self, origin: &str, class: &str) -> Option<&AccountingBucket> {
        self.stats.get(origin).and_then(|classes| classes.get(class))
    }

    /// Number of distinct origins and of distinct `(origin, class)` pairs.
    pub fn vhost_and_class_counts(&self) -> (usize, usize) {
        let pairs = self.stats.values().map(BTreeMap::len).sum();
        (self.stats.len(), pairs)
    }

    /// Configured latency thresholds.
    pub fn latency_classes(&self) -> &LatencyClassTable {
        &self.latency
    }

    /// Every status code seen in any bucket, ascending.
    pub fn observed_codes(&self) -> Vec<u16> {
        let codes: BTreeSet<u16> = self
            .stats
            .values()
            .flat_map(BTreeMap::values)
            .flat_map(|bucket| bucket.codes().keys().copied())
            .collect();
        codes.into_iter().collect()
    }

    /// Pretty-printed JSON rendering of the full statistics table.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.stats).context("serializing statistics table")
    }
}
