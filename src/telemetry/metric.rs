use std::fmt;

use serde::Serialize;

/// One value submitted to the collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Metric {
    pub host: String,
    pub key: String,
    pub value: String,
    pub clock: i64,
}

impl Metric {
    pub fn new(
        host: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
        clock: i64,
    ) -> Self {
        Self {
            host: host.into(),
            key: key.into(),
            value: value.into(),
            clock,
        }
    }
}

/// Per-bucket metric kinds of a data export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Count,
    Sum,
    Rate,
    Class(u64),
    Code(u16),
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count => f.write_str("count"),
            Self::Sum => f.write_str("sum"),
            Self::Rate => f.write_str("rate"),
            Self::Class(threshold) => write!(f, "class.{threshold}"),
            Self::Code(code) => write!(f, "code.{code}"),
        }
    }
}

/// Formats `base[origin,class,kind]`.
pub fn item_key(base: &str, origin: &str, class: &str, kind: MetricKind) -> String {
    format!("{base}[{origin},{class},{kind}]")
}

/// One entry of the low-level discovery value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryEntry<'a> {
    #[serde(rename = "{#NAME}")]
    pub name: &'a str,
    #[serde(rename = "{#ACCSET}")]
    pub accounting_set: &'a str,
}

/// Serializes the discovery value listing every `(origin, class)` pair.
pub fn discovery_payload<'a>(
    pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> serde_json::Result<String> {
    let entries: Vec<DiscoveryEntry<'a>> = pairs
        .into_iter()
        .map(|(name, accounting_set)| DiscoveryEntry {
            name,
            accounting_set,
        })
        .collect();
    serde_json::to_string(&entries)
}
