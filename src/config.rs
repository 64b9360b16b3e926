use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::accounting::mapping::RequestMapper;
use crate::ingest::parse::LineParser;
use crate::sink::pattern::FilenamePattern;

/// Static-asset requests are accounted under the "NOT MATCHED" class.
pub const DEFAULT_STATIC_CONTENT_REGEX: &str =
    r"(?i).+\.(gif|jpg|jpeg|png|ico|flv|swf|js|css|txt|woff|ttf)";

/// Combined access-log format with the response time in microseconds as the
/// last field.
pub const DEFAULT_LINE_REGEX: &str = r#"^\d+\.\d+\.\d+\.\d+ (?P<domain>[^ ]+?)\s.*] "(GET|POST|PUT|PROPFIND|OPTIONS|DELETE) (?P<uri>/[^ ]*?)(?P<getparam>\?[^ ]*?)? HTTP.*" (?P<code>\d+) .* (?P<time>\d+)$"#;

/// Top-level configuration for logpipe.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Rotating log file output.
    #[serde(default)]
    pub output: OutputConfig,

    /// Response time accounting.
    #[serde(default)]
    pub accounting: AccountingConfig,

    /// Export of accounted statistics to the monitoring collector.
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Parsing of raw input lines.
    #[serde(default)]
    pub ingest: IngestConfig,
}

/// Rotating log file output configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// strftime template for the output file name. Default: "/dev/null".
    #[serde(default = "default_output_pattern")]
    pub pattern: String,

    /// Symlink kept pointing at the current output file.
    #[serde(default)]
    pub symlink: Option<PathBuf>,

    /// Bounded mailbox size of the sink worker. Default: 1024.
    #[serde(default = "default_output_mailbox_capacity")]
    pub mailbox_capacity: usize,
}

/// Response time accounting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountingConfig {
    /// Bounded mailbox size of the accounting worker. Default: 100.
    #[serde(default = "default_accounting_mailbox_capacity")]
    pub mailbox_capacity: usize,

    /// Latency thresholds in microseconds, matched in list order.
    #[serde(default = "default_latency_classes")]
    pub latency_classes: Vec<u64>,

    /// Named request classes. A request is accounted once per matching entry.
    #[serde(default)]
    pub request_mappings: Vec<RequestMappingConfig>,

    /// Requests matching this regex are accounted as static content.
    /// An empty string disables the check.
    #[serde(default = "default_static_content_regex")]
    pub static_content_regex: String,
}

/// One named request class.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestMappingConfig {
    pub name: String,
    pub regex: String,
}

/// Which exporter backs the telemetry dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExporterKind {
    #[default]
    Zabbix,
    Log,
}

/// Telemetry dispatcher configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Enable exports. Disabled telemetry skips every submission. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Exporter backend. Default: zabbix.
    #[serde(default)]
    pub exporter: ExporterKind,

    /// Interval between discovery exports. Default: 15m.
    #[serde(default = "default_discovery_interval", with = "humantime_serde")]
    pub discovery_interval: Duration,

    /// Interval between data exports. Default: 2m.
    #[serde(default = "default_sending_interval", with = "humantime_serde")]
    pub sending_interval: Duration,

    /// Wake-up interval while no events arrive. Default: 5s.
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// How long queued events are still accounted after a termination
    /// signal. Default: 0s (queued events are dropped).
    #[serde(default, with = "humantime_serde")]
    pub signal_drain_timeout: Duration,

    /// Zabbix trapper connection.
    #[serde(default)]
    pub zabbix: ZabbixConfig,
}

/// Zabbix trapper connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ZabbixConfig {
    /// Trapper server name or address. Default: "zabbix".
    #[serde(default = "default_zabbix_server")]
    pub server: String,

    /// Trapper port. Default: 10051.
    #[serde(default = "default_zabbix_port")]
    pub port: u16,

    /// Host name the items are registered under. Default: machine hostname.
    #[serde(default = "default_zabbix_host")]
    pub host: String,

    /// Item key of the low-level discovery rule.
    #[serde(default = "default_discovery_key")]
    pub discovery_key: String,

    /// Prefix of every data item key.
    #[serde(default = "default_base_key")]
    pub base_key: String,

    /// Connect, write and read timeout per submission. Default: 5s.
    #[serde(default = "default_zabbix_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Input line parsing configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Regex with the named groups domain, uri, code and time.
    #[serde(default = "default_line_regex")]
    pub line_regex: String,
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub output_pattern: Option<String>,
    pub symlink: Option<PathBuf>,
    pub sending_interval: Option<Duration>,
    pub discovery_interval: Option<Duration>,
    pub timeout: Option<Duration>,
    pub zabbix_server: Option<String>,
    pub zabbix_host: Option<String>,
    pub disable_telemetry: bool,
}

// --- Default value functions ---

fn default_true() -> bool {
    true
}

fn default_output_pattern() -> String {
    "/dev/null".to_string()
}

fn default_output_mailbox_capacity() -> usize {
    1024
}

fn default_accounting_mailbox_capacity() -> usize {
    100
}

/// Canonical latency thresholds in microseconds. The list is not sorted and
/// its order is significant.
pub fn default_latency_classes() -> Vec<u64> {
    vec![0, 500_000, 10_000_000, 5_000_000, 60_000_000, 300_000_000]
}

fn default_static_content_regex() -> String {
    DEFAULT_STATIC_CONTENT_REGEX.to_string()
}

fn default_discovery_interval() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_sending_interval() -> Duration {
    Duration::from_secs(2 * 60)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_zabbix_server() -> String {
    "zabbix".to_string()
}

fn default_zabbix_port() -> u16 {
    10051
}

fn default_zabbix_host() -> String {
    machine_hostname()
}

fn default_discovery_key() -> String {
    "apache.discovery".to_string()
}

fn default_base_key() -> String {
    "apache.acc".to_string()
}

fn default_zabbix_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_line_regex() -> String {
    DEFAULT_LINE_REGEX.to_string()
}

fn machine_hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok().filter(|s| !s.is_empty()))
        .unwrap_or_else(|| "localhost".to_string())
}

// --- Default trait impls ---

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            pattern: default_output_pattern(),
            symlink: None,
            mailbox_capacity: default_output_mailbox_capacity(),
        }
    }
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: default_accounting_mailbox_capacity(),
            latency_classes: default_latency_classes(),
            request_mappings: Vec::new(),
            static_content_regex: default_static_content_regex(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            exporter: ExporterKind::default(),
            discovery_interval: default_discovery_interval(),
            sending_interval: default_sending_interval(),
            idle_timeout: default_idle_timeout(),
            signal_drain_timeout: Duration::ZERO,
            zabbix: ZabbixConfig::default(),
        }
    }
}

impl Default for ZabbixConfig {
    fn default() -> Self {
        Self {
            server: default_zabbix_server(),
            port: default_zabbix_port(),
            host: default_zabbix_host(),
            discovery_key: default_discovery_key(),
            base_key: default_base_key(),
            timeout: default_zabbix_timeout(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            line_regex: default_line_regex(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file. Validation is left to the caller
    /// so command-line overrides can be applied first.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::from_yaml(&data).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Parse configuration from YAML text. An empty document yields defaults.
    pub fn from_yaml(data: &str) -> Result<Self> {
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(data).context("deserializing yaml")
    }

    /// Apply command-line overrides on top of file values.
    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(pattern) = overrides.output_pattern {
            self.output.pattern = pattern;
        }
        if let Some(symlink) = overrides.symlink {
            self.output.symlink = Some(symlink);
        }
        if let Some(interval) = overrides.sending_interval {
            self.telemetry.sending_interval = interval;
        }
        if let Some(interval) = overrides.discovery_interval {
            self.telemetry.discovery_interval = interval;
        }
        if let Some(timeout) = overrides.timeout {
            self.telemetry.zabbix.timeout = timeout;
        }
        if let Some(server) = overrides.zabbix_server {
            self.telemetry.zabbix.server = server;
        }
        if let Some(host) = overrides.zabbix_host {
            self.telemetry.zabbix.host = host;
        }
        if overrides.disable_telemetry {
            self.telemetry.enabled = false;
        }
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.output.mailbox_capacity == 0 {
            bail!("output.mailbox_capacity must be positive");
        }
        FilenamePattern::new(&self.output.pattern)
            .with_context(|| format!("invalid output.pattern {}", self.output.pattern))?;

        if self.accounting.mailbox_capacity == 0 {
            bail!("accounting.mailbox_capacity must be positive");
        }
        if self.accounting.latency_classes.is_empty() {
            bail!("accounting.latency_classes must not be empty");
        }
        RequestMapper::from_config(
            &self.accounting.static_content_regex,
            &self.accounting.request_mappings,
        )
        .context("invalid accounting regex")?;

        let telemetry = &self.telemetry;
        if telemetry.discovery_interval.is_zero() {
            bail!("telemetry.discovery_interval must be positive");
        }
        if telemetry.sending_interval.is_zero() {
            bail!("telemetry.sending_interval must be positive");
        }
        if telemetry.idle_timeout.is_zero() {
            bail!("telemetry.idle_timeout must be positive");
        }
        if telemetry.zabbix.timeout.is_zero() {
            bail!("telemetry.zabbix.timeout must be positive");
        }
        if telemetry.enabled && telemetry.exporter == ExporterKind::Zabbix {
            if telemetry.zabbix.server.is_empty() {
                bail!("telemetry.zabbix.server is required when the zabbix exporter is enabled");
            }
            if telemetry.zabbix.host.is_empty() {
                bail!("telemetry.zabbix.host is required when the zabbix exporter is enabled");
            }
        }

        LineParser::new(&self.ingest.line_regex).context("invalid ingest.line_regex")?;

        Ok(())
    }
}
