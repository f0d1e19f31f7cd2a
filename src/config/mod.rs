use crate::client::USERID_BASE;
use crate::protocol::Equality;
use crate::report::parse_expr;
use crate::utils::error::{PhxLoadError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub load: LoadConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub topic: TopicConfig,
    #[serde(default)]
    pub subscription: SubscriptionConfig,
    #[serde(default)]
    pub thresholds: Vec<Threshold>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(default = "default_url")]
    pub url: String,
    /// Value of the Sec-WebSocket-Protocol header sent during the upgrade
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    #[serde(default = "default_waves")]
    pub waves: u32,
    #[serde(default = "default_clients_per_wave")]
    pub clients_per_wave: u32,
    /// Delay between consecutive wave starts
    #[serde(default = "default_stagger_ms")]
    pub stagger_ms: u64,
    /// Hard stop for any client in a wave, counted from the wave's start
    #[serde(default = "default_wave_max_duration_ms")]
    pub wave_max_duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// How long each client keeps its connection open
    #[serde(default = "default_hold_ms")]
    pub hold_ms: u64,
    /// How long to wait for a subscribe reply before recording a timeout
    #[serde(default = "default_subscribe_timeout_ms")]
    pub subscribe_timeout_ms: u64,
    #[serde(default = "default_heartbeat_min_ms")]
    pub heartbeat_min_ms: u64,
    #[serde(default = "default_heartbeat_max_ms")]
    pub heartbeat_max_ms: u64,
    /// Join-ok to subscribe-send jitter window
    #[serde(default = "default_subscribe_jitter_min_ms")]
    pub subscribe_jitter_min_ms: u64,
    #[serde(default = "default_subscribe_jitter_max_ms")]
    pub subscribe_jitter_max_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TopicMode {
    /// Each client joins its own `user:<userid>` channel
    PerUser,
    /// Clients are split across a fixed topic list by ordinal modulo;
    /// the bucket index also becomes the subscription's field_value
    Bucketed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    #[serde(default = "default_topic_mode")]
    pub mode: TopicMode,
    #[serde(default)]
    pub buckets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_table_field")]
    pub table_field: String,
    #[serde(default = "default_field_value")]
    pub field_value: String,
    #[serde(default = "default_equality")]
    pub equality: Equality,
    #[serde(default = "default_order_by")]
    pub order_by: String,
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Domain event name to listen for after subscribing
    #[serde(default = "default_event")]
    pub event: String,
    #[serde(default = "default_pk")]
    pub pk: String,
}

/// A pass/fail assertion over a named series, in k6 expression syntax:
/// `rate>0.95`, `p(95)<2000`, `avg<=500`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Threshold {
    pub series: String,
    pub expr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String, // "json" or "pretty"
}

// Default values (the k6 originals' constants)
fn default_url() -> String {
    "ws://127.0.0.1:4000/realtime/websocket?vsn=2.0.0".to_string()
}

fn default_protocol() -> String {
    "phoenix".to_string()
}

fn default_waves() -> u32 {
    40
}

fn default_clients_per_wave() -> u32 {
    250
}

fn default_stagger_ms() -> u64 {
    15_000
}

fn default_wave_max_duration_ms() -> u64 {
    15 * 60 * 1000
}

fn default_hold_ms() -> u64 {
    15 * 60 * 1000
}

fn default_subscribe_timeout_ms() -> u64 {
    15_000
}

fn default_heartbeat_min_ms() -> u64 {
    50_000
}

fn default_heartbeat_max_ms() -> u64 {
    55_000
}

fn default_subscribe_jitter_min_ms() -> u64 {
    1
}

fn default_subscribe_jitter_max_ms() -> u64 {
    500
}

fn default_topic_mode() -> TopicMode {
    TopicMode::PerUser
}

fn default_table() -> String {
    "posts".to_string()
}

fn default_table_field() -> String {
    "userid".to_string()
}

fn default_field_value() -> String {
    "57".to_string()
}

fn default_equality() -> Equality {
    Equality::Eq
}

fn default_order_by() -> String {
    "updated_at desc".to_string()
}

fn default_limit() -> u32 {
    5
}

fn default_event() -> String {
    "posts".to_string()
}

fn default_pk() -> String {
    "id".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            protocol: default_protocol(),
        }
    }
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            waves: default_waves(),
            clients_per_wave: default_clients_per_wave(),
            stagger_ms: default_stagger_ms(),
            wave_max_duration_ms: default_wave_max_duration_ms(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            hold_ms: default_hold_ms(),
            subscribe_timeout_ms: default_subscribe_timeout_ms(),
            heartbeat_min_ms: default_heartbeat_min_ms(),
            heartbeat_max_ms: default_heartbeat_max_ms(),
            subscribe_jitter_min_ms: default_subscribe_jitter_min_ms(),
            subscribe_jitter_max_ms: default_subscribe_jitter_max_ms(),
        }
    }
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            mode: default_topic_mode(),
            buckets: Vec::new(),
        }
    }
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            table: default_table(),
            table_field: default_table_field(),
            field_value: default_field_value(),
            equality: default_equality(),
            order_by: default_order_by(),
            limit: default_limit(),
            event: default_event(),
            pk: default_pk(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl LoadConfig {
    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }

    pub fn wave_max_duration(&self) -> Duration {
        Duration::from_millis(self.wave_max_duration_ms)
    }
}

impl TimingConfig {
    pub fn hold(&self) -> Duration {
        Duration::from_millis(self.hold_ms)
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }
}

impl Config {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| PhxLoadError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| PhxLoadError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !self.target.url.starts_with("ws://") && !self.target.url.starts_with("wss://") {
            return Err(PhxLoadError::Config(format!(
                "target.url must be a ws:// or wss:// URL, got: {}",
                self.target.url
            )));
        }

        if self.load.waves == 0 || self.load.clients_per_wave == 0 {
            return Err(PhxLoadError::Config(
                "load.waves and load.clients_per_wave must be at least 1".to_string(),
            ));
        }

        // Ordinals are 1-based u32 and userids are USERID_BASE + ordinal, so
        // the whole population must leave that headroom
        let max_population = (u32::MAX - USERID_BASE) as u64;
        let total = self.load.waves as u64 * self.load.clients_per_wave as u64;
        if total > max_population {
            return Err(PhxLoadError::Config(format!(
                "load.waves x load.clients_per_wave = {} exceeds the supported population of {}",
                total, max_population
            )));
        }

        if self.load.wave_max_duration_ms == 0 {
            return Err(PhxLoadError::Config(
                "load.wave_max_duration_ms must be positive".to_string(),
            ));
        }

        if self.timing.hold_ms == 0 || self.timing.subscribe_timeout_ms == 0 {
            return Err(PhxLoadError::Config(
                "timing.hold_ms and timing.subscribe_timeout_ms must be positive".to_string(),
            ));
        }

        if self.timing.heartbeat_min_ms == 0
            || self.timing.heartbeat_min_ms > self.timing.heartbeat_max_ms
        {
            return Err(PhxLoadError::Config(format!(
                "heartbeat jitter window [{}, {}] is invalid",
                self.timing.heartbeat_min_ms, self.timing.heartbeat_max_ms
            )));
        }

        if self.timing.subscribe_jitter_min_ms > self.timing.subscribe_jitter_max_ms {
            return Err(PhxLoadError::Config(format!(
                "subscribe jitter window [{}, {}] is invalid",
                self.timing.subscribe_jitter_min_ms, self.timing.subscribe_jitter_max_ms
            )));
        }

        if self.topic.mode == TopicMode::Bucketed && self.topic.buckets.is_empty() {
            return Err(PhxLoadError::Config(
                "topic.mode = \"bucketed\" requires a non-empty topic.buckets list".to_string(),
            ));
        }

        for threshold in &self.thresholds {
            parse_expr(&threshold.expr).map_err(|e| {
                PhxLoadError::Config(format!(
                    "invalid threshold on series '{}': {}",
                    threshold.series, e
                ))
            })?;
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example<P: AsRef<Path>>(path: P) -> Result<()> {
        let example = r#"[target]
url = "ws://127.0.0.1:4000/realtime/websocket?vsn=2.0.0"
protocol = "phoenix"

[load]
waves = 40
clients_per_wave = 250
stagger_ms = 15000
wave_max_duration_ms = 900000

[timing]
hold_ms = 900000
subscribe_timeout_ms = 15000
heartbeat_min_ms = 50000
heartbeat_max_ms = 55000
subscribe_jitter_min_ms = 1
subscribe_jitter_max_ms = 500

[topic]
mode = "per-user"  # Options: "per-user", "bucketed"
# For bucketed mode, list the channel topics; clients are split by ordinal:
# buckets = ["rt:aaaa:0", "rt:bbbb:1", "rt:cccc:2", "rt:dddd:3"]

[subscription]
table = "posts"
table_field = "userid"
field_value = "57"
equality = "eq"      # Options: "eq", "neq", "gt", "gte", "lt", "lte"
order_by = "updated_at desc"
limit = 5
event = "posts"
pk = "id"

[[thresholds]]
series = "subscribe_ok"
expr = "rate>0.95"

[[thresholds]]
series = "subscribe_latency_ms"
expr = "p(95)<2000"

[logging]
level = "info"   # Options: "trace", "debug", "info", "warn", "error"
format = "pretty"  # Options: "pretty", "json"
"#;

        std::fs::write(path.as_ref(), example)
            .map_err(|e| PhxLoadError::Config(format!("Failed to write example config: {}", e)))?;

        Ok(())
    }
}
