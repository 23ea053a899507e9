//! Bot configuration types.

use serde::{Deserialize, Serialize};

use crate::types::PinnedStop;

/// Top-level bot configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// MBTA v3 API key. Optional — anonymous requests work at a lower
    /// upstream rate tier.
    #[serde(default)]
    pub mbta_api_key: String,

    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Prediction cache settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Background refresher settings.
    #[serde(default)]
    pub refresher: RefresherConfig,

    /// Volume automation settings.
    #[serde(default)]
    pub automation: AutomationConfig,

    /// Stops the refresher keeps warm. Merged with the optional stops file
    /// at startup.
    #[serde(default = "default_pinned_stops")]
    pub stops: Vec<PinnedStop>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            mbta_api_key: String::new(),
            server: ServerConfig::default(),
            cache: CacheConfig::default(),
            refresher: RefresherConfig::default(),
            automation: AutomationConfig::default(),
            stops: default_pinned_stops(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// How long a successful fetch stays fresh (seconds).
    #[serde(default = "default_fresh_ttl")]
    pub fresh_ttl_secs: u64,

    /// Total age up to which a payload may still be served, marked stale.
    /// Must be strictly greater than the fresh TTL.
    #[serde(default = "default_stale_ttl")]
    pub stale_ttl_secs: u64,

    /// Per-fetch upstream timeout (seconds).
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// page[limit] for on-demand reads.
    #[serde(default = "default_read_limit")]
    pub result_limit: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fresh_ttl_secs: default_fresh_ttl(),
            stale_ttl_secs: default_stale_ttl(),
            fetch_timeout_secs: default_fetch_timeout(),
            result_limit: default_read_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefresherConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Target duration of one full pass over the pinned stops (seconds).
    #[serde(default = "default_refresh_interval")]
    pub poll_interval_secs: u64,

    /// Fixed delay between consecutive stops within a pass (milliseconds).
    #[serde(default = "default_stop_delay")]
    pub stop_delay_ms: u64,
}

impl Default for RefresherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: default_refresh_interval(),
            stop_delay_ms: default_stop_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Evaluation tick interval (seconds). Clamped to >= 3.
    #[serde(default = "default_automation_poll")]
    pub poll_seconds: u64,

    /// Designated stop the automation watches.
    #[serde(default = "default_automation_stop_id")]
    pub stop_id: String,

    #[serde(default = "default_automation_stop_name")]
    pub stop_name: String,

    #[serde(default = "default_automation_route_type")]
    pub route_type: i32,

    #[serde(default = "default_automation_route_id")]
    pub route_id: String,

    /// Offset before an outbound arrival (or after an inbound departure)
    /// at which a window opens (minutes). Clamped to >= 0.
    #[serde(default = "default_lead_minutes")]
    pub lead_minutes: f64,

    /// How long a window stays open past its anchor (seconds).
    /// Clamped to >= 10.
    #[serde(default = "default_pass_seconds")]
    pub pass_seconds: u64,

    /// page[limit] for automation fetches. Clamped to >= 6.
    #[serde(default = "default_automation_limit")]
    pub result_limit: u32,

    /// Webhook delivery channel; disabled when empty.
    #[serde(default)]
    pub webhook_url: String,

    /// Bearer token for the webhook channel.
    #[serde(default)]
    pub webhook_token: String,

    /// Local command run on raise; disabled when empty.
    #[serde(default)]
    pub raise_command: String,

    /// Local command run on restore; disabled when empty.
    #[serde(default)]
    pub restore_command: String,

    /// Hard timeout for command delivery (seconds).
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_seconds: default_automation_poll(),
            stop_id: default_automation_stop_id(),
            stop_name: default_automation_stop_name(),
            route_type: default_automation_route_type(),
            route_id: default_automation_route_id(),
            lead_minutes: default_lead_minutes(),
            pass_seconds: default_pass_seconds(),
            result_limit: default_automation_limit(),
            webhook_url: String::new(),
            webhook_token: String::new(),
            raise_command: String::new(),
            restore_command: String::new(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

impl AutomationConfig {
    /// Apply the soft minimums the engine assumes.
    pub fn clamped(mut self) -> Self {
        self.poll_seconds = self.poll_seconds.max(3);
        self.pass_seconds = self.pass_seconds.max(10);
        self.result_limit = self.result_limit.max(6);
        self.lead_minutes = self.lead_minutes.max(0.0);
        self
    }
}

// ── Defaults ──────────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    4000
}

fn default_fresh_ttl() -> u64 {
    10
}
fn default_stale_ttl() -> u64 {
    60
}
fn default_fetch_timeout() -> u64 {
    8
}
fn default_read_limit() -> u32 {
    16
}

fn default_refresh_interval() -> u64 {
    30
}
fn default_stop_delay() -> u64 {
    750
}

fn default_automation_poll() -> u64 {
    10
}
fn default_automation_stop_id() -> String {
    "place-orhte".into()
}
fn default_automation_stop_name() -> String {
    "Orient Heights".into()
}
fn default_automation_route_type() -> i32 {
    1
}
fn default_automation_route_id() -> String {
    "Blue".into()
}
fn default_lead_minutes() -> f64 {
    1.15
}
fn default_pass_seconds() -> u64 {
    90
}
fn default_automation_limit() -> u32 {
    14
}
fn default_command_timeout() -> u64 {
    8
}

fn default_pinned_stops() -> Vec<PinnedStop> {
    vec![PinnedStop {
        stop_id: "place-sdmnl".into(),
        name: "Suffolk Downs".into(),
        route_type: Some(1),
        route_id: None,
    }]
}
