//! Domain types shared across the bot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Predictions ───────────────────────────────────────────────────────

/// One upcoming vehicle event at a stop, flattened from the MBTA JSON:API
/// response. Serialized camelCase — this is the wire format the dashboard
/// consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub id: String,
    /// 0 = outbound, 1 = inbound.
    pub direction_id: Option<i32>,
    pub direction: String,
    pub status: Option<String>,
    pub arrival_time: Option<DateTime<Utc>>,
    pub departure_time: Option<DateTime<Utc>>,
    /// Minutes until the best-known event time, rounded, derived at fetch.
    pub minutes: Option<i64>,
    pub route_id: Option<String>,
    pub route_name: Option<String>,
    pub headsign: Option<String>,
}

/// Human direction label for an MBTA direction_id.
pub fn direction_label(direction_id: Option<i32>) -> &'static str {
    match direction_id {
        Some(0) => "Outbound",
        _ => "Inbound",
    }
}

/// One successful fetch for a stop. Immutable once returned by the source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionPayload {
    pub stop_id: String,
    pub fetched_at: DateTime<Utc>,
    pub predictions: Vec<Prediction>,
}

/// One upstream predictions call: stop plus filters and a result limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictionQuery {
    pub stop_id: String,
    pub route_type: Option<i32>,
    pub route_id: Option<String>,
    pub limit: u32,
}

impl PredictionQuery {
    pub fn cache_key(&self) -> CacheKey {
        CacheKey {
            stop_id: self.stop_id.clone(),
            route_type: self.route_type,
            route_id: self.route_id.clone(),
        }
    }
}

/// Identity of one cache entry. Two queries with the same logical filters
/// map to the same key regardless of their result limit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub stop_id: String,
    pub route_type: Option<i32>,
    pub route_id: Option<String>,
}

/// Where a cache read's payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    FreshCache,
    FreshFetch,
    StaleCache,
    StaleAfterFailedRefetch,
}

impl Provenance {
    pub fn cached(self) -> bool {
        !matches!(self, Provenance::FreshFetch)
    }

    pub fn stale(self) -> bool {
        matches!(
            self,
            Provenance::StaleCache | Provenance::StaleAfterFailedRefetch
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Provenance::FreshCache => "fresh-cache",
            Provenance::FreshFetch => "fresh-fetch",
            Provenance::StaleCache => "stale-cache",
            Provenance::StaleAfterFailedRefetch => "stale-after-failed-refetch",
        }
    }
}

// ── Automation windows ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowMode {
    OutboundArrival,
    InboundDeparture,
}

impl WindowMode {
    pub fn as_str(self) -> &'static str {
        match self {
            WindowMode::OutboundArrival => "outbound_arrival",
            WindowMode::InboundDeparture => "inbound_departure",
        }
    }
}

/// A derived interval during which the automation should be active,
/// anchored to one prediction. Recomputed every evaluation, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictionWindow {
    pub id: String,
    pub mode: WindowMode,
    pub direction: String,
    pub summary: String,
    pub event_at: DateTime<Utc>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
}

impl PredictionWindow {
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.start_at <= now && now <= self.end_at
    }

    pub fn summarize(&self) -> WindowSummary {
        WindowSummary {
            id: self.id.clone(),
            mode: self.mode,
            direction: self.direction.clone(),
            summary: self.summary.clone(),
            start_at: self.start_at,
            end_at: self.end_at,
            event_at: self.event_at,
        }
    }
}

/// Serialized form of a window for the status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowSummary {
    pub id: String,
    pub mode: WindowMode,
    pub direction: String,
    pub summary: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub event_at: DateTime<Utc>,
}

// ── Automation state ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Raise,
    Restore,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Raise => "raise",
            ActionKind::Restore => "restore",
        }
    }

    /// The physical effect a successful delivery of this action implies.
    pub fn effect(self) -> bool {
        matches!(self, ActionKind::Raise)
    }
}

impl std::str::FromStr for ActionKind {
    type Err = crate::error::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "raise" => Ok(ActionKind::Raise),
            "restore" => Ok(ActionKind::Restore),
            other => Err(crate::error::Error::InvalidAction(format!(
                "action must be \"raise\" or \"restore\", got {:?}",
                other
            ))),
        }
    }
}

/// Snapshot of the automation engine, served at GET /api/automation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationStatus {
    pub enabled: bool,
    /// Intended state, derived from windows.
    pub active: bool,
    /// Last successfully delivered effect; None until a delivery succeeds.
    pub confirmed_active: Option<bool>,
    pub config: AutomationConfigSummary,
    pub last_error: Option<String>,
    pub last_evaluated_at: Option<DateTime<Utc>>,
    pub last_changed_at: Option<DateTime<Utc>>,
    pub last_action: Option<ActionKind>,
    pub last_action_at: Option<DateTime<Utc>>,
    pub last_action_error: Option<String>,
    pub current_window: Option<WindowSummary>,
    pub next_window: Option<WindowSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationConfigSummary {
    pub stop_id: String,
    pub stop_name: String,
    pub route_id: String,
    pub lead_minutes: f64,
    pub pass_seconds: u64,
    pub poll_seconds: u64,
    pub has_webhook: bool,
    pub has_raise_command: bool,
    pub has_restore_command: bool,
}

// ── Pinned stops ──────────────────────────────────────────────────────

/// A stop the background refresher keeps warm. The persistent pin store is
/// an external collaborator; this is its read-only shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinnedStop {
    pub stop_id: String,
    pub name: String,
    #[serde(default = "default_route_type")]
    pub route_type: Option<i32>,
    #[serde(default)]
    pub route_id: Option<String>,
}

fn default_route_type() -> Option<i32> {
    Some(1)
}
