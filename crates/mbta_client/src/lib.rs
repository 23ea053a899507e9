//! REST client for the MBTA v3 API.
//!
//! Covers the one upstream read the bot needs: stop predictions with route
//! filters, joined against their included route and trip resources.

pub mod rate_limit;

use std::error::Error as StdError;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{direction_label, Error, Prediction, PredictionPayload, PredictionQuery, Result};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::rate_limit::RateLimiter;

const DEFAULT_BASE_URL: &str = "https://api-v3.mbta.com";

fn normalize_base_url(raw: &str) -> String {
    raw.trim().trim_end_matches('/').to_string()
}

fn resolve_base_url() -> String {
    if let Ok(override_url) = std::env::var("MBTA_API_BASE_URL") {
        let normalized = normalize_base_url(&override_url);
        if !normalized.is_empty() {
            info!("Using MBTA_API_BASE_URL override: {}", normalized);
            return normalized;
        }
        warn!("Ignoring empty MBTA_API_BASE_URL override");
    }

    DEFAULT_BASE_URL.to_string()
}

fn format_reqwest_error(err: &reqwest::Error) -> String {
    // Keep chained causes so network failures (DNS/TLS/socket) are visible.
    let mut message = err.to_string();
    let mut source = err.source();

    while let Some(cause) = source {
        let cause_msg = cause.to_string();
        if !cause_msg.is_empty() && !message.contains(&cause_msg) {
            message.push_str(": ");
            message.push_str(&cause_msg);
        }
        source = cause.source();
    }

    message
}

fn summarize_response_body(raw: &str) -> String {
    const MAX_CHARS: usize = 800;
    let compact = raw.replace('\n', " ").replace('\r', " ");
    if compact.len() > MAX_CHARS {
        format!("{}…", &compact[..MAX_CHARS])
    } else {
        compact
    }
}

// ── JSON:API response types ───────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct ApiDocument {
    #[serde(default)]
    data: Vec<ApiResource>,
    #[serde(default)]
    included: Vec<ApiResource>,
}

#[derive(Debug, Deserialize)]
struct ApiResource {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    attributes: serde_json::Value,
    #[serde(default)]
    relationships: serde_json::Value,
}

impl ApiResource {
    fn relationship_id(&self, name: &str) -> Option<&str> {
        self.relationships
            .get(name)?
            .get("data")?
            .get("id")?
            .as_str()
    }
}

#[derive(Debug, Default, Deserialize)]
struct PredictionAttributes {
    #[serde(default)]
    arrival_time: Option<DateTime<Utc>>,
    #[serde(default)]
    departure_time: Option<DateTime<Utc>>,
    #[serde(default)]
    direction_id: Option<i32>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RouteAttributes {
    #[serde(default)]
    long_name: Option<String>,
    #[serde(default)]
    short_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TripAttributes {
    #[serde(default)]
    headsign: Option<String>,
}

fn attributes_of<T: Default + for<'de> Deserialize<'de>>(resource: &ApiResource) -> T {
    serde_json::from_value(resource.attributes.clone()).unwrap_or_default()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// Minutes until `at`, rounded to the nearest minute.
fn minutes_from(now: DateTime<Utc>, at: DateTime<Utc>) -> i64 {
    let millis = (at - now).num_milliseconds() as f64;
    (millis / 60_000.0).round() as i64
}

fn find_included<'a>(doc: &'a ApiDocument, kind: &str, id: &str) -> Option<&'a ApiResource> {
    doc.included
        .iter()
        .find(|res| res.kind == kind && res.id == id)
}

/// Flatten a predictions document into the bot's wire shape, joining each
/// prediction to its included route and trip.
fn flatten_document(doc: &ApiDocument, stop_id: &str, now: DateTime<Utc>) -> PredictionPayload {
    let predictions = doc
        .data
        .iter()
        .map(|item| {
            let attrs: PredictionAttributes = attributes_of(item);

            let route_rel = item.relationship_id("route").map(str::to_string);
            let trip_rel = item.relationship_id("trip");

            let route = route_rel
                .as_deref()
                .and_then(|id| find_included(doc, "route", id));
            let trip = trip_rel.and_then(|id| find_included(doc, "trip", id));

            let route_name = route.and_then(|r| {
                let attrs: RouteAttributes = attributes_of(r);
                non_empty(attrs.long_name).or_else(|| non_empty(attrs.short_name))
            });
            let headsign = trip.and_then(|t| {
                let attrs: TripAttributes = attributes_of(t);
                non_empty(attrs.headsign)
            });

            let best_time = attrs.arrival_time.or(attrs.departure_time);

            Prediction {
                id: item.id.clone(),
                direction_id: attrs.direction_id,
                direction: direction_label(attrs.direction_id).to_string(),
                status: attrs.status,
                arrival_time: attrs.arrival_time,
                departure_time: attrs.departure_time,
                minutes: best_time.map(|at| minutes_from(now, at)),
                route_id: route.map(|r| r.id.clone()).or(route_rel),
                route_name,
                headsign,
            }
        })
        .collect();

    PredictionPayload {
        stop_id: stop_id.to_string(),
        fetched_at: now,
        predictions,
    }
}

// ── Client ────────────────────────────────────────────────────────────

/// Async client for the MBTA predictions endpoint.
#[derive(Debug, Clone)]
pub struct MbtaClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    limiter: RateLimiter,
}

impl MbtaClient {
    /// Create a new client. `timeout` bounds every upstream call.
    pub fn new(api_key: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .tcp_keepalive(Duration::from_secs(30))
            .timeout(timeout)
            .build()
            .expect("failed to build reqwest client");

        let limiter = if api_key.is_empty() {
            RateLimiter::anonymous()
        } else {
            RateLimiter::keyed()
        };

        Self {
            client,
            base_url: resolve_base_url(),
            api_key: api_key.to_string(),
            limiter,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Fetch predictions for one stop, with optional route-type and route
    /// filters, sorted by arrival time.
    pub async fn fetch_stop_predictions(
        &self,
        query: &PredictionQuery,
    ) -> Result<PredictionPayload> {
        self.limiter.wait_read().await;

        let mut req = self
            .client
            .get(self.url("/predictions"))
            .query(&[("filter[stop]", query.stop_id.as_str())])
            .query(&[("include", "route,trip"), ("sort", "arrival_time")])
            .query(&[("page[limit]", &query.limit.to_string())]);

        if let Some(route_type) = query.route_type {
            req = req.query(&[("filter[route_type]", &route_type.to_string())]);
        }
        if let Some(route_id) = query.route_id.as_deref().filter(|r| !r.is_empty()) {
            req = req.query(&[("filter[route]", route_id)]);
        }
        if !self.api_key.is_empty() {
            req = req.header("x-api-key", &self.api_key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| Error::Http(format_reqwest_error(&e)))?;

        let status_code = resp.status().as_u16();
        if status_code != 200 {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::MbtaApi {
                status: status_code,
                message: summarize_response_body(&body),
            });
        }

        let doc: ApiDocument = resp
            .json()
            .await
            .map_err(|e| Error::Http(format_reqwest_error(&e)))?;

        let payload = flatten_document(&doc, &query.stop_id, Utc::now());

        debug!(
            "Fetched {} predictions for {}",
            payload.predictions.len(),
            query.stop_id
        );

        Ok(payload)
    }
}
