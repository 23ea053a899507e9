//! HTTP surface: prediction reads and automation control.
//!
//! The cache and the engine are owned by main and handed in as shared
//! handles; handlers hold no state of their own.

use std::sync::Arc;

use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse, Responder};
use serde::{Deserialize, Serialize};
use serde_json::json;

use automation::VolumeAutomation;
use common::{ActionKind, PinnedStop, PredictionPayload, PredictionQuery};
use predictions::{CacheReadOptions, PredictionCache};

pub struct ApiState {
    pub cache: PredictionCache,
    pub automation: Arc<VolumeAutomation>,
    pub stops: Vec<PinnedStop>,
    pub read_limit: u32,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(pinned_stops)
        .service(stop_predictions)
        .service(automation_status)
        .service(automation_trigger);
}

fn bad_request(message: &str) -> HttpResponse {
    HttpResponse::BadRequest().json(json!({ "error": message }))
}

#[actix_web::get("/api/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().json(json!({ "ok": true, "service": "headway-bot" }))
}

#[actix_web::get("/api/stops")]
async fn pinned_stops(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(json!({ "stops": state.stops }))
}

#[derive(Debug, Deserialize)]
struct PredictionsParams {
    #[serde(rename = "routeType")]
    route_type: Option<String>,
    #[serde(rename = "routeId")]
    route_id: Option<String>,
    refresh: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PredictionsResponse {
    #[serde(flatten)]
    payload: PredictionPayload,
    cached: bool,
    stale: bool,
    source: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn parse_flag(raw: Option<&str>) -> bool {
    matches!(
        raw.map(|s| s.trim().to_ascii_lowercase()).as_deref(),
        Some("1") | Some("true") | Some("yes") | Some("on")
    )
}

#[actix_web::get("/api/stops/{stop_id}/predictions")]
async fn stop_predictions(
    path: web::Path<String>,
    params: web::Query<PredictionsParams>,
    state: web::Data<ApiState>,
) -> impl Responder {
    let stop_id = path.into_inner().trim().to_string();
    if stop_id.is_empty() {
        return bad_request("stopId is required");
    }

    // Route type defaults to subway; anything non-numeric is a caller bug.
    let route_type = match params.route_type.as_deref().map(str::trim) {
        None | Some("") => Some(1),
        Some(raw) => match raw.parse::<i32>() {
            Ok(value) => Some(value),
            Err(_) => return bad_request("routeType must be a number"),
        },
    };

    let route_id = params
        .route_id
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string);

    let query = PredictionQuery {
        stop_id,
        route_type,
        route_id,
        limit: state.read_limit,
    };
    let opts = CacheReadOptions {
        force_refresh: parse_flag(params.refresh.as_deref()),
        allow_stale: true,
    };

    match state.cache.get(&query, opts).await {
        Ok(hit) => HttpResponse::Ok().json(PredictionsResponse {
            payload: (*hit.payload).clone(),
            cached: hit.provenance.cached(),
            stale: hit.provenance.stale(),
            source: hit.provenance.as_str(),
            error: hit.upstream_error,
        }),
        Err(e) => {
            let status = StatusCode::from_u16(e.upstream_status())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            HttpResponse::build(status).json(json!({
                "error": "Failed to fetch predictions",
                "details": e.to_string(),
            }))
        }
    }
}

#[actix_web::get("/api/automation")]
async fn automation_status(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(state.automation.status())
}

#[derive(Debug, Deserialize)]
struct TriggerBody {
    action: Option<String>,
}

#[actix_web::post("/api/automation/trigger")]
async fn automation_trigger(
    body: web::Json<TriggerBody>,
    state: web::Data<ApiState>,
) -> impl Responder {
    let action: ActionKind = match body.action.as_deref().unwrap_or_default().parse() {
        Ok(action) => action,
        Err(e) => return bad_request(&e.to_string()),
    };

    match state.automation.trigger_manual(action).await {
        Ok(status) => HttpResponse::Ok().json(status),
        Err(e) => HttpResponse::BadGateway().json(json!({
            "error": "Action delivery failed",
            "details": e.to_string(),
        })),
    }
}
