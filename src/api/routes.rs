//! API route definitions.

use std::net::IpAddr;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::state::AppState;
use crate::ads::ImpressionId;
use crate::error::{AccessError, AccessResult};
use crate::mac::MacAddress;
use crate::session::{DeviceMeta, SessionId};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/access/request", post(request_access))
        .route("/access/activate", post(activate))
        .route("/access/status", get(status_by_token))
        .route("/access/status/{session_id}", get(status_by_id))
        .route("/access/disconnect", post(disconnect))
        .route("/ads/next", get(next_ad))
        .route("/ads/progress", post(ad_progress))
        .route("/ads/complete", post(ad_complete))
}

fn envelope<T: Serialize>(data: T) -> Json<Value> {
    Json(json!({
        "data": data,
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

fn bearer(headers: &HeaderMap) -> AccessResult<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AccessError::unauthorized("bearer access token required"))
}

async fn health() -> Json<Value> {
    envelope(json!({ "status": "ok" }))
}

// ---------------------------------------------------------------------------
// Access
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AccessRequestBody {
    mac_address: String,
    #[serde(default)]
    ip_address: Option<IpAddr>,
    #[serde(default)]
    device_type: Option<String>,
    #[serde(default)]
    user_agent: Option<String>,
}

async fn request_access(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<AccessRequestBody>,
) -> AccessResult<Json<Value>> {
    let mac: MacAddress = body.mac_address.parse()?;
    let user_agent = body.user_agent.or_else(|| {
        headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    });
    let meta = DeviceMeta {
        device_type: body.device_type,
        user_agent,
    };
    let session = state.manager.request_access(mac, body.ip_address, meta).await?;
    Ok(envelope(session))
}

#[derive(Debug, Deserialize)]
struct ActivateBody {
    session_id: String,
    #[serde(default)]
    completion_token: Option<String>,
}

async fn activate(
    State(state): State<AppState>,
    Json(body): Json<ActivateBody>,
) -> AccessResult<Json<Value>> {
    let session_id: SessionId = body.session_id.parse()?;
    let activation = state
        .manager
        .activate(session_id, body.completion_token.as_deref())
        .await?;
    Ok(envelope(activation))
}

async fn status_by_id(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> AccessResult<Json<Value>> {
    let session_id: SessionId = session_id.parse()?;
    Ok(envelope(state.manager.check_status(session_id).await?))
}

async fn status_by_token(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AccessResult<Json<Value>> {
    let token = bearer(&headers)?;
    Ok(envelope(state.manager.check_status_by_token(token).await?))
}

async fn disconnect(State(state): State<AppState>, headers: HeaderMap) -> AccessResult<Json<Value>> {
    let token = bearer(&headers)?;
    let session_id = state.manager.session_for_token(token)?;
    state.manager.disconnect_by_request(session_id).await?;
    Ok(envelope(json!({ "session_id": session_id, "status": "terminated" })))
}

// ---------------------------------------------------------------------------
// Ads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct NextAdQuery {
    session: String,
}

async fn next_ad(
    State(state): State<AppState>,
    Query(q): Query<NextAdQuery>,
) -> AccessResult<Json<Value>> {
    let session_id: SessionId = q.session.parse()?;
    Ok(envelope(state.gate.dispatch_ad(session_id).await?))
}

#[derive(Debug, Deserialize)]
struct ProgressBody {
    impression_id: String,
    watched_seconds: u32,
}

async fn ad_progress(
    State(state): State<AppState>,
    Json(body): Json<ProgressBody>,
) -> AccessResult<Json<Value>> {
    let id: ImpressionId = body.impression_id.parse()?;
    state.gate.report_progress(id, body.watched_seconds).await?;
    Ok(envelope(json!({ "impression_id": id, "watched_seconds": body.watched_seconds })))
}

#[derive(Debug, Deserialize)]
struct CompleteBody {
    impression_id: String,
    watched_seconds: u32,
    /// Optional echo of the ad length; must match the dispatched ad.
    #[serde(default)]
    ad_duration_seconds: Option<u32>,
}

async fn ad_complete(
    State(state): State<AppState>,
    Json(body): Json<CompleteBody>,
) -> AccessResult<Json<Value>> {
    let id: ImpressionId = body.impression_id.parse()?;
    let outcome = match body.ad_duration_seconds {
        Some(claimed) => {
            state
                .gate
                .evaluate_completion(id, body.watched_seconds, claimed, state.gate.min_watch_percentage())
                .await?
        }
        None => state.gate.evaluate(id, body.watched_seconds).await?,
    };
    Ok(envelope(outcome))
}
