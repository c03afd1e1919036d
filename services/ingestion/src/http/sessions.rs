//! Session read endpoints.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
};
use serde::Deserialize;

use super::response::{
    HttpResponse, HttpResult, bad_request, internal_error, not_found, parse_non_negative,
};
use crate::auth::{Actor, ensure_org};
use crate::repo::sessions::{self, STATUS_ACTIVE, STATUS_CLOSED, SessionFilter, SessionRow};
use crate::repo::{events, points};
use crate::state::AppState;

const SESSIONS_DEFAULT_LIMIT: i64 = 50;
const TELEMETRY_DEFAULT_LIMIT: i64 = 2000;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionsQuery {
    org_id: Option<String>,
    site_id: Option<String>,
    machine_id: Option<String>,
    status: Option<String>,
    limit: Option<String>,
    offset: Option<String>,
}

/// Resolve the effective org scope: users are pinned to their own org and a
/// conflicting explicit filter is a 403; SYSTEM may query any org.
pub(crate) fn effective_org(
    actor: &Actor,
    requested: Option<String>,
) -> Result<Option<String>, HttpResponse> {
    match actor.org_id() {
        None => Ok(requested),
        Some(own) => {
            if let Some(requested) = &requested {
                ensure_org(actor, requested)?;
            }
            Ok(Some(own.to_owned()))
        }
    }
}

/// Load a session and enforce org isolation, mapping absence to 404.
pub(crate) async fn load_session_checked(
    state: &AppState,
    actor: &Actor,
    session_id: &str,
) -> Result<SessionRow, HttpResponse> {
    let session = sessions::get_session(&state.pool, session_id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| not_found("session not found"))?;
    ensure_org(actor, &session.org_id)?;
    Ok(session)
}

/// GET /sessions
pub async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<SessionsQuery>,
) -> HttpResult<impl IntoResponse> {
    let actor = state.auth.authenticate(&headers).await?;
    let limit = parse_non_negative(params.limit.as_deref(), "limit", SESSIONS_DEFAULT_LIMIT)?;
    let offset = parse_non_negative(params.offset.as_deref(), "offset", 0)?;

    let status = match params.status.as_deref() {
        None => None,
        Some(s @ (STATUS_ACTIVE | STATUS_CLOSED)) => Some(s.to_owned()),
        Some(_) => return Err(bad_request("status must be ACTIVE or CLOSED")),
    };

    let filter = SessionFilter {
        org_id: effective_org(&actor, params.org_id)?,
        site_id: params.site_id,
        machine_id: params.machine_id,
        status,
    };
    let rows = sessions::list_sessions(&state.pool, &filter, limit, offset)
        .await
        .map_err(internal_error)?;
    Ok(Json(serde_json::json!({
        "sessions": rows,
        "limit": limit,
        "offset": offset,
    })))
}

/// GET /sessions/{id}
pub async fn get_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> HttpResult<impl IntoResponse> {
    let actor = state.auth.authenticate(&headers).await?;
    let session = load_session_checked(&state, &actor, &session_id).await?;
    Ok(Json(session))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryQuery {
    limit: Option<String>,
    from_elapsed_seconds: Option<String>,
    to_elapsed_seconds: Option<String>,
}

fn parse_elapsed(value: Option<&str>, name: &str) -> Result<Option<f64>, HttpResponse> {
    match value {
        None => Ok(None),
        Some(raw) => match raw.parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(Some(v)),
            _ => Err(bad_request(format!("{name} must be a number"))),
        },
    }
}

/// GET /sessions/{id}/telemetry
pub async fn get_session_telemetry(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Query(params): Query<TelemetryQuery>,
) -> HttpResult<impl IntoResponse> {
    let actor = state.auth.authenticate(&headers).await?;
    let limit = parse_non_negative(params.limit.as_deref(), "limit", TELEMETRY_DEFAULT_LIMIT)?;
    let from = parse_elapsed(params.from_elapsed_seconds.as_deref(), "fromElapsedSeconds")?;
    let to = parse_elapsed(params.to_elapsed_seconds.as_deref(), "toElapsedSeconds")?;

    load_session_checked(&state, &actor, &session_id).await?;
    let rows = points::fetch_session_telemetry(&state.pool, &session_id, limit, from, to)
        .await
        .map_err(internal_error)?;
    Ok(Json(serde_json::json!({ "telemetry": rows })))
}

/// GET /sessions/{id}/events
pub async fn get_session_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> HttpResult<impl IntoResponse> {
    let actor = state.auth.authenticate(&headers).await?;
    load_session_checked(&state, &actor, &session_id).await?;
    let rows = events::fetch_session_events(&state.pool, &session_id)
        .await
        .map_err(internal_error)?;
    Ok(Json(serde_json::json!({ "events": rows })))
}
