//! Report endpoints.  Creation is idempotent on `(sessionId, reportKind)`:
//! the first POST returns 201, replays return 200 with the original row.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use chrono::Utc;
use roast_protocol::DEFAULT_REPORT_KIND;
use serde::Deserialize;

use super::response::{HttpResult, bad_request, internal_error, not_found, parse_non_negative};
use super::sessions::load_session_checked;
use crate::repo::reports;
use crate::state::AppState;

const REPORTS_DEFAULT_LIMIT: i64 = 50;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportsQuery {
    limit: Option<String>,
    offset: Option<String>,
}

/// GET /sessions/{id}/reports
pub async fn list_reports(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Query(params): Query<ReportsQuery>,
) -> HttpResult<impl IntoResponse> {
    let actor = state.auth.authenticate(&headers).await?;
    let limit = parse_non_negative(params.limit.as_deref(), "limit", REPORTS_DEFAULT_LIMIT)?;
    let offset = parse_non_negative(params.offset.as_deref(), "offset", 0)?;
    load_session_checked(&state, &actor, &session_id).await?;
    let rows = reports::list_reports(&state.pool, &session_id, limit, offset)
        .await
        .map_err(internal_error)?;
    Ok(Json(serde_json::json!({ "reports": rows })))
}

/// GET /sessions/{id}/reports/latest
pub async fn latest_report(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> HttpResult<impl IntoResponse> {
    let actor = state.auth.authenticate(&headers).await?;
    load_session_checked(&state, &actor, &session_id).await?;
    let row = reports::latest_report(&state.pool, &session_id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| not_found("no reports for session"))?;
    Ok(Json(row))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewReport {
    report_kind: Option<String>,
    body: Option<serde_json::Value>,
}

/// POST /sessions/{id}/reports
pub async fn create_report(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(request): Json<NewReport>,
) -> HttpResult<impl IntoResponse> {
    let actor = state.auth.authenticate(&headers).await?;
    let report_kind = request
        .report_kind
        .unwrap_or_else(|| DEFAULT_REPORT_KIND.to_owned());
    if report_kind.trim().is_empty() {
        return Err(bad_request("reportKind must not be empty"));
    }
    let body = request.body.unwrap_or_else(|| serde_json::json!({}));

    load_session_checked(&state, &actor, &session_id).await?;
    let (row, created) = reports::create_report(&state.pool, &session_id, &report_kind, &body, Utc::now())
        .await
        .map_err(internal_error)?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(row)))
}

/// GET /reports/{reportId}
pub async fn get_report(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(report_id): Path<String>,
) -> HttpResult<impl IntoResponse> {
    let actor = state.auth.authenticate(&headers).await?;
    let row = reports::get_report(&state.pool, &report_id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| not_found("report not found"))?;
    load_session_checked(&state, &actor, &row.session_id).await?;
    Ok(Json(row))
}
