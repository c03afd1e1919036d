//! QC endpoints: session metadata, notes, and event overrides.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
};
use chrono::Utc;
use serde::Deserialize;

use super::response::{HttpResult, bad_request, internal_error, parse_non_negative};
use super::sessions::load_session_checked;
use crate::repo::meta;
use crate::state::AppState;

const NOTES_DEFAULT_LIMIT: i64 = 50;

/// GET /sessions/{id}/meta
pub async fn get_meta(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> HttpResult<impl IntoResponse> {
    let actor = state.auth.authenticate(&headers).await?;
    load_session_checked(&state, &actor, &session_id).await?;
    let meta = meta::get_meta(&state.pool, &session_id)
        .await
        .map_err(internal_error)?
        .unwrap_or_else(|| serde_json::json!({}));
    Ok(Json(serde_json::json!({ "meta": meta })))
}

/// PUT /sessions/{id}/meta
pub async fn put_meta(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> HttpResult<impl IntoResponse> {
    let actor = state.auth.authenticate(&headers).await?;
    if !body.is_object() {
        return Err(bad_request("meta must be a JSON object"));
    }
    load_session_checked(&state, &actor, &session_id).await?;
    meta::put_meta(&state.pool, &session_id, &body, Utc::now())
        .await
        .map_err(internal_error)?;
    Ok(Json(serde_json::json!({ "meta": body })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotesQuery {
    limit: Option<String>,
    offset: Option<String>,
}

/// GET /sessions/{id}/notes
pub async fn list_notes(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Query(params): Query<NotesQuery>,
) -> HttpResult<impl IntoResponse> {
    let actor = state.auth.authenticate(&headers).await?;
    let limit = parse_non_negative(params.limit.as_deref(), "limit", NOTES_DEFAULT_LIMIT)?;
    let offset = parse_non_negative(params.offset.as_deref(), "offset", 0)?;
    load_session_checked(&state, &actor, &session_id).await?;
    let notes = meta::list_notes(&state.pool, &session_id, limit, offset)
        .await
        .map_err(internal_error)?;
    Ok(Json(serde_json::json!({ "notes": notes })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewNote {
    author: Option<String>,
    body: Option<String>,
}

/// POST /sessions/{id}/notes
pub async fn add_note(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(note): Json<NewNote>,
) -> HttpResult<impl IntoResponse> {
    let actor = state.auth.authenticate(&headers).await?;
    let body = match note.body.as_deref() {
        Some(body) if !body.trim().is_empty() => body,
        _ => return Err(bad_request("body is required")),
    };
    load_session_checked(&state, &actor, &session_id).await?;
    let row = meta::add_note(
        &state.pool,
        &session_id,
        note.author.as_deref(),
        body,
        Utc::now(),
    )
    .await
    .map_err(internal_error)?;
    Ok((axum::http::StatusCode::CREATED, Json(row)))
}

/// GET /sessions/{id}/events/overrides
pub async fn get_overrides(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> HttpResult<impl IntoResponse> {
    let actor = state.auth.authenticate(&headers).await?;
    load_session_checked(&state, &actor, &session_id).await?;
    let overrides = meta::get_overrides(&state.pool, &session_id)
        .await
        .map_err(internal_error)?
        .unwrap_or_else(|| serde_json::json!({}));
    Ok(Json(serde_json::json!({ "overrides": overrides })))
}

/// PUT /sessions/{id}/events/overrides
pub async fn put_overrides(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> HttpResult<impl IntoResponse> {
    let actor = state.auth.authenticate(&headers).await?;
    if !body.is_object() {
        return Err(bad_request("overrides must be a JSON object"));
    }
    load_session_checked(&state, &actor, &session_id).await?;
    meta::put_overrides(&state.pool, &session_id, &body, Utc::now())
        .await
        .map_err(internal_error)?;
    Ok(Json(serde_json::json!({ "overrides": body })))
}
