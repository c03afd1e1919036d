//! The live surface: Server-Sent Events streams plus recent-item reads
//! against the in-memory rings.
//!
//! Each SSE connection holds one live-store subscription; when the client
//! goes away axum drops the stream, the subscription record drops with it,
//! and the store stops fanning out to this consumer.

use axum::{
    Json,
    extract::{Query, State},
    http::HeaderMap,
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures_util::stream::{Stream, unfold};
use roast_protocol::StreamFilter;
use serde::Deserialize;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::StreamExt;

use super::response::{HttpResult, parse_non_negative};
use super::sessions::effective_org;
use crate::live::{LiveStore, Routed};
use crate::state::AppState;

const LIVE_DEFAULT_LIMIT: i64 = 100;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    org_id: Option<String>,
    site_id: Option<String>,
    machine_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveQuery {
    org_id: Option<String>,
    site_id: Option<String>,
    machine_id: Option<String>,
    limit: Option<String>,
}

fn live_sse<T>(
    store: &LiveStore<T>,
    filter: StreamFilter,
    event_name: &'static str,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + use<T>>
where
    T: Routed + serde::Serialize,
{
    let subscription = store.subscribe(filter);
    let updates = unfold(subscription, |mut subscription| async move {
        subscription.recv().await.map(|item| (item, subscription))
    })
    .filter_map(move |item| match serde_json::to_string(&item) {
        Ok(json) => Some(Ok(Event::default().event(event_name).data(json))),
        Err(_) => None,
    });
    let initial = tokio_stream::once(Ok::<Event, Infallible>(
        Event::default().event("connected").data("{}"),
    ));
    let stream = initial.chain(updates);

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}

async fn scoped_filter(
    state: &AppState,
    headers: &HeaderMap,
    params: StreamQuery,
) -> HttpResult<StreamFilter> {
    let actor = state.auth.authenticate(headers).await?;
    Ok(StreamFilter {
        org_id: effective_org(&actor, params.org_id)?,
        site_id: params.site_id,
        machine_id: params.machine_id,
    })
}

/// GET /stream/telemetry
pub async fn stream_telemetry(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<StreamQuery>,
) -> HttpResult<impl IntoResponse> {
    let filter = scoped_filter(&state, &headers, params).await?;
    Ok(live_sse(&state.live.telemetry, filter, "telemetry"))
}

/// GET /stream/events
pub async fn stream_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<StreamQuery>,
) -> HttpResult<impl IntoResponse> {
    let filter = scoped_filter(&state, &headers, params).await?;
    Ok(live_sse(&state.live.events, filter, "event"))
}

/// GET /stream/envelopes/telemetry
pub async fn stream_telemetry_envelopes(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<StreamQuery>,
) -> HttpResult<impl IntoResponse> {
    let filter = scoped_filter(&state, &headers, params).await?;
    Ok(live_sse(&state.live.telemetry_envelopes, filter, "envelope"))
}

/// GET /stream/envelopes/events
pub async fn stream_event_envelopes(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<StreamQuery>,
) -> HttpResult<impl IntoResponse> {
    let filter = scoped_filter(&state, &headers, params).await?;
    Ok(live_sse(&state.live.event_envelopes, filter, "envelope"))
}

/// GET /live/telemetry — recent samples from the in-memory ring, newest
/// first.
pub async fn recent_telemetry(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<LiveQuery>,
) -> HttpResult<impl IntoResponse> {
    let limit = parse_non_negative(params.limit.as_deref(), "limit", LIVE_DEFAULT_LIMIT)?;
    let filter = scoped_filter(
        &state,
        &headers,
        StreamQuery {
            org_id: params.org_id,
            site_id: params.site_id,
            machine_id: params.machine_id,
        },
    )
    .await?;
    let rows = state.live.telemetry.query(&filter, limit as usize);
    Ok(Json(serde_json::json!({ "telemetry": rows })))
}

/// GET /live/events — recent events from the in-memory ring, newest first.
pub async fn recent_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<LiveQuery>,
) -> HttpResult<impl IntoResponse> {
    let limit = parse_non_negative(params.limit.as_deref(), "limit", LIVE_DEFAULT_LIMIT)?;
    let filter = scoped_filter(
        &state,
        &headers,
        StreamQuery {
            org_id: params.org_id,
            site_id: params.site_id,
            machine_id: params.machine_id,
        },
    )
    .await?;
    let rows = state.live.events.query(&filter, limit as usize);
    Ok(Json(serde_json::json!({ "events": rows })))
}
