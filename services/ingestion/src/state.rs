use sqlx::SqlitePool;
use std::sync::Arc;

use crate::auth::AuthGate;
use crate::live::LiveFeeds;

/// Shared handle for the HTTP surface: the store, the live substores, and
/// the auth gate.  The ingestion side (pipeline, sessionizer, closure
/// orchestrator) is composed separately in `main` and only meets the HTTP
/// surface through these two.
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub live: LiveFeeds,
    pub auth: Arc<AuthGate>,
}

impl AppState {
    pub fn new(pool: SqlitePool, live: LiveFeeds, auth: Arc<AuthGate>) -> Self {
        Self { pool, live, auth }
    }
}
