//! Closure orchestration.
//!
//! Runs as a detached task after a session's CLOSED transition has
//! committed.  Failures here are logged and never reach the write path.
//!
//! Downstream work is idempotent end to end: the report-existence check
//! short-circuits re-closes, and the kernel enqueue carries an idempotency
//! key so a replay after restart or publish failure is safe.  Warnings are
//! rate-limited to one per session per failure path so a down kernel does
//! not flood the logs.

use roast_protocol::{
    CloseReason, ClosureSignals, DEFAULT_REPORT_KIND, MissionContext, MissionParams,
    MissionRequest, REPORT_MISSION_GOAL, SessionClosedEvent, report_idempotency_key,
};
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::repo::points;
use crate::repo::reports;
use crate::repo::sessions::SessionRow;

const KERNEL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ClosureOrchestrator {
    pool: SqlitePool,
    ops: Option<async_nats::Client>,
    http: reqwest::Client,
    kernel_url: String,
    ops_events_enabled: bool,
    kernel_fallback_enabled: bool,
    auto_report_enabled: bool,
    /// `{session_id}:{path}` entries that have already warned.
    warned: Mutex<HashSet<String>>,
}

impl ClosureOrchestrator {
    pub fn new(
        pool: SqlitePool,
        ops: Option<async_nats::Client>,
        kernel_url: String,
        ops_events_enabled: bool,
        kernel_fallback_enabled: bool,
        auto_report_enabled: bool,
    ) -> Self {
        Self {
            pool,
            ops,
            http: reqwest::Client::new(),
            kernel_url,
            ops_events_enabled,
            kernel_fallback_enabled,
            auto_report_enabled,
            warned: Mutex::new(HashSet::new()),
        }
    }

    /// Fire the closure hook detached.  Must be called only after the CLOSED
    /// write is visible to readers.
    pub fn spawn_on_closed(self: &Arc<Self>, session: SessionRow) {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.on_session_closed(session).await;
        });
    }

    pub async fn on_session_closed(&self, session: SessionRow) {
        // A report of the default kind means downstream work already ran.
        match reports::report_exists(&self.pool, &session.session_id, DEFAULT_REPORT_KIND).await {
            Ok(true) => {
                debug!(session_id = %session.session_id, "report already exists; skipping closure work");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(session_id = %session.session_id, error = %e, "closure hook could not check reports");
                return;
            }
        }

        let signals = match self.gather_signals(&session).await {
            Ok(s) => s,
            Err(e) => {
                warn!(session_id = %session.session_id, error = %e, "closure hook could not gather signals");
                return;
            }
        };

        let reason = close_reason_for(&session);

        if self.ops_events_enabled {
            self.publish_closed(&session, reason, &signals).await;
        }

        let should_enqueue = if self.ops_events_enabled {
            self.kernel_fallback_enabled
        } else {
            self.auto_report_enabled
        };
        if should_enqueue {
            self.enqueue_report_mission(&session, &signals).await;
        }
    }

    async fn gather_signals(&self, session: &SessionRow) -> Result<ClosureSignals, sqlx::Error> {
        let stats = points::telemetry_stats(&self.pool, &session.session_id).await?;
        let duration_sec = session.duration_seconds.unwrap_or(0.0);
        let last_telemetry_delta_sec =
            (duration_sec - stats.max_elapsed_seconds.unwrap_or(0.0)).max(0.0);
        Ok(ClosureSignals {
            telemetry_points: stats.points,
            has_bt: stats.has_bt,
            has_et: stats.has_et,
            duration_sec,
            last_telemetry_delta_sec,
        })
    }

    async fn publish_closed(
        &self,
        session: &SessionRow,
        reason: CloseReason,
        signals: &ClosureSignals,
    ) {
        let Some(client) = &self.ops else {
            self.warn_once(&session.session_id, "ops-publish", "ops publisher not connected");
            return;
        };
        let event = SessionClosedEvent {
            session_id: session.session_id.clone(),
            origin: session.origin(),
            reason,
            started_at: session.started_at,
            ended_at: session.ended_at.unwrap_or(session.started_at),
            duration_seconds: session.duration_seconds.unwrap_or(0.0),
            signals: signals.clone(),
        };
        let subject = format!(
            "ops.{}.{}.{}.session.closed",
            session.org_id, session.site_id, session.machine_id
        );
        let payload = match serde_json::to_vec(&event) {
            Ok(p) => p,
            Err(e) => {
                warn!(session_id = %session.session_id, error = %e, "could not serialize session.closed");
                return;
            }
        };
        let published = match client.publish(subject, payload.into()).await {
            Ok(()) => client.flush().await.is_ok(),
            Err(_) => false,
        };
        if published {
            info!(session_id = %session.session_id, ?reason, "published session.closed");
        } else {
            self.warn_once(&session.session_id, "ops-publish", "session.closed publish failed");
        }
    }

    async fn enqueue_report_mission(&self, session: &SessionRow, signals: &ClosureSignals) {
        let request = MissionRequest {
            goal: REPORT_MISSION_GOAL.to_owned(),
            idempotency_key: report_idempotency_key(DEFAULT_REPORT_KIND, &session.session_id),
            params: MissionParams {
                session_id: session.session_id.clone(),
                report_kind: DEFAULT_REPORT_KIND.to_owned(),
            },
            context: MissionContext {
                origin: session.origin(),
            },
            signals: signals.clone(),
        };
        let url = format!("{}/missions", self.kernel_url.trim_end_matches('/'));
        let outcome = self
            .http
            .post(&url)
            .timeout(KERNEL_TIMEOUT)
            .json(&request)
            .send()
            .await;
        match outcome {
            Ok(response) if response.status().is_success() => {
                info!(session_id = %session.session_id, "enqueued report mission");
            }
            Ok(response) => {
                let status = response.status();
                self.warn_once(
                    &session.session_id,
                    "kernel-enqueue",
                    &format!("kernel rejected mission with {status}"),
                );
            }
            Err(e) => {
                self.warn_once(
                    &session.session_id,
                    "kernel-enqueue",
                    &format!("kernel unreachable: {e}"),
                );
            }
        }
    }

    #[cfg(test)]
    fn warned_count(&self) -> usize {
        self.warned.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn warn_once(&self, session_id: &str, path: &str, message: &str) {
        let key = format!("{session_id}:{path}");
        let mut warned = self.warned.lock().unwrap_or_else(|e| e.into_inner());
        if warned.insert(key) {
            warn!(session_id, path, "{message}");
        }
    }
}

/// A summary with `drop_seconds` closed via DROP; anything else was a
/// silence close.
fn close_reason_for(session: &SessionRow) -> CloseReason {
    if session.drop_seconds.is_some() {
        CloseReason::Drop
    } else {
        CloseReason::SilenceClose
    }
}
