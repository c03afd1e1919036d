//! The persistence pipeline.
//!
//! `persist_envelope` is the central orchestration step: session
//! assignment, summary upsert, row append, trust accounting, progress
//! markers, and the CLOSED transition — all inside one transaction per
//! envelope.  Live fanout and the closure hook run only after the commit,
//! so readers and subscribers never observe uncommitted state and a hook
//! failure can never roll back a write.

use chrono::{DateTime, Utc};
use roast_protocol::{Envelope, EnvelopePayload, RoastEventType, TrustAnnotation};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::warn;

use crate::closure::ClosureOrchestrator;
use crate::live::LiveFeeds;
use crate::repo::events::{self, EventRow};
use crate::repo::points::{self, SampleRow};
use crate::repo::sessions::{self, TrustKind};
use crate::sessionizer::{SessionState, Sessionizer};

pub struct Pipeline {
    pool: SqlitePool,
    sessionizer: Arc<Sessionizer>,
    live: LiveFeeds,
    closure: Arc<ClosureOrchestrator>,
}

impl Pipeline {
    pub fn new(
        pool: SqlitePool,
        sessionizer: Arc<Sessionizer>,
        live: LiveFeeds,
        closure: Arc<ClosureOrchestrator>,
    ) -> Self {
        Self {
            pool,
            sessionizer,
            live,
            closure,
        }
    }

    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    pub fn live(&self) -> LiveFeeds {
        self.live.clone()
    }

    /// Process one trust-annotated envelope.  A storage error drops the
    /// whole envelope: the transaction rolls back and nothing is fanned out.
    pub async fn process(&self, envelope: Envelope) {
        let topic = envelope.topic;
        if let Err(e) = self.persist_envelope(envelope).await {
            warn!(?topic, error = %e, "dropping envelope after storage error");
        }
    }

    pub async fn persist_envelope(&self, mut envelope: Envelope) -> Result<(), sqlx::Error> {
        let assignment = self.sessionizer.assign(&mut envelope);
        let session_id = assignment.session_id.clone();

        let mut tx = self.pool.begin().await?;
        sessions::ensure_session(&mut tx, &session_id, &envelope.origin, assignment.started_at)
            .await?;

        let mut closed_now = false;
        let mut sample_row: Option<SampleRow> = None;
        let mut event_row: Option<EventRow> = None;

        match &envelope.payload {
            EnvelopePayload::Telemetry(sample) => {
                let row = SampleRow::from_envelope(&envelope, sample, &session_id);
                points::insert_sample(&mut tx, &row).await?;
                sessions::record_sample_counters(
                    &mut tx,
                    &session_id,
                    trust_kind(envelope.trust.as_ref()),
                    sample.bt_c,
                    envelope.kid.as_deref(),
                )
                .await?;
                sample_row = Some(row);
            }
            EnvelopePayload::Event(event) => {
                let row = EventRow::from_envelope(&envelope, event, &session_id);
                events::insert_event(&mut tx, &row).await?;

                match &event.event_type {
                    RoastEventType::Fc => {
                        if let Some(elapsed) = event.payload.elapsed_seconds {
                            sessions::set_fc_seconds(&mut tx, &session_id, elapsed).await?;
                        }
                    }
                    RoastEventType::Drop => {
                        let drop_elapsed = event.payload.elapsed_seconds;
                        if let Some(elapsed) = drop_elapsed {
                            sessions::set_drop_seconds(&mut tx, &session_id, elapsed).await?;
                        }
                        // The event's own elapsed time is authoritative for
                        // the duration; wall-clock is the fallback.
                        let duration = drop_elapsed.unwrap_or_else(|| {
                            seconds_between(assignment.started_at, envelope.ts)
                        });
                        closed_now =
                            sessions::close_session(&mut tx, &session_id, envelope.ts, duration)
                                .await?;
                    }
                    RoastEventType::Tp | RoastEventType::Other(_) => {}
                }
                event_row = Some(row);
            }
        }

        tx.commit().await?;

        // Committed; everything below is observation, not persistence.
        self.sessionizer.handle_event(&envelope);

        if let Some(row) = sample_row {
            self.live.telemetry.add(row);
            self.live.telemetry_envelopes.add(envelope);
        } else if let Some(row) = event_row {
            self.live.events.add(row);
            self.live.event_envelopes.add(envelope);
        }

        if closed_now {
            self.fire_closure_hook(&session_id).await;
        }
        Ok(())
    }

    /// Close every session the sessionizer found silent.  Each closure is
    /// its own transaction; one failure does not stop the rest.
    pub async fn tick(&self, now: DateTime<Utc>) {
        for state in self.sessionizer.tick(now) {
            if let Err(e) = self.close_silent_session(&state).await {
                warn!(
                    session_id = %state.session_id,
                    error = %e,
                    "silence close failed; session state already removed"
                );
            }
        }
    }

    async fn close_silent_session(&self, state: &SessionState) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        // The summary row normally exists; recreate it defensively in case
        // the session's only envelope lost its transaction.
        sessions::ensure_session(&mut tx, &state.session_id, &state.origin, state.started_at)
            .await?;
        let duration = seconds_between(state.started_at, state.last_seen_at);
        let closed =
            sessions::close_session(&mut tx, &state.session_id, state.last_seen_at, duration)
                .await?;
        tx.commit().await?;

        if closed {
            self.fire_closure_hook(&state.session_id).await;
        }
        Ok(())
    }

    async fn fire_closure_hook(&self, session_id: &str) {
        match sessions::get_session(&self.pool, session_id).await {
            Ok(Some(summary)) => self.closure.spawn_on_closed(summary),
            Ok(None) => warn!(session_id, "closed session vanished before the closure hook"),
            Err(e) => warn!(session_id, error = %e, "could not load summary for closure hook"),
        }
    }
}

fn trust_kind(annotation: Option<&TrustAnnotation>) -> TrustKind {
    match annotation {
        Some(a) if a.verified => TrustKind::Verified,
        Some(a) if a.is_unsigned() => TrustKind::Unsigned,
        Some(_) => TrustKind::Failed,
        // Decoder output that bypassed the verifier counts as unsigned.
        None => TrustKind::Unsigned,
    }
}

fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds().max(0) as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use crate::envelope::decode_at;
    use chrono::TimeZone;
    use roast_protocol::TrustFailure;

    async fn test_pipeline() -> Pipeline {
        let pool = memory_pool().await;
        let closure = Arc::new(ClosureOrchestrator::new(
            pool.clone(),
            None,
            "http://127.0.0.1:9".to_owned(),
            false,
            false,
            false,
        ));
        Pipeline::new(
            pool,
            Arc::new(Sessionizer::new(30, 15)),
            LiveFeeds::default(),
            closure,
        )
    }

    fn ts(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap() + chrono::Duration::seconds(secs.into())
    }

    fn telemetry(secs: u32, trust: Option<TrustAnnotation>) -> Envelope {
        let payload = serde_json::json!({
            "ts": ts(secs).to_rfc3339(),
            "elapsedSeconds": f64::from(secs),
            "btC": 100.0 + f64::from(secs),
        });
        let mut env = decode_at(
            "roaster/acme/plant-1/r2/telemetry",
            payload.to_string().as_bytes(),
            ts(secs),
        )
        .expect("decode");
        env.trust = trust;
        env
    }

    fn event(secs: u32, kind: &str, elapsed: Option<f64>) -> Envelope {
        let mut payload = serde_json::json!({
            "ts": ts(secs).to_rfc3339(),
            "type": kind,
        });
        if let Some(elapsed) = elapsed {
            payload["payload"] = serde_json::json!({"elapsedSeconds": elapsed});
        }
        decode_at(
            "roaster/acme/plant-1/r2/events",
            payload.to_string().as_bytes(),
            ts(secs),
        )
        .expect("decode")
    }

    #[tokio::test]
    async fn trust_accounting_partitions_the_three_statuses() {
        let pipeline = test_pipeline().await;
        pipeline
            .persist_envelope(telemetry(0, Some(TrustAnnotation::failed(TrustFailure::MissingSig, None))))
            .await
            .unwrap();
        pipeline
            .persist_envelope(telemetry(
                1,
                Some(TrustAnnotation::failed(
                    TrustFailure::BadSignature,
                    Some("k1".to_owned()),
                )),
            ))
            .await
            .unwrap();
        pipeline
            .persist_envelope(telemetry(2, Some(TrustAnnotation::verified("k2"))))
            .await
            .unwrap();

        let sessions =
            sessions::list_sessions(&pipeline.pool, &Default::default(), 50, 0).await.unwrap();
        assert_eq!(sessions.len(), 1);
        let s = &sessions[0];
        assert_eq!(s.telemetry_points, 3);
        assert_eq!(s.verified_points, 1);
        assert_eq!(s.unsigned_points, 1);
        assert_eq!(s.failed_points, 1);
        assert_eq!(
            s.telemetry_points,
            s.verified_points + s.unsigned_points + s.failed_points
        );
    }

    #[tokio::test]
    async fn drop_without_elapsed_falls_back_to_wall_clock_duration() {
        let pipeline = test_pipeline().await;
        pipeline.persist_envelope(telemetry(0, None)).await.unwrap();
        pipeline
            .persist_envelope(event(25, "DROP", None))
            .await
            .unwrap();

        let sessions =
            sessions::list_sessions(&pipeline.pool, &Default::default(), 50, 0).await.unwrap();
        let s = &sessions[0];
        assert_eq!(s.status, "CLOSED");
        assert_eq!(s.duration_seconds, Some(25.0));
        assert_eq!(s.drop_seconds, None);
        assert_eq!(s.ended_at, Some(ts(25)));
    }

    #[tokio::test]
    async fn resent_drop_with_same_elapsed_is_a_no_op() {
        let pipeline = test_pipeline().await;
        pipeline.persist_envelope(telemetry(0, None)).await.unwrap();
        pipeline
            .persist_envelope(event(360, "DROP", Some(360.0)))
            .await
            .unwrap();
        let first =
            sessions::list_sessions(&pipeline.pool, &Default::default(), 50, 0).await.unwrap();
        assert_eq!(first.len(), 1);
        let closed = &first[0];

        // The DROP removed the transient state, so a resend starts a new
        // session; the closed one is untouched.
        pipeline
            .persist_envelope(event(361, "DROP", Some(360.0)))
            .await
            .unwrap();
        let after =
            sessions::list_sessions(&pipeline.pool, &Default::default(), 50, 0).await.unwrap();
        assert_eq!(after.len(), 2, "resent DROP opens a new session, no reopen");
        let untouched = after
            .iter()
            .find(|s| s.session_id == closed.session_id)
            .unwrap();
        assert_eq!(untouched.drop_seconds, Some(360.0));
        assert_eq!(untouched.duration_seconds, Some(360.0));
        assert_eq!(untouched.status, "CLOSED");
    }

    #[tokio::test]
    async fn tick_closes_silent_sessions_with_wall_clock_duration() {
        let pipeline = test_pipeline().await;
        pipeline.persist_envelope(telemetry(0, None)).await.unwrap();
        pipeline.persist_envelope(telemetry(10, None)).await.unwrap();

        // 16 seconds after the last envelope: past the 15s silence window.
        pipeline.tick(ts(26)).await;

        let sessions =
            sessions::list_sessions(&pipeline.pool, &Default::default(), 50, 0).await.unwrap();
        let s = &sessions[0];
        assert_eq!(s.status, "CLOSED");
        assert_eq!(s.ended_at, Some(ts(10)), "endedAt is the last-seen time");
        assert_eq!(s.duration_seconds, Some(10.0));
        assert_eq!(s.drop_seconds, None);
    }

    #[tokio::test]
    async fn committed_rows_fan_out_to_live_subscribers() {
        let pipeline = test_pipeline().await;
        let mut samples = pipeline.live.telemetry.subscribe(Default::default());
        let mut envelopes = pipeline.live.telemetry_envelopes.subscribe(Default::default());

        pipeline
            .persist_envelope(telemetry(0, Some(TrustAnnotation::verified("k1"))))
            .await
            .unwrap();

        let row = samples.recv().await.expect("stored row fanned out");
        assert_eq!(row.bt_c, Some(100.0));
        let env = envelopes.recv().await.expect("envelope fanned out");
        assert_eq!(env.trust, Some(TrustAnnotation::verified("k1")));
    }
}
