//! Session reconstruction.
//!
//! One active [`SessionState`] per `(orgId, siteId, machineId)` key.  A
//! session begins on first traffic or after a silence gap, and ends on a
//! DROP event or when the tick pass finds the key silent for too long.
//!
//! The state map lives behind a plain mutex: every operation is a short,
//! non-blocking map update and the lock is never held across an await.

use chrono::{DateTime, Utc};
use roast_protocol::{Envelope, EnvelopePayload, EnvelopeTopic, Origin, RoastEventType};
use std::collections::HashMap;
use std::sync::Mutex;

/// Transient per-key state; destroyed on DROP or silence close.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub session_id: String,
    pub origin: Origin,
    pub started_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_telemetry_ts: Option<DateTime<Utc>>,
}

/// Outcome of assigning an envelope to a session.
#[derive(Debug, Clone)]
pub struct SessionAssignment {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub new_session: bool,
}

pub struct Sessionizer {
    states: Mutex<HashMap<Origin, SessionState>>,
    gap_seconds: f64,
    close_silence_seconds: f64,
}

impl Sessionizer {
    pub fn new(gap_seconds: u64, close_silence_seconds: u64) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            gap_seconds: gap_seconds as f64,
            close_silence_seconds: close_silence_seconds as f64,
        }
    }

    /// Populate `envelope.session_id` and return the assignment.
    ///
    /// Continuation requires existing state with a gap within
    /// `gap_seconds` AND a matching session id when the device supplies
    /// one — a device-carried id that differs forces a new session.
    /// Out-of-order timestamps count as a zero gap and never regress
    /// `last_seen_at`.
    pub fn assign(&self, envelope: &mut Envelope) -> SessionAssignment {
        let now = envelope.ts;
        let key = envelope.origin.clone();
        let is_telemetry = envelope.topic == EnvelopeTopic::Telemetry;

        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let continuing = states.get_mut(&key).filter(|state| {
            let gap = (now - state.last_seen_at).num_milliseconds().max(0) as f64 / 1000.0;
            let same_session = envelope
                .session_id
                .as_ref()
                .is_none_or(|id| *id == state.session_id);
            gap <= self.gap_seconds && same_session
        });

        if let Some(state) = continuing {
            if now > state.last_seen_at {
                state.last_seen_at = now;
            }
            if is_telemetry && state.last_telemetry_ts.is_none_or(|prev| now > prev) {
                state.last_telemetry_ts = Some(now);
            }
            let assignment = SessionAssignment {
                session_id: state.session_id.clone(),
                started_at: state.started_at,
                new_session: false,
            };
            envelope.session_id = Some(assignment.session_id.clone());
            return assignment;
        }

        let session_id = envelope
            .session_id
            .clone()
            .unwrap_or_else(|| generate_session_id(&key, now));
        let state = SessionState {
            session_id: session_id.clone(),
            origin: key.clone(),
            started_at: now,
            last_seen_at: now,
            last_telemetry_ts: is_telemetry.then_some(now),
        };
        states.insert(key, state);

        envelope.session_id = Some(session_id.clone());
        SessionAssignment {
            session_id,
            started_at: now,
            new_session: true,
        }
    }

    /// DROP destroys the key's state; further traffic starts a new session.
    /// A DROP for a key with no state is legal and does nothing.
    pub fn handle_event(&self, envelope: &Envelope) {
        let EnvelopePayload::Event(event) = &envelope.payload else {
            return;
        };
        if event.event_type == RoastEventType::Drop {
            self.states
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&envelope.origin);
        }
    }

    /// Remove and return every state silent for longer than the close
    /// threshold.
    pub fn tick(&self, now: DateTime<Utc>) -> Vec<SessionState> {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let silent: Vec<Origin> = states
            .iter()
            .filter(|(_, state)| {
                (now - state.last_seen_at).num_milliseconds() as f64 / 1000.0
                    > self.close_silence_seconds
            })
            .map(|(key, _)| key.clone())
            .collect();
        silent
            .into_iter()
            .filter_map(|key| states.remove(&key))
            .collect()
    }

    #[cfg(test)]
    pub fn active_count(&self) -> usize {
        self.states.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// `S-{orgId}-{siteId}-{machineId}-{YYYYMMDDTHHMMSS}-{6 hex}`.  The random
/// suffix keeps ids distinct within the same second.
fn generate_session_id(origin: &Origin, ts: DateTime<Utc>) -> String {
    let suffix: u32 = rand::random::<u32>() & 0xff_ffff;
    format!(
        "S-{}-{}-{}-{}-{suffix:06x}",
        origin.org_id,
        origin.site_id,
        origin.machine_id,
        ts.format("%Y%m%dT%H%M%S"),
    )
}
