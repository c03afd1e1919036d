//! Envelope decoding.
//!
//! Turns a broker topic path plus a payload byte buffer into a typed
//! [`Envelope`], or nothing.  Malformed input is dropped with a warning;
//! no error escapes this stage.
//!
//! The original wire object is kept verbatim on the envelope (`raw`) — the
//! signature verifier recomputes signing bytes from it, and the persistence
//! pipeline stores it unmodified.  The typed payload is built from a patched
//! copy (missing `ts` filled with wall-clock, `machineId` filled from the
//! topic) so the rest of the pipeline never deals with absent fields.

use chrono::{DateTime, Utc};
use roast_protocol::{Envelope, EnvelopePayload, EnvelopeTopic, Origin, RoastEvent, TelemetrySample};
use tracing::warn;

/// Decode one broker message.  Returns `None` for anything malformed.
pub fn decode(topic_path: &str, payload: &[u8]) -> Option<Envelope> {
    decode_at(topic_path, payload, Utc::now())
}

/// Like [`decode`] with an injectable clock, for tests.
pub fn decode_at(topic_path: &str, payload: &[u8], now: DateTime<Utc>) -> Option<Envelope> {
    let (origin, topic) = match parse_topic(topic_path) {
        Some(parts) => parts,
        None => {
            warn!(topic = topic_path, "dropping message with unrecognized topic");
            return None;
        }
    };

    let raw: serde_json::Value = match serde_json::from_slice(payload) {
        Ok(v) => v,
        Err(e) => {
            warn!(topic = topic_path, error = %e, "dropping unparseable payload");
            return None;
        }
    };
    let Some(object) = raw.as_object() else {
        warn!(topic = topic_path, "dropping non-object payload");
        return None;
    };

    let sig = object.get("sig").and_then(|v| v.as_str()).map(str::to_owned);
    let kid = object.get("kid").and_then(|v| v.as_str()).map(str::to_owned);
    let session_id = object
        .get("sessionId")
        .and_then(|v| v.as_str())
        .map(str::to_owned);

    // Typed view: patch in the decoder-supplied defaults and lift the
    // envelope-level fields out so they cannot leak into `extras`.  `raw`
    // stays exactly as received.
    let mut patched = object.clone();
    patched.remove("sig");
    patched.remove("kid");
    patched.remove("sessionId");
    if !patched.contains_key("ts") {
        patched.insert("ts".to_owned(), serde_json::json!(now.to_rfc3339()));
    }
    if !patched.contains_key("machineId") {
        patched.insert(
            "machineId".to_owned(),
            serde_json::json!(origin.machine_id.clone()),
        );
    }
    let patched = serde_json::Value::Object(patched);

    let payload = match topic {
        EnvelopeTopic::Telemetry => {
            let sample: TelemetrySample = match serde_json::from_value(patched) {
                Ok(s) => s,
                Err(e) => {
                    warn!(topic = topic_path, error = %e, "dropping telemetry with schema mismatch");
                    return None;
                }
            };
            if !sample.elapsed_seconds.is_finite() || sample.elapsed_seconds < 0.0 {
                warn!(
                    topic = topic_path,
                    elapsed_seconds = sample.elapsed_seconds,
                    "dropping telemetry with invalid elapsedSeconds"
                );
                return None;
            }
            EnvelopePayload::Telemetry(sample)
        }
        EnvelopeTopic::Event => {
            let event: RoastEvent = match serde_json::from_value(patched) {
                Ok(e) => e,
                Err(e) => {
                    warn!(topic = topic_path, error = %e, "dropping event with schema mismatch");
                    return None;
                }
            };
            EnvelopePayload::Event(event)
        }
    };

    let ts = match &payload {
        EnvelopePayload::Telemetry(s) => s.ts,
        EnvelopePayload::Event(e) => e.ts,
    };

    Some(Envelope {
        ts,
        origin,
        topic,
        payload,
        sig,
        kid,
        session_id,
        trust: None,
        raw,
    })
}

/// Split `roaster/{orgId}/{siteId}/{machineId}/{suffix}` into origin and
/// topic class.  Any other shape is rejected.
fn parse_topic(path: &str) -> Option<(Origin, EnvelopeTopic)> {
    let mut parts = path.split('/');
    if parts.next() != Some("roaster") {
        return None;
    }
    let org_id = parts.next().filter(|s| !s.is_empty())?;
    let site_id = parts.next().filter(|s| !s.is_empty())?;
    let machine_id = parts.next().filter(|s| !s.is_empty())?;
    let topic = match parts.next() {
        Some("telemetry") => EnvelopeTopic::Telemetry,
        Some("events") => EnvelopeTopic::Event,
        _ => return None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((
        Origin {
            org_id: org_id.to_owned(),
            site_id: site_id.to_owned(),
            machine_id: machine_id.to_owned(),
        },
        topic,
    ))
}
