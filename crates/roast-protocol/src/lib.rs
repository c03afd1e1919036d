// roast-protocol: wire and domain types for the roast telemetry pipeline.
//
// Inbound broker payloads are flat JSON objects — `ts`/`sig`/`kid` sit next
// to the sample or event fields.  The ingestion service splits them into a
// typed `Envelope`; everything it did not recognize is retained verbatim so
// analytical consumers never lose data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Origin and topics
// ---------------------------------------------------------------------------

/// Identifies the machine a message came from, as encoded in the broker
/// topic path `roaster/{orgId}/{siteId}/{machineId}/{suffix}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Origin {
    pub org_id: String,
    pub site_id: String,
    pub machine_id: String,
}

/// The two inbound topic classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeTopic {
    Telemetry,
    Event,
}

// ---------------------------------------------------------------------------
// Telemetry samples
// ---------------------------------------------------------------------------

/// A point-in-time reading from a roasting machine.
///
/// `elapsed_seconds` is measured from session start as the device perceives
/// it.  Temperature channels are optional; a machine may report any subset.
/// Unknown keys land in `extras` and are never rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySample {
    pub ts: DateTime<Utc>,
    pub machine_id: String,
    pub elapsed_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bt_c: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub et_c: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ror_c_per_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ambient_c: Option<f64>,
    #[serde(flatten)]
    pub extras: BTreeMap<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Roast events
// ---------------------------------------------------------------------------

/// Discrete markers that punctuate a session.  DROP is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoastEventType {
    /// Turning point.
    Tp,
    /// First crack.
    Fc,
    /// End of roast; closes the session.
    Drop,
    /// Any marker the pipeline has no special handling for.
    Other(String),
}

impl RoastEventType {
    pub fn parse(s: &str) -> Self {
        match s {
            "TP" => Self::Tp,
            "FC" => Self::Fc,
            "DROP" => Self::Drop,
            other => Self::Other(other.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Tp => "TP",
            Self::Fc => "FC",
            Self::Drop => "DROP",
            Self::Other(s) => s,
        }
    }
}

impl Serialize for RoastEventType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RoastEventType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::parse(&s))
    }
}

/// Typed portion of an event payload; whatever else the device sent rides
/// along in `extra`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_seconds: Option<f64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A discrete marker emitted by a machine during a roast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoastEvent {
    pub ts: DateTime<Utc>,
    pub machine_id: String,
    #[serde(rename = "type")]
    pub event_type: RoastEventType,
    #[serde(default)]
    pub payload: EventPayload,
}

// ---------------------------------------------------------------------------
// Trust annotations
// ---------------------------------------------------------------------------

/// Why a signature did not verify.  `MissingSig` is a distinct status from
/// the failure reasons — it means the customer never configured signing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrustFailure {
    MissingSig,
    MissingKid,
    UnknownKid,
    RevokedKey,
    BadSignature,
}

/// Per-envelope verdict from the signature verifier.  Orthogonal to
/// acceptance: a failed annotation never drops the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustAnnotation {
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<TrustFailure>,
}

impl TrustAnnotation {
    pub fn verified(kid: impl Into<String>) -> Self {
        Self { verified: true, kid: Some(kid.into()), reason: None }
    }

    pub fn failed(reason: TrustFailure, kid: Option<String>) -> Self {
        Self { verified: false, kid, reason: Some(reason) }
    }

    /// True when the envelope carried no signature at all (as opposed to a
    /// signature that failed verification).
    pub fn is_unsigned(&self) -> bool {
        self.reason == Some(TrustFailure::MissingSig)
    }
}

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

/// Payload of a decoded envelope, matching its topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EnvelopePayload {
    Telemetry(TelemetrySample),
    Event(RoastEvent),
}

impl EnvelopePayload {
    pub fn as_telemetry(&self) -> Option<&TelemetrySample> {
        match self {
            Self::Telemetry(s) => Some(s),
            Self::Event(_) => None,
        }
    }

    pub fn as_event(&self) -> Option<&RoastEvent> {
        match self {
            Self::Event(e) => Some(e),
            Self::Telemetry(_) => None,
        }
    }
}

/// A single broker message after decoding: origin + topic + payload plus the
/// optional signature fields.  `raw` retains the wire object verbatim for
/// storage; it is skipped when the envelope itself is serialized outward.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub ts: DateTime<Utc>,
    pub origin: Origin,
    pub topic: EnvelopeTopic,
    pub payload: EnvelopePayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trust: Option<TrustAnnotation>,
    #[serde(skip)]
    pub raw: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Subscription filters
// ---------------------------------------------------------------------------

/// Matches envelopes and stored rows by origin.  An unset field matches any
/// value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
}

impl StreamFilter {
    pub fn matches(&self, origin: &Origin) -> bool {
        self.matches_parts(&origin.org_id, &origin.site_id, &origin.machine_id)
    }

    pub fn matches_parts(&self, org_id: &str, site_id: &str, machine_id: &str) -> bool {
        self.org_id.as_deref().is_none_or(|v| v == org_id)
            && self.site_id.as_deref().is_none_or(|v| v == site_id)
            && self.machine_id.as_deref().is_none_or(|v| v == machine_id)
    }
}

// ---------------------------------------------------------------------------
// Closure notifications
// ---------------------------------------------------------------------------

/// Why a session closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    Drop,
    SilenceClose,
}

/// Summary measurements gathered at close time, carried on both the ops
/// event and the mission enqueue request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosureSignals {
    pub telemetry_points: i64,
    pub has_bt: bool,
    pub has_et: bool,
    pub duration_sec: f64,
    /// Seconds between the last telemetry sample's elapsed time and the
    /// session duration, clamped to zero.
    pub last_telemetry_delta_sec: f64,
}

/// Published on `ops/{orgId}/{siteId}/{machineId}/session/closed` when a
/// session reaches CLOSED.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionClosedEvent {
    pub session_id: String,
    pub origin: Origin,
    pub reason: CloseReason,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub signals: ClosureSignals,
}

// ---------------------------------------------------------------------------
// Kernel mission enqueue
// ---------------------------------------------------------------------------

/// Body for `POST /missions` at the downstream kernel.  The idempotency key
/// makes re-enqueues after restarts or publish failures safe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissionRequest {
    pub goal: String,
    pub idempotency_key: String,
    pub params: MissionParams,
    pub context: MissionContext,
    pub signals: ClosureSignals,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissionParams {
    pub session_id: String,
    pub report_kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissionContext {
    pub origin: Origin,
}

/// Default report kind requested for closed sessions.
pub const DEFAULT_REPORT_KIND: &str = "POST_ROAST_V1";

/// Goal string for auto-generated post-roast reports.
pub const REPORT_MISSION_GOAL: &str = "generate-roast-report";

/// Idempotency key for a report mission: one enqueue per
/// (goal, reportKind, sessionId).
pub fn report_idempotency_key(report_kind: &str, session_id: &str) -> String {
    format!("{REPORT_MISSION_GOAL}:{report_kind}:{session_id}")
}

// ---------------------------------------------------------------------------
// HTTP error envelope
// ---------------------------------------------------------------------------

/// Error body returned by every non-2xx JSON response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpErrorEnvelope {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}
