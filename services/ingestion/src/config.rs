//! Service configuration.
//!
//! Every knob is read from the environment exactly once at startup and
//! carried in a `Config` value through the composition root; nothing else
//! in the service touches `std::env`.

use std::env;

/// How HTTP callers are authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Synthesize a fixed actor from `DEV_*` knobs; for local development.
    Dev,
    /// Validate bearer tokens against the org-identity verifier.
    Bearer,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub mode: AuthMode,
    pub dev_org_id: String,
    pub dev_user_id: String,
    pub dev_user_name: String,
    /// Base URL of the org-identity verifier (bearer mode).
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub auth: AuthConfig,
    pub broker_url: String,
    pub broker_client_id: String,
    pub ops_broker_url: String,
    pub ops_client_id: String,
    pub db_path: String,
    pub kernel_url: String,
    pub auto_report_enabled: bool,
    pub ops_events_enabled: bool,
    pub kernel_fallback_enabled: bool,
    /// Static kid -> SPKI-base64 fallback map, raw JSON.
    pub device_keys_json: Option<String>,
    /// Remote device-identity service for key resolution.
    pub identity_url: Option<String>,
    pub session_gap_seconds: u64,
    pub close_silence_seconds: u64,
    /// Pipeline worker shard count; per-origin ordering holds within a shard.
    pub shards: usize,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from any key lookup.  Tests pass a map; `from_env`
    /// passes `env::var`.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let broker_url =
            get("INGESTION_BROKER_URL").unwrap_or_else(|| "nats://127.0.0.1:4222".to_owned());
        let mode = match get("AUTH_MODE").as_deref() {
            Some("bearer") => AuthMode::Bearer,
            _ => AuthMode::Dev,
        };
        Self {
            bind_addr: get("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_owned()),
            auth: AuthConfig {
                mode,
                dev_org_id: get("DEV_ORG_ID").unwrap_or_else(|| "dev-org".to_owned()),
                dev_user_id: get("DEV_USER_ID").unwrap_or_else(|| "dev-user".to_owned()),
                dev_user_name: get("DEV_USER_NAME").unwrap_or_else(|| "Dev User".to_owned()),
                issuer: get("ORG_IDENTITY_ISSUER"),
                audience: get("ORG_IDENTITY_AUDIENCE"),
            },
            ops_broker_url: get("INGESTION_OPS_BROKER_URL").unwrap_or_else(|| broker_url.clone()),
            ops_client_id: get("INGESTION_OPS_CLIENT_ID")
                .unwrap_or_else(|| "roast-ingestion-ops".to_owned()),
            broker_client_id: get("INGESTION_BROKER_CLIENT_ID")
                .unwrap_or_else(|| "roast-ingestion".to_owned()),
            broker_url,
            db_path: get("INGESTION_DB_PATH").unwrap_or_else(|| "./var/ingestion.db".to_owned()),
            kernel_url: get("INGESTION_KERNEL_URL")
                .unwrap_or_else(|| "http://127.0.0.1:3000".to_owned()),
            auto_report_enabled: parse_bool(get("AUTO_REPORT_MISSIONS_ENABLED").as_deref()),
            ops_events_enabled: parse_bool(get("INGESTION_OPS_EVENTS_ENABLED").as_deref()),
            kernel_fallback_enabled: parse_bool(
                get("INGESTION_KERNEL_ENQUEUE_FALLBACK_ENABLED").as_deref(),
            ),
            device_keys_json: get("INGESTION_DEVICE_KEYS_JSON"),
            identity_url: get("INGESTION_IDENTITY_URL"),
            session_gap_seconds: parse_u64(get("SESSION_GAP_SECONDS").as_deref(), 30),
            close_silence_seconds: parse_u64(get("CLOSE_SILENCE_SECONDS").as_deref(), 15),
            shards: parse_u64(get("INGESTION_SHARDS").as_deref(), 4).max(1) as usize,
        }
    }
}

/// Accepted true spellings: `1`, `true`, `yes`, `on` (case-insensitive).
/// Anything else, including absence, is false.
fn parse_bool(value: Option<&str>) -> bool {
    matches!(
        value.map(str::to_ascii_lowercase).as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}

fn parse_u64(value: Option<&str>, default: u64) -> u64 {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}
