//! Roast event rows: append-only discrete markers.

use chrono::{DateTime, Utc};
use roast_protocol::{Envelope, Origin, RoastEvent};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRow {
    pub session_id: String,
    pub org_id: String,
    pub site_id: String,
    pub machine_id: String,
    pub ts: DateTime<Utc>,
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_seconds: Option<f64>,
    pub raw: serde_json::Value,
}

impl EventRow {
    pub fn from_envelope(envelope: &Envelope, event: &RoastEvent, session_id: &str) -> Self {
        Self {
            session_id: session_id.to_owned(),
            org_id: envelope.origin.org_id.clone(),
            site_id: envelope.origin.site_id.clone(),
            machine_id: envelope.origin.machine_id.clone(),
            ts: event.ts,
            event_type: event.event_type.as_str().to_owned(),
            elapsed_seconds: event.payload.elapsed_seconds,
            raw: envelope.raw.clone(),
        }
    }

    pub fn origin(&self) -> Origin {
        Origin {
            org_id: self.org_id.clone(),
            site_id: self.site_id.clone(),
            machine_id: self.machine_id.clone(),
        }
    }
}

fn row_to_event(row: &SqliteRow) -> EventRow {
    let raw: String = row.get("raw_json");
    EventRow {
        session_id: row.get("session_id"),
        org_id: row.get("org_id"),
        site_id: row.get("site_id"),
        machine_id: row.get("machine_id"),
        ts: row.get("ts"),
        event_type: row.get("event_type"),
        elapsed_seconds: row.get("elapsed_seconds"),
        raw: serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null),
    }
}

pub async fn insert_event(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    event: &EventRow,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO events
             (session_id, org_id, site_id, machine_id, ts, event_type, elapsed_seconds, raw_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )
    .bind(&event.session_id)
    .bind(&event.org_id)
    .bind(&event.site_id)
    .bind(&event.machine_id)
    .bind(event.ts)
    .bind(&event.event_type)
    .bind(event.elapsed_seconds)
    .bind(event.raw.to_string())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn fetch_session_events(
    pool: &SqlitePool,
    session_id: &str,
) -> Result<Vec<EventRow>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT session_id, org_id, site_id, machine_id, ts, event_type, elapsed_seconds, raw_json
         FROM events WHERE session_id = ?1 ORDER BY ts ASC",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(row_to_event).collect())
}
