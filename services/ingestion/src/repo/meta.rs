//! QC surfaces: per-session metadata, notes, and event overrides.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteRow {
    pub note_id: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

pub async fn get_meta(
    pool: &SqlitePool,
    session_id: &str,
) -> Result<Option<serde_json::Value>, sqlx::Error> {
    let row = sqlx::query("SELECT meta_json FROM session_meta WHERE session_id = ?1")
        .bind(session_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| {
        serde_json::from_str(&r.get::<String, _>("meta_json"))
            .unwrap_or(serde_json::Value::Null)
    }))
}

pub async fn put_meta(
    pool: &SqlitePool,
    session_id: &str,
    meta: &serde_json::Value,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO session_meta (session_id, meta_json, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT (session_id) DO UPDATE SET meta_json = ?2, updated_at = ?3",
    )
    .bind(session_id)
    .bind(meta.to_string())
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_notes(
    pool: &SqlitePool,
    session_id: &str,
    limit: i64,
    offset: i64,
) -> Result<Vec<NoteRow>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT note_id, session_id, author, body, created_at
         FROM session_notes WHERE session_id = ?1
         ORDER BY created_at ASC, note_id ASC
         LIMIT ?2 OFFSET ?3",
    )
    .bind(session_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|r| NoteRow {
            note_id: r.get("note_id"),
            session_id: r.get("session_id"),
            author: r.get("author"),
            body: r.get("body"),
            created_at: r.get("created_at"),
        })
        .collect())
}

pub async fn add_note(
    pool: &SqlitePool,
    session_id: &str,
    author: Option<&str>,
    body: &str,
    now: DateTime<Utc>,
) -> Result<NoteRow, sqlx::Error> {
    let note_id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO session_notes (note_id, session_id, author, body, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )
    .bind(&note_id)
    .bind(session_id)
    .bind(author)
    .bind(body)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(NoteRow {
        note_id,
        session_id: session_id.to_owned(),
        author: author.map(str::to_owned),
        body: body.to_owned(),
        created_at: now,
    })
}

pub async fn get_overrides(
    pool: &SqlitePool,
    session_id: &str,
) -> Result<Option<serde_json::Value>, sqlx::Error> {
    let row = sqlx::query("SELECT overrides_json FROM event_overrides WHERE session_id = ?1")
        .bind(session_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| {
        serde_json::from_str(&r.get::<String, _>("overrides_json"))
            .unwrap_or(serde_json::Value::Null)
    }))
}

pub async fn put_overrides(
    pool: &SqlitePool,
    session_id: &str,
    overrides: &serde_json::Value,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO event_overrides (session_id, overrides_json, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT (session_id) DO UPDATE SET overrides_json = ?2, updated_at = ?3",
    )
    .bind(session_id)
    .bind(overrides.to_string())
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}
