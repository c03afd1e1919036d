//! Session summary rows.
//!
//! The summary is the primary entity: lifecycle, progress markers, and
//! trust counters.  Progress markers are monotonic (`max_bt_c` is a running
//! maximum, `fc_seconds`/`drop_seconds` are first-write-wins) and the
//! CLOSED transition is guarded so it can happen exactly once.

use chrono::{DateTime, Utc};
use roast_protocol::Origin;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use tracing::error;

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRow {
    pub session_id: String,
    pub org_id: String,
    pub site_id: String,
    pub machine_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fc_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drop_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_bt_c: Option<f64>,
    pub telemetry_points: i64,
    pub verified_points: i64,
    pub unsigned_points: i64,
    pub failed_points: i64,
    pub device_ids: Vec<String>,
}

impl SessionRow {
    pub fn origin(&self) -> Origin {
        Origin {
            org_id: self.org_id.clone(),
            site_id: self.site_id.clone(),
            machine_id: self.machine_id.clone(),
        }
    }
}

pub const STATUS_ACTIVE: &str = "ACTIVE";
pub const STATUS_CLOSED: &str = "CLOSED";

/// Which trust counter a telemetry point lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustKind {
    Verified,
    Unsigned,
    Failed,
}

/// Outcome of a first-write-wins marker update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MarkerWrite {
    Set,
    /// Same value re-written; a no-op.
    Unchanged,
    /// A different value already present; the first value wins.
    Conflict { existing: f64 },
}

#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub org_id: Option<String>,
    pub site_id: Option<String>,
    pub machine_id: Option<String>,
    pub status: Option<String>,
}

const SELECT_COLUMNS: &str = "session_id, org_id, site_id, machine_id, started_at, ended_at, \
     status, duration_seconds, fc_seconds, drop_seconds, max_bt_c, \
     telemetry_points, verified_points, unsigned_points, failed_points, device_ids";

fn row_to_session(row: &SqliteRow) -> SessionRow {
    let device_ids: String = row.get("device_ids");
    SessionRow {
        session_id: row.get("session_id"),
        org_id: row.get("org_id"),
        site_id: row.get("site_id"),
        machine_id: row.get("machine_id"),
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
        status: row.get("status"),
        duration_seconds: row.get("duration_seconds"),
        fc_seconds: row.get("fc_seconds"),
        drop_seconds: row.get("drop_seconds"),
        max_bt_c: row.get("max_bt_c"),
        telemetry_points: row.get("telemetry_points"),
        verified_points: row.get("verified_points"),
        unsigned_points: row.get("unsigned_points"),
        failed_points: row.get("failed_points"),
        device_ids: serde_json::from_str(&device_ids).unwrap_or_default(),
    }
}

/// Insert the summary row if it does not exist.  `started_at` lands on the
/// initial insert only; later envelopes never overwrite it.
pub async fn ensure_session(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    session_id: &str,
    origin: &Origin,
    started_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO sessions (session_id, org_id, site_id, machine_id, started_at, status)
         VALUES (?1, ?2, ?3, ?4, ?5, 'ACTIVE')
         ON CONFLICT (session_id) DO NOTHING",
    )
    .bind(session_id)
    .bind(&origin.org_id)
    .bind(&origin.site_id)
    .bind(&origin.machine_id)
    .bind(started_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Bump the telemetry counters for one sample and fold `bt_c` into the
/// running maximum.  Appends `kid` to the device set when new.
pub async fn record_sample_counters(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    session_id: &str,
    trust: TrustKind,
    bt_c: Option<f64>,
    kid: Option<&str>,
) -> Result<(), sqlx::Error> {
    let (verified, unsigned, failed) = match trust {
        TrustKind::Verified => (1i64, 0i64, 0i64),
        TrustKind::Unsigned => (0, 1, 0),
        TrustKind::Failed => (0, 0, 1),
    };
    sqlx::query(
        "UPDATE sessions SET
             telemetry_points = telemetry_points + 1,
             verified_points = verified_points + ?1,
             unsigned_points = unsigned_points + ?2,
             failed_points = failed_points + ?3,
             max_bt_c = CASE
                 WHEN ?4 IS NULL THEN max_bt_c
                 WHEN max_bt_c IS NULL OR ?4 > max_bt_c THEN ?4
                 ELSE max_bt_c
             END
         WHERE session_id = ?5",
    )
    .bind(verified)
    .bind(unsigned)
    .bind(failed)
    .bind(bt_c)
    .bind(session_id)
    .execute(&mut **tx)
    .await?;

    if let Some(kid) = kid {
        let current: String = sqlx::query("SELECT device_ids FROM sessions WHERE session_id = ?1")
            .bind(session_id)
            .fetch_one(&mut **tx)
            .await?
            .get("device_ids");
        let mut ids: Vec<String> = serde_json::from_str(&current).unwrap_or_default();
        if !ids.iter().any(|id| id == kid) {
            ids.push(kid.to_owned());
            sqlx::query("UPDATE sessions SET device_ids = ?1 WHERE session_id = ?2")
                .bind(serde_json::to_string(&ids).unwrap_or_else(|_| "[]".to_owned()))
                .bind(session_id)
                .execute(&mut **tx)
                .await?;
        }
    }
    Ok(())
}

async fn set_marker(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    session_id: &str,
    column: &str,
    value: f64,
) -> Result<MarkerWrite, sqlx::Error> {
    let existing: Option<f64> =
        sqlx::query(sqlx::AssertSqlSafe(format!("SELECT {column} FROM sessions WHERE session_id = ?1")))
            .bind(session_id)
            .fetch_one(&mut **tx)
            .await?
            .get(0);
    match existing {
        None => {
            sqlx::query(sqlx::AssertSqlSafe(format!(
                "UPDATE sessions SET {column} = ?1 WHERE session_id = ?2"
            )))
            .bind(value)
            .bind(session_id)
            .execute(&mut **tx)
            .await?;
            Ok(MarkerWrite::Set)
        }
        Some(current) if (current - value).abs() < f64::EPSILON => Ok(MarkerWrite::Unchanged),
        Some(current) => Ok(MarkerWrite::Conflict { existing: current }),
    }
}

/// First-write-wins `fc_seconds`.  A conflicting rewrite is logged and
/// otherwise ignored; it never rolls back the surrounding transaction.
pub async fn set_fc_seconds(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    session_id: &str,
    value: f64,
) -> Result<MarkerWrite, sqlx::Error> {
    let outcome = set_marker(tx, session_id, "fc_seconds", value).await?;
    if let MarkerWrite::Conflict { existing } = outcome {
        error!(
            session_id,
            existing, attempted = value, "fcSeconds rewrite with a different value; keeping first"
        );
    }
    Ok(outcome)
}

/// First-write-wins `drop_seconds`, same conflict policy as FC.
pub async fn set_drop_seconds(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    session_id: &str,
    value: f64,
) -> Result<MarkerWrite, sqlx::Error> {
    let outcome = set_marker(tx, session_id, "drop_seconds", value).await?;
    if let MarkerWrite::Conflict { existing } = outcome {
        error!(
            session_id,
            existing, attempted = value, "dropSeconds rewrite with a different value; keeping first"
        );
    }
    Ok(outcome)
}

/// Transition ACTIVE -> CLOSED.  Returns true only for the call that
/// performed the transition; CLOSED is terminal.
pub async fn close_session(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    session_id: &str,
    ended_at: DateTime<Utc>,
    duration_seconds: f64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE sessions SET status = 'CLOSED', ended_at = ?1, duration_seconds = ?2
         WHERE session_id = ?3 AND status = 'ACTIVE'",
    )
    .bind(ended_at)
    .bind(duration_seconds)
    .bind(session_id)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn get_session(
    pool: &SqlitePool,
    session_id: &str,
) -> Result<Option<SessionRow>, sqlx::Error> {
    let row = sqlx::query(sqlx::AssertSqlSafe(format!(
        "SELECT {SELECT_COLUMNS} FROM sessions WHERE session_id = ?1"
    )))
    .bind(session_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(row_to_session))
}

pub async fn list_sessions(
    pool: &SqlitePool,
    filter: &SessionFilter,
    limit: i64,
    offset: i64,
) -> Result<Vec<SessionRow>, sqlx::Error> {
    let rows = sqlx::query(sqlx::AssertSqlSafe(format!(
        "SELECT {SELECT_COLUMNS} FROM sessions
         WHERE (?1 IS NULL OR org_id = ?1)
           AND (?2 IS NULL OR site_id = ?2)
           AND (?3 IS NULL OR machine_id = ?3)
           AND (?4 IS NULL OR status = ?4)
         ORDER BY started_at DESC, session_id DESC
         LIMIT ?5 OFFSET ?6"
    )))
    .bind(&filter.org_id)
    .bind(&filter.site_id)
    .bind(&filter.machine_id)
    .bind(&filter.status)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(row_to_session).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use chrono::TimeZone;

    fn origin() -> Origin {
        Origin {
            org_id: "acme".to_owned(),
            site_id: "plant-1".to_owned(),
            machine_id: "r2".to_owned(),
        }
    }

    fn ts(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap() + chrono::Duration::seconds(secs.into())
    }

    #[tokio::test]
    async fn ensure_session_is_insert_only_for_started_at() {
        let pool = memory_pool().await;
        let mut tx = pool.begin().await.unwrap();
        ensure_session(&mut tx, "s1", &origin(), ts(0)).await.unwrap();
        ensure_session(&mut tx, "s1", &origin(), ts(100)).await.unwrap();
        tx.commit().await.unwrap();

        let row = get_session(&pool, "s1").await.unwrap().unwrap();
        assert_eq!(row.started_at, ts(0), "second insert must not move started_at");
        assert_eq!(row.status, STATUS_ACTIVE);
    }

    #[tokio::test]
    async fn counters_partition_by_trust_kind_and_track_max_bt() {
        let pool = memory_pool().await;
        let mut tx = pool.begin().await.unwrap();
        ensure_session(&mut tx, "s1", &origin(), ts(0)).await.unwrap();
        record_sample_counters(&mut tx, "s1", TrustKind::Verified, Some(150.0), Some("k1"))
            .await
            .unwrap();
        record_sample_counters(&mut tx, "s1", TrustKind::Unsigned, Some(180.0), None)
            .await
            .unwrap();
        record_sample_counters(&mut tx, "s1", TrustKind::Failed, Some(165.0), Some("k2"))
            .await
            .unwrap();
        record_sample_counters(&mut tx, "s1", TrustKind::Verified, None, Some("k1"))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let row = get_session(&pool, "s1").await.unwrap().unwrap();
        assert_eq!(row.telemetry_points, 4);
        assert_eq!(row.verified_points, 2);
        assert_eq!(row.unsigned_points, 1);
        assert_eq!(row.failed_points, 1);
        assert_eq!(
            row.telemetry_points,
            row.verified_points + row.unsigned_points + row.failed_points
        );
        assert_eq!(row.max_bt_c, Some(180.0), "running maximum, never decreases");
        assert_eq!(row.device_ids, vec!["k1".to_owned(), "k2".to_owned()]);
    }

    #[tokio::test]
    async fn markers_are_first_write_wins() {
        let pool = memory_pool().await;
        let mut tx = pool.begin().await.unwrap();
        ensure_session(&mut tx, "s1", &origin(), ts(0)).await.unwrap();

        assert_eq!(set_fc_seconds(&mut tx, "s1", 180.0).await.unwrap(), MarkerWrite::Set);
        assert_eq!(
            set_fc_seconds(&mut tx, "s1", 180.0).await.unwrap(),
            MarkerWrite::Unchanged
        );
        assert_eq!(
            set_fc_seconds(&mut tx, "s1", 200.0).await.unwrap(),
            MarkerWrite::Conflict { existing: 180.0 }
        );
        tx.commit().await.unwrap();

        let row = get_session(&pool, "s1").await.unwrap().unwrap();
        assert_eq!(row.fc_seconds, Some(180.0), "first value wins");
    }

    #[tokio::test]
    async fn close_transition_happens_exactly_once() {
        let pool = memory_pool().await;
        let mut tx = pool.begin().await.unwrap();
        ensure_session(&mut tx, "s1", &origin(), ts(0)).await.unwrap();
        assert!(close_session(&mut tx, "s1", ts(360), 360.0).await.unwrap());
        assert!(
            !close_session(&mut tx, "s1", ts(400), 400.0).await.unwrap(),
            "CLOSED is terminal"
        );
        tx.commit().await.unwrap();

        let row = get_session(&pool, "s1").await.unwrap().unwrap();
        assert_eq!(row.status, STATUS_CLOSED);
        assert_eq!(row.ended_at, Some(ts(360)));
        assert_eq!(row.duration_seconds, Some(360.0));
    }

    #[tokio::test]
    async fn list_sessions_filters_and_paginates() {
        let pool = memory_pool().await;
        let mut tx = pool.begin().await.unwrap();
        for (id, org, offset_secs) in [("s1", "acme", 0), ("s2", "acme", 10), ("s3", "other", 20)] {
            let origin = Origin {
                org_id: org.to_owned(),
                site_id: "plant-1".to_owned(),
                machine_id: "r2".to_owned(),
            };
            ensure_session(&mut tx, id, &origin, ts(offset_secs)).await.unwrap();
        }
        close_session(&mut tx, "s2", ts(100), 90.0).await.unwrap();
        tx.commit().await.unwrap();

        let filter = SessionFilter {
            org_id: Some("acme".to_owned()),
            ..SessionFilter::default()
        };
        let rows = list_sessions(&pool, &filter, 50, 0).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].session_id, "s2", "newest first");

        let closed = SessionFilter {
            org_id: Some("acme".to_owned()),
            status: Some(STATUS_CLOSED.to_owned()),
            ..SessionFilter::default()
        };
        let rows = list_sessions(&pool, &closed, 50, 0).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].session_id, "s2");

        let page = list_sessions(&pool, &filter, 1, 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].session_id, "s1");
    }
}
