//! Telemetry sample rows: append-only, raw wire payload retained verbatim.

use chrono::{DateTime, Utc};
use roast_protocol::{Envelope, Origin, TelemetrySample};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleRow {
    pub session_id: String,
    pub org_id: String,
    pub site_id: String,
    pub machine_id: String,
    pub ts: DateTime<Utc>,
    pub elapsed_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bt_c: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub et_c: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ror_c_per_min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ambient_c: Option<f64>,
    pub raw: serde_json::Value,
}

impl SampleRow {
    pub fn from_envelope(envelope: &Envelope, sample: &TelemetrySample, session_id: &str) -> Self {
        Self {
            session_id: session_id.to_owned(),
            org_id: envelope.origin.org_id.clone(),
            site_id: envelope.origin.site_id.clone(),
            machine_id: envelope.origin.machine_id.clone(),
            ts: sample.ts,
            elapsed_seconds: sample.elapsed_seconds,
            bt_c: sample.bt_c,
            et_c: sample.et_c,
            ror_c_per_min: sample.ror_c_per_min,
            ambient_c: sample.ambient_c,
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

fn row_to_sample(row: &SqliteRow) -> SampleRow {
    let raw: String = row.get("raw_json");
    SampleRow {
        session_id: row.get("session_id"),
        org_id: row.get("org_id"),
        site_id: row.get("site_id"),
        machine_id: row.get("machine_id"),
        ts: row.get("ts"),
        elapsed_seconds: row.get("elapsed_seconds"),
        bt_c: row.get("bt_c"),
        et_c: row.get("et_c"),
        ror_c_per_min: row.get("ror_c_per_min"),
        ambient_c: row.get("ambient_c"),
        raw: serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null),
    }
}

pub async fn insert_sample(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    sample: &SampleRow,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO telemetry_points
             (session_id, org_id, site_id, machine_id, ts, elapsed_seconds,
              bt_c, et_c, ror_c_per_min, ambient_c, raw_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
    )
    .bind(&sample.session_id)
    .bind(&sample.org_id)
    .bind(&sample.site_id)
    .bind(&sample.machine_id)
    .bind(sample.ts)
    .bind(sample.elapsed_seconds)
    .bind(sample.bt_c)
    .bind(sample.et_c)
    .bind(sample.ror_c_per_min)
    .bind(sample.ambient_c)
    .bind(sample.raw.to_string())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Fetch a session's samples ordered by `elapsed_seconds` ascending, with an
/// optional elapsed-time window.
pub async fn fetch_session_telemetry(
    pool: &SqlitePool,
    session_id: &str,
    limit: i64,
    from_elapsed: Option<f64>,
    to_elapsed: Option<f64>,
) -> Result<Vec<SampleRow>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT session_id, org_id, site_id, machine_id, ts, elapsed_seconds,
                bt_c, et_c, ror_c_per_min, ambient_c, raw_json
         FROM telemetry_points
         WHERE session_id = ?1
           AND (?2 IS NULL OR elapsed_seconds >= ?2)
           AND (?3 IS NULL OR elapsed_seconds <= ?3)
         ORDER BY elapsed_seconds ASC
         LIMIT ?4",
    )
    .bind(session_id)
    .bind(from_elapsed)
    .bind(to_elapsed)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(row_to_sample).collect())
}

/// Aggregates the closure orchestrator needs at session close.
#[derive(Debug, Clone, Copy, Default)]
pub struct TelemetryStats {
    pub points: i64,
    pub has_bt: bool,
    pub has_et: bool,
    pub max_elapsed_seconds: Option<f64>,
}

pub async fn telemetry_stats(
    pool: &SqlitePool,
    session_id: &str,
) -> Result<TelemetryStats, sqlx::Error> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS points,
                MAX(bt_c IS NOT NULL) AS has_bt,
                MAX(et_c IS NOT NULL) AS has_et,
                MAX(elapsed_seconds) AS max_elapsed
         FROM telemetry_points WHERE session_id = ?1",
    )
    .bind(session_id)
    .fetch_one(pool)
    .await?;
    Ok(TelemetryStats {
        points: row.get("points"),
        has_bt: row.get::<Option<i64>, _>("has_bt").unwrap_or(0) != 0,
        has_et: row.get::<Option<i64>, _>("has_et").unwrap_or(0) != 0,
        max_elapsed_seconds: row.get("max_elapsed"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use crate::repo::sessions::ensure_session;
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

    fn sample(session_id: &str, elapsed: f64, bt: Option<f64>) -> SampleRow {
        SampleRow {
            session_id: session_id.to_owned(),
            org_id: "acme".to_owned(),
            site_id: "plant-1".to_owned(),
            machine_id: "r2".to_owned(),
            ts: ts(elapsed as u32),
            elapsed_seconds: elapsed,
            bt_c: bt,
            et_c: None,
            ror_c_per_min: None,
            ambient_c: None,
            raw: serde_json::json!({"elapsedSeconds": elapsed}),
        }
    }

    async fn seed(pool: &SqlitePool, rows: &[SampleRow]) {
        let mut tx = pool.begin().await.unwrap();
        ensure_session(&mut tx, "s1", &origin(), ts(0)).await.unwrap();
        for row in rows {
            insert_sample(&mut tx, row).await.unwrap();
        }
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn telemetry_is_ordered_by_elapsed_and_windowed() {
        let pool = memory_pool().await;
        seed(
            &pool,
            &[
                sample("s1", 20.0, None),
                sample("s1", 0.0, Some(95.0)),
                sample("s1", 10.0, Some(120.0)),
            ],
        )
        .await;

        let all = fetch_session_telemetry(&pool, "s1", 2000, None, None).await.unwrap();
        let elapsed: Vec<f64> = all.iter().map(|r| r.elapsed_seconds).collect();
        assert_eq!(elapsed, vec![0.0, 10.0, 20.0]);

        let windowed = fetch_session_telemetry(&pool, "s1", 2000, Some(5.0), Some(15.0))
            .await
            .unwrap();
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].elapsed_seconds, 10.0);

        let limited = fetch_session_telemetry(&pool, "s1", 2, None, None).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn raw_json_round_trips_verbatim() {
        let pool = memory_pool().await;
        let mut row = sample("s1", 1.0, None);
        row.raw = serde_json::json!({"elapsedSeconds": 1.0, "gasPct": 62, "note": "warmup"});
        seed(&pool, std::slice::from_ref(&row)).await;

        let fetched = fetch_session_telemetry(&pool, "s1", 10, None, None).await.unwrap();
        assert_eq!(fetched[0].raw, row.raw);
    }

    #[tokio::test]
    async fn stats_summarize_channel_presence_and_max_elapsed() {
        let pool = memory_pool().await;
        seed(
            &pool,
            &[sample("s1", 0.0, None), sample("s1", 42.0, Some(150.0))],
        )
        .await;

        let stats = telemetry_stats(&pool, "s1").await.unwrap();
        assert_eq!(stats.points, 2);
        assert!(stats.has_bt);
        assert!(!stats.has_et);
        assert_eq!(stats.max_elapsed_seconds, Some(42.0));

        let empty = telemetry_stats(&pool, "nope").await.unwrap();
        assert_eq!(empty.points, 0);
        assert_eq!(empty.max_elapsed_seconds, None);
    }
}
