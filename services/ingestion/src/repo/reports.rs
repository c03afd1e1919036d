//! Session reports.
//!
//! Creation is idempotent on `(session_id, report_kind)`: the unique index
//! makes the second insert a no-op and the first body is preserved.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use uuid::Uuid;

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRow {
    pub report_id: String,
    pub session_id: String,
    pub report_kind: String,
    pub body: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

fn row_to_report(row: &SqliteRow) -> ReportRow {
    let body: String = row.get("body_json");
    ReportRow {
        report_id: row.get("report_id"),
        session_id: row.get("session_id"),
        report_kind: row.get("report_kind"),
        body: serde_json::from_str(&body).unwrap_or(serde_json::Value::Null),
        created_at: row.get("created_at"),
    }
}

const SELECT: &str =
    "SELECT report_id, session_id, report_kind, body_json, created_at FROM session_reports";

/// Create a report, or return the existing one.  The bool is true when this
/// call created the row.
pub async fn create_report(
    pool: &SqlitePool,
    session_id: &str,
    report_kind: &str,
    body: &serde_json::Value,
    now: DateTime<Utc>,
) -> Result<(ReportRow, bool), sqlx::Error> {
    let report_id = Uuid::new_v4().to_string();
    let inserted = sqlx::query(
        "INSERT INTO session_reports (report_id, session_id, report_kind, body_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (session_id, report_kind) DO NOTHING",
    )
    .bind(&report_id)
    .bind(session_id)
    .bind(report_kind)
    .bind(body.to_string())
    .bind(now)
    .execute(pool)
    .await?
    .rows_affected()
        == 1;

    let row = sqlx::query(sqlx::AssertSqlSafe(format!(
        "{SELECT} WHERE session_id = ?1 AND report_kind = ?2"
    )))
    .bind(session_id)
    .bind(report_kind)
    .fetch_one(pool)
    .await?;
    Ok((row_to_report(&row), inserted))
}

pub async fn list_reports(
    pool: &SqlitePool,
    session_id: &str,
    limit: i64,
    offset: i64,
) -> Result<Vec<ReportRow>, sqlx::Error> {
    let rows = sqlx::query(sqlx::AssertSqlSafe(format!(
        "{SELECT} WHERE session_id = ?1
         ORDER BY created_at DESC, report_id DESC
         LIMIT ?2 OFFSET ?3"
    )))
    .bind(session_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(row_to_report).collect())
}

pub async fn latest_report(
    pool: &SqlitePool,
    session_id: &str,
) -> Result<Option<ReportRow>, sqlx::Error> {
    let row = sqlx::query(sqlx::AssertSqlSafe(format!(
        "{SELECT} WHERE session_id = ?1
         ORDER BY created_at DESC, report_id DESC
         LIMIT 1"
    )))
    .bind(session_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(row_to_report))
}

pub async fn get_report(
    pool: &SqlitePool,
    report_id: &str,
) -> Result<Option<ReportRow>, sqlx::Error> {
    let row = sqlx::query(sqlx::AssertSqlSafe(format!("{SELECT} WHERE report_id = ?1")))
        .bind(report_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(row_to_report))
}

pub async fn report_exists(
    pool: &SqlitePool,
    session_id: &str,
    report_kind: &str,
) -> Result<bool, sqlx::Error> {
    let row = sqlx::query(
        "SELECT EXISTS(
             SELECT 1 FROM session_reports WHERE session_id = ?1 AND report_kind = ?2
         ) AS present",
    )
    .bind(session_id)
    .bind(report_kind)
    .fetch_one(pool)
    .await?;
    Ok(row.get::<i64, _>("present") != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use crate::repo::sessions::ensure_session;
    use chrono::TimeZone;
    use roast_protocol::{DEFAULT_REPORT_KIND, Origin};

    async fn seeded_pool() -> SqlitePool {
        let pool = memory_pool().await;
        let mut tx = pool.begin().await.unwrap();
        ensure_session(
            &mut tx,
            "s1",
            &Origin {
                org_id: "acme".to_owned(),
                site_id: "plant-1".to_owned(),
                machine_id: "r2".to_owned(),
            },
            Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap(),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        pool
    }

    #[tokio::test]
    async fn create_is_idempotent_per_session_and_kind() {
        let pool = seeded_pool().await;
        let now = Utc::now();

        let (first, created) = create_report(
            &pool,
            "s1",
            DEFAULT_REPORT_KIND,
            &serde_json::json!({"summary": "clean roast"}),
            now,
        )
        .await
        .unwrap();
        assert!(created);

        let (second, created_again) = create_report(
            &pool,
            "s1",
            DEFAULT_REPORT_KIND,
            &serde_json::json!({"summary": "OVERWRITE ATTEMPT"}),
            now + chrono::Duration::seconds(10),
        )
        .await
        .unwrap();
        assert!(!created_again);
        assert_eq!(second.report_id, first.report_id, "identical reportId");
        assert_eq!(
            second.body,
            serde_json::json!({"summary": "clean roast"}),
            "first body preserved"
        );

        let all = list_reports(&pool, "s1", 50, 0).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn different_kinds_coexist_and_latest_wins() {
        let pool = seeded_pool().await;
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();

        create_report(&pool, "s1", "POST_ROAST_V1", &serde_json::json!({"v": 1}), base)
            .await
            .unwrap();
        create_report(
            &pool,
            "s1",
            "CUPPING_V1",
            &serde_json::json!({"v": 2}),
            base + chrono::Duration::seconds(60),
        )
        .await
        .unwrap();

        assert_eq!(list_reports(&pool, "s1", 50, 0).await.unwrap().len(), 2);
        let latest = latest_report(&pool, "s1").await.unwrap().unwrap();
        assert_eq!(latest.report_kind, "CUPPING_V1");
        assert!(report_exists(&pool, "s1", "POST_ROAST_V1").await.unwrap());
        assert!(!report_exists(&pool, "s1", "NOPE").await.unwrap());
    }

    #[tokio::test]
    async fn get_report_finds_by_id() {
        let pool = seeded_pool().await;
        let (row, _) = create_report(
            &pool,
            "s1",
            DEFAULT_REPORT_KIND,
            &serde_json::json!({}),
            Utc::now(),
        )
        .await
        .unwrap();
        let fetched = get_report(&pool, &row.report_id).await.unwrap().unwrap();
        assert_eq!(fetched.session_id, "s1");
        assert!(get_report(&pool, "missing").await.unwrap().is_none());
    }
}
