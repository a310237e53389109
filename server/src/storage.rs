//! # storage
//!
//! SQLite persistence for events and alerts. Connections come from a small
//! pool and live only as long as one operation; WAL journaling keeps readers
//! unblocked while `/ingest` writes.
//!
//! Write discipline mirrors the id semantics of the schema:
//! - events: INSERT OR REPLACE — `event_id` is the idempotency key, so
//!   re-ingesting a stream overwrites instead of duplicating
//! - alerts: INSERT OR IGNORE — `alert_id` is a stable hash, a re-derived
//!   alert collides and the insert is a no-op

use std::path::Path;

use minisoc_types::{Alert, NormalizedEvent};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::Row;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("stored JSON decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn connect(db_path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn init(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
              event_id TEXT PRIMARY KEY,
              ts TEXT NOT NULL,
              host TEXT NOT NULL,
              event_type TEXT NOT NULL,
              action TEXT NOT NULL,
              outcome TEXT NOT NULL,
              severity INTEGER NOT NULL,
              user TEXT,
              src_ip TEXT,
              message TEXT NOT NULL,
              json TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_ts ON events(ts)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_user ON events(user)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_src_ip ON events(src_ip)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
              alert_id TEXT PRIMARY KEY,
              ts TEXT NOT NULL,
              rule_id TEXT NOT NULL,
              title TEXT NOT NULL,
              severity INTEGER NOT NULL,
              entity TEXT NOT NULL,
              event_ids TEXT NOT NULL,
              details TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_alerts_ts ON alerts(ts)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_alerts_rule_id ON alerts(rule_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_alerts_entity ON alerts(entity)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_events(&self, events: &[NormalizedEvent]) -> Result<u64, StorageError> {
        let mut inserted = 0;
        for ev in events {
            let json = serde_json::to_string(ev)?;
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO events
                (event_id, ts, host, event_type, action, outcome, severity, user, src_ip, message, json)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(ev.event_id.to_string())
            .bind(&ev.ts)
            .bind(&ev.host.name)
            .bind(&ev.event.kind)
            .bind(&ev.event.action)
            .bind(ev.event.outcome.as_str())
            .bind(i64::from(ev.event.severity))
            .bind(ev.user_name())
            .bind(ev.src_ip())
            .bind(&ev.message)
            .bind(json)
            .execute(&self.pool)
            .await?;
            inserted += 1;
        }
        Ok(inserted)
    }

    /// Returns false when the alert already existed (stable-id collision).
    pub async fn insert_alert(&self, alert: &Alert) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO alerts
            (alert_id, ts, rule_id, title, severity, entity, event_ids, details)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&alert.alert_id)
        .bind(&alert.ts)
        .bind(&alert.rule_id)
        .bind(&alert.title)
        .bind(i64::from(alert.severity))
        .bind(&alert.entity)
        .bind(serde_json::to_string(&alert.event_ids)?)
        .bind(serde_json::to_string(&alert.details)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Last N events, newest first, as the original ingested JSON.
    pub async fn recent_events(&self, limit: i64) -> Result<Vec<serde_json::Value>, StorageError> {
        let rows = sqlx::query("SELECT json FROM events ORDER BY ts DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let json: String = row.try_get("json")?;
                Ok(serde_json::from_str(&json)?)
            })
            .collect()
    }

    /// Last N alerts, newest first, with JSON columns decoded.
    pub async fn recent_alerts(&self, limit: i64) -> Result<Vec<Alert>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT alert_id, ts, rule_id, title, severity, entity, event_ids, details
            FROM alerts ORDER BY ts DESC LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let event_ids: String = row.try_get("event_ids")?;
                let details: String = row.try_get("details")?;
                Ok(Alert {
                    alert_id: row.try_get("alert_id")?,
                    ts: row.try_get("ts")?,
                    rule_id: row.try_get("rule_id")?,
                    title: row.try_get("title")?,
                    severity: row.try_get::<i64, _>("severity")? as u8,
                    entity: row.try_get("entity")?,
                    event_ids: serde_json::from_str(&event_ids)?,
                    details: serde_json::from_str(&details)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minisoc_types::{utc_now_rfc3339, Outcome};

    fn event(user: &str, ip: &str, ts: &str) -> NormalizedEvent {
        NormalizedEvent::from_parts(
            ts.to_string(),
            "test-host",
            None,
            "auth",
            "/var/log/auth.log",
            "auth",
            "ssh_login",
            Outcome::Failure,
            4,
            format!("SSH login failure for user={user} from {ip}"),
            "Failed password for x from y port 1 ssh2",
            "auth.sshd",
            user,
            ip,
            22,
            vec!["ssh".into(), "auth".into(), "failure".into()],
        )
    }

    async fn temp_store(dir: &tempfile::TempDir) -> SqliteStorage {
        let store = SqliteStorage::connect(&dir.path().join("t.db")).await.unwrap();
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn event_roundtrip_preserves_original_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir).await;

        let ev = event("root", "1.2.3.4", "2026-01-12T00:00:00Z");
        assert_eq!(store.insert_events(&[ev.clone()]).await.unwrap(), 1);

        let recent = store.recent_events(5).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0], serde_json::to_value(&ev).unwrap());
    }

    #[tokio::test]
    async fn reingest_overwrites_by_event_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir).await;

        let mut ev = event("root", "1.2.3.4", "2026-01-12T00:00:00Z");
        store.insert_events(&[ev.clone()]).await.unwrap();
        ev.message = "rewritten".to_string();
        store.insert_events(&[ev]).await.unwrap();

        let recent = store.recent_events(5).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0]["message"], "rewritten");
    }

    #[tokio::test]
    async fn distinct_events_are_all_kept_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir).await;

        for i in 0..5 {
            let ts = format!("2026-01-12T00:00:0{i}Z");
            store.insert_events(&[event("root", "1.2.3.4", &ts)]).await.unwrap();
        }
        let recent = store.recent_events(5).await.unwrap();
        assert_eq!(recent.len(), 5);
        assert_eq!(recent[0]["ts"], "2026-01-12T00:00:04Z");
        assert_eq!(recent[4]["ts"], "2026-01-12T00:00:00Z");
    }

    #[tokio::test]
    async fn alert_insert_is_idempotent_by_alert_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir).await;

        let alert = Alert {
            alert_id: "a_0123456789abcdef01234567".to_string(),
            ts: utc_now_rfc3339(),
            rule_id: "AUTH001".to_string(),
            title: "SSH brute force suspected".to_string(),
            severity: 7,
            entity: "src_ip:1.2.3.4".to_string(),
            event_ids: vec!["e1".into(), "e2".into()],
            details: serde_json::json!({"threshold": 5, "bucket": "2026-01-12T00:00"}),
        };
        assert!(store.insert_alert(&alert).await.unwrap());
        assert!(!store.insert_alert(&alert).await.unwrap());

        let recent = store.recent_alerts(5).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].event_ids, vec!["e1", "e2"]);
        assert_eq!(recent[0].details["threshold"], 5);
    }
}
