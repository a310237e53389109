//! # api
//!
//! HTTP surface: `/ingest`, `/health`, `/events/recent`, `/alerts/recent`.
//!
//! Detection and routing mutate per-rule state on every event, so the whole
//! detect→alert→route step runs under one mutex — throughput stays well
//! inside the few-hundred-events/s this deployment sees, and a lock is a
//! much smaller surface than per-rule locking.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use minisoc_types::{utc_now_rfc3339, NormalizedEvent};

use crate::alerting::AlertRouter;
use crate::detect::DetectionEngine;
use crate::storage::SqliteStorage;

/// Engine and router share one lock: rule state and suppression counters are
/// only ever touched with ingest serialized.
pub struct DetectionPipeline {
    pub engine: DetectionEngine,
    pub router: AlertRouter,
}

pub struct AppState {
    pub storage: SqliteStorage,
    pub pipeline: Mutex<DetectionPipeline>,
    pub jsonl_path: PathBuf,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ingest", post(ingest))
        .route("/health", get(health))
        .route("/events/recent", get(recent_events))
        .route("/alerts/recent", get(recent_alerts))
        .with_state(state)
}

// ── Handlers ──────────────────────────────────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "ts": utc_now_rfc3339() }))
}

fn bad_request(errors: serde_json::Value) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "ok": false, "errors": errors })),
    )
        .into_response()
}

fn storage_failure(context: &str, err: impl std::fmt::Display) -> Response {
    error!("{context}: {err}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "ok": false, "error": "storage failure" })),
    )
        .into_response()
}

pub async fn ingest(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<serde_json::Value>,
) -> Response {
    let ev: NormalizedEvent = match serde_json::from_value(payload) {
        Ok(ev) => ev,
        Err(e) => {
            return bad_request(json!([{ "field": "$", "error": e.to_string() }]));
        }
    };
    if let Err(errors) = ev.validate() {
        return bad_request(json!(errors.0));
    }

    if let Err(e) = state.storage.insert_events(std::slice::from_ref(&ev)).await {
        return storage_failure("event insert failed", e);
    }

    // Archival JSONL is best-effort: the event is already durable in SQLite.
    if let Err(e) = append_jsonl(&state.jsonl_path, &ev).await {
        warn!("events.jsonl append failed: {e}");
    }

    let mut alerts = 0u64;
    {
        let mut pipeline = state.pipeline.lock().await;
        let detections = pipeline.engine.process(&ev);
        for det in detections {
            // Alerts display the event's own time; only the dedupe TTL runs
            // on routing time.
            let alert = pipeline.engine.to_alert(&det, &ev.ts);
            if let Err(e) = state.storage.insert_alert(&alert).await {
                return storage_failure("alert insert failed", e);
            }
            // Notifier trouble is logged but never unwinds an ingest.
            if let Err(e) = pipeline.router.route(&alert) {
                warn!("alert routing failed: alert_id={} err={e}", alert.alert_id);
            }
            alerts += 1;
        }
    }

    info!(
        event_id = %ev.event_id,
        kind = %ev.event.kind,
        action = %ev.event.action,
        alerts,
        "ingested"
    );
    (
        StatusCode::OK,
        Json(json!({ "ok": true, "event_id": ev.event_id, "alerts": alerts })),
    )
        .into_response()
}

async fn append_jsonl(path: &Path, ev: &NormalizedEvent) -> anyhow::Result<()> {
    let line = format!("{}\n", serde_json::to_string(ev)?);
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    f.write_all(line.as_bytes()).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct RecentParams {
    limit: Option<i64>,
}

async fn recent_events(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RecentParams>,
) -> Response {
    match state.storage.recent_events(params.limit.unwrap_or(50)).await {
        Ok(events) => Json(json!({ "events": events })).into_response(),
        Err(e) => storage_failure("recent events query failed", e),
    }
}

async fn recent_alerts(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RecentParams>,
) -> Response {
    match state.storage.recent_alerts(params.limit.unwrap_or(50)).await {
        Ok(alerts) => Json(json!({ "alerts": alerts })).into_response(),
        Err(e) => storage_failure("recent alerts query failed", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::{ConsoleNotifier, DedupeCache};
    use minisoc_types::{Outcome, EVENT_SCHEMA};

    async fn test_state(dir: &tempfile::TempDir) -> Arc<AppState> {
        let storage = SqliteStorage::connect(&dir.path().join("t.db")).await.unwrap();
        storage.init().await.unwrap();
        let dedupe = DedupeCache::load(&dir.path().join("dedupe.txt"), 60).unwrap();
        Arc::new(AppState {
            storage,
            pipeline: Mutex::new(DetectionPipeline {
                engine: DetectionEngine::new(),
                router: AlertRouter::new(Box::new(ConsoleNotifier), dedupe),
            }),
            jsonl_path: dir.path().join("events.jsonl"),
        })
    }

    fn failure_payload(user: &str, ts: &str) -> serde_json::Value {
        let ev = NormalizedEvent::from_parts(
            ts.to_string(),
            "pi-host",
            None,
            "auth",
            "/var/log/auth.log",
            "auth",
            "ssh_login",
            Outcome::Failure,
            4,
            format!("SSH login failure for user={user} from 203.0.113.10"),
            "Failed password for x from y port 1 ssh2",
            "auth.sshd",
            user,
            "203.0.113.10",
            51022,
            vec!["ssh".into(), "auth".into(), "failure".into()],
        );
        serde_json::to_value(ev).unwrap()
    }

    #[tokio::test]
    async fn valid_event_is_accepted_and_archived() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir).await;

        let resp = ingest(
            State(state.clone()),
            Json(failure_payload("root", "2026-01-12T10:00:01Z")),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let stored = state.storage.recent_events(5).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0]["schema"], EVENT_SCHEMA);

        let jsonl = std::fs::read_to_string(&state.jsonl_path).unwrap();
        assert_eq!(jsonl.lines().count(), 1);
    }

    #[tokio::test]
    async fn wrong_schema_tag_is_rejected_with_field_errors() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir).await;

        let mut payload = failure_payload("root", "2026-01-12T10:00:01Z");
        payload["schema"] = json!("minisoc.event.v0");
        let resp = ingest(State(state.clone()), Json(payload)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(state.storage.recent_events(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_body_is_rejected_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir).await;

        let resp = ingest(State(state), Json(json!({"not": "an event"}))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn brute_force_stream_produces_an_alert() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir).await;

        for i in 0..5 {
            let ts = format!("2026-01-12T10:00:0{i}Z");
            let resp = ingest(State(state.clone()), Json(failure_payload("root", &ts))).await;
            assert_eq!(resp.status(), StatusCode::OK);
        }

        let alerts = state.storage.recent_alerts(10).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule_id, "AUTH001");
        assert_eq!(alerts[0].entity, "src_ip:203.0.113.10");
    }
}
