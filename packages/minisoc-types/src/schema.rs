//! # schema
//!
//! Normalized event schema — the wire contract between agent and server and
//! the shape of a stored event row.
//!
//! These types are used by:
//! - `minisoc-agent`: producing events from parsed auth-log lines
//! - `minisoc-server`: validating `/ingest` payloads, storage rows, detections
//!
//! Field order matters: `serde_json` serializes struct fields in declaration
//! order, and `events.jsonl` / the ingest wire format rely on that canonical
//! ordering. The internal `schema_id` field travels as the JSON key `"schema"`.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Schema tag carried by every normalized event.
pub const EVENT_SCHEMA: &str = "minisoc.event.v1";

/// Schema tag for agent-local suspicious window records (JSONL only).
pub const SUSPICIOUS_SCHEMA: &str = "minisoc.suspicious.v1";

/// Current wall clock as RFC3339 UTC with second precision and trailing `Z`.
pub fn utc_now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

// ── Event Sections ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

/// Origin descriptor: which collector produced the line and from where
/// (a file path, or `"journald:sshd"` for the journal poller).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDesc {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
    Unknown,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventCore {
    #[serde(rename = "type")]
    pub kind: String,
    pub action: String,
    pub outcome: Outcome,
    pub severity: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct User {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

/// Network endpoint. `geo` stays an open map — enrichment sources disagree on
/// which keys they provide beyond `lat`/`lon`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Endpoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawLine {
    pub line: String,
    pub parser: String,
}

// ── Normalized Event ──────────────────────────────────────────────────────────

/// One normalized security event.
///
/// `event_id` is agent-generated and doubles as the storage idempotency key:
/// re-ingesting the same event overwrites rather than duplicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedEvent {
    #[serde(rename = "schema")]
    pub schema_id: String,
    pub event_id: Uuid,
    pub ts: String,
    pub host: Host,
    pub source: SourceDesc,
    pub event: EventCore,
    pub message: String,
    pub raw: RawLine,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<Endpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<Endpoint>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A single failed validation check, keyed by the offending field path.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub error: String,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid event: {0:?}")]
pub struct ValidationErrors(pub Vec<FieldError>);

impl NormalizedEvent {
    /// Build an SSH-style auth event from parsed parts. Generates a fresh
    /// `event_id` and tags it with the wire schema.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        ts: String,
        host_name: &str,
        host_ip: Option<&str>,
        source_kind: &str,
        source_path: &str,
        event_kind: &str,
        event_action: &str,
        outcome: Outcome,
        severity: u8,
        message: String,
        raw_line: &str,
        parser: &str,
        user: &str,
        src_ip: &str,
        src_port: u16,
        tags: Vec<String>,
    ) -> Self {
        Self {
            schema_id: EVENT_SCHEMA.to_string(),
            event_id: Uuid::new_v4(),
            ts,
            host: Host {
                name: host_name.to_string(),
                ip: host_ip.map(str::to_string),
            },
            source: SourceDesc {
                kind: source_kind.to_string(),
                path: Some(source_path.to_string()),
            },
            event: EventCore {
                kind: event_kind.to_string(),
                action: event_action.to_string(),
                outcome,
                severity,
            },
            message,
            raw: RawLine {
                line: raw_line.to_string(),
                parser: parser.to_string(),
            },
            user: Some(User {
                name: Some(user.to_string()),
                uid: None,
            }),
            src: Some(Endpoint {
                ip: Some(src_ip.to_string()),
                port: Some(src_port),
                geo: None,
            }),
            dst: None,
            tags,
        }
    }

    /// Semantic checks beyond what deserialization enforces. Returns every
    /// violation, not just the first, so `/ingest` can answer 400 with the
    /// full field-error list.
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = Vec::new();

        if self.schema_id != EVENT_SCHEMA {
            errors.push(FieldError {
                field: "schema".to_string(),
                error: format!("expected {EVENT_SCHEMA:?}, got {:?}", self.schema_id),
            });
        }
        if !(1..=10).contains(&self.event.severity) {
            errors.push(FieldError {
                field: "event.severity".to_string(),
                error: format!("severity {} outside 1..=10", self.event.severity),
            });
        }
        if chrono::DateTime::parse_from_rfc3339(&self.ts).is_err() {
            errors.push(FieldError {
                field: "ts".to_string(),
                error: format!("{:?} is not an RFC3339 timestamp", self.ts),
            });
        }
        if self.host.name.is_empty() {
            errors.push(FieldError {
                field: "host.name".to_string(),
                error: "host name must not be empty".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors(errors))
        }
    }

    /// Convenience accessors used by the detection rules.
    pub fn src_ip(&self) -> Option<&str> {
        self.src.as_ref()?.ip.as_deref()
    }

    pub fn user_name(&self) -> Option<&str> {
        self.user.as_ref()?.name.as_deref()
    }
}

// ── Alert ─────────────────────────────────────────────────────────────────────

/// Durable, deduplicated record derived from a detection.
///
/// `alert_id` is a stable hash of `(rule_id, entity, bucket)` — deriving the
/// same detection twice collides on purpose, which is what makes the storage
/// insert idempotent and the router dedupe work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: String,
    pub ts: String,
    pub rule_id: String,
    pub title: String,
    pub severity: u8,
    pub entity: String,
    pub event_ids: Vec<String>,
    pub details: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> NormalizedEvent {
        NormalizedEvent::from_parts(
            "2026-01-12T03:15:00Z".to_string(),
            "pi-host",
            None,
            "auth",
            "/var/log/auth.log",
            "auth",
            "ssh_login",
            Outcome::Failure,
            4,
            "SSH login failure for user=root from 203.0.113.10".to_string(),
            "Jan 12 03:15:00 pi-host sshd[412]: Failed password for root from 203.0.113.10 port 51022 ssh2",
            "auth.sshd",
            "root",
            "203.0.113.10",
            51022,
            vec!["ssh".into(), "auth".into(), "failure".into()],
        )
    }

    #[test]
    fn schema_key_aliasing_round_trip() {
        let ev = sample_event();
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["schema"], EVENT_SCHEMA);
        assert!(json.get("schema_id").is_none());

        let back: NormalizedEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.schema_id, EVENT_SCHEMA);
        assert_eq!(back.event_id, ev.event_id);
        assert_eq!(back.src_ip(), Some("203.0.113.10"));
        assert_eq!(back.user_name(), Some("root"));
    }

    #[test]
    fn canonical_key_order_starts_with_schema() {
        let ev = sample_event();
        let line = serde_json::to_string(&ev).unwrap();
        assert!(line.starts_with("{\"schema\":\"minisoc.event.v1\",\"event_id\":"));
    }

    #[test]
    fn omitted_optional_sections_stay_off_the_wire() {
        let mut ev = sample_event();
        ev.user = None;
        ev.src = None;
        let line = serde_json::to_string(&ev).unwrap();
        assert!(!line.contains("\"user\""));
        assert!(!line.contains("\"src\""));
        assert!(!line.contains("\"dst\""));
    }

    #[test]
    fn validate_accepts_well_formed_event() {
        assert!(sample_event().validate().is_ok());
    }

    #[test]
    fn validate_collects_all_field_errors() {
        let mut ev = sample_event();
        ev.schema_id = "minisoc.event.v0".to_string();
        ev.event.severity = 11;
        ev.ts = "yesterday".to_string();

        let errs = ev.validate().unwrap_err().0;
        let fields: Vec<_> = errs.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["schema", "event.severity", "ts"]);
    }

    #[test]
    fn outcome_rejects_unknown_values() {
        let r: Result<Outcome, _> = serde_json::from_str("\"sideways\"");
        assert!(r.is_err());
    }

    #[test]
    fn utc_now_is_second_precision_zulu() {
        let ts = utc_now_rfc3339();
        assert!(ts.ends_with('Z'));
        assert!(!ts.contains('.'));
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }
}
