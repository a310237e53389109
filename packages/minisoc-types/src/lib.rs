//! # minisoc-types
//!
//! Shared contract for the MiniSOC pipeline.
//!
//! These types are used by:
//! - `minisoc-agent`: building normalized events from parsed auth-log lines
//!   and POSTing them to the server
//! - `minisoc-server`: validating `/ingest` payloads, storing events and
//!   alerts, and deriving detections
//!
//! The wire format is JSON with the `"schema"` tag `minisoc.event.v1`; see
//! [`schema::NormalizedEvent`] for the canonical field order.

pub mod config;
pub mod schema;

pub use config::{load_config, AgentConfig, AppConfig, ConfigError, LoggingConfig, ServerConfig};
pub use schema::{
    utc_now_rfc3339, Alert, Endpoint, EventCore, FieldError, Host, NormalizedEvent, Outcome,
    RawLine, SourceDesc, User, ValidationErrors, EVENT_SCHEMA, SUSPICIOUS_SCHEMA,
};
