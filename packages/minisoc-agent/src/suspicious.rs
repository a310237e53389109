//! # suspicious
//!
//! Agent-local burst tracker. Counts SSH failures per source IP inside a
//! sliding window and appends a `minisoc.suspicious.v1` JSONL record when a
//! burst crosses the threshold. The record lands on local disk so the alarm
//! survives a server outage; nothing here ever goes over the wire.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use minisoc_types::{NormalizedEvent, SUSPICIOUS_SCHEMA};
use serde_json::json;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

pub const DEFAULT_WINDOW_S: i64 = 60;
pub const DEFAULT_THRESHOLD: u32 = 5;
pub const DEFAULT_COOLDOWN_S: i64 = 60;

#[derive(Debug)]
struct IpState {
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    last_emit: Option<DateTime<Utc>>,
    total_failures: u64,
    window_failures: u32,
    window_reset_at: DateTime<Utc>,
    users: BTreeSet<String>,
    ports: BTreeSet<u16>,
}

/// Threshold + cooldown keeps the JSONL from turning into a second copy of
/// the auth log during a sustained brute force.
pub struct SuspiciousTracker {
    path: PathBuf,
    window: Duration,
    threshold: u32,
    cooldown: Duration,
    state: HashMap<String, IpState>,
}

impl SuspiciousTracker {
    pub fn new(path: &Path, window_s: i64, threshold: u32, cooldown_s: i64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create suspicious log dir {}", parent.display()))?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            window: Duration::seconds(window_s.max(1)),
            threshold: threshold.max(1),
            cooldown: Duration::seconds(cooldown_s.max(0)),
            state: HashMap::new(),
        })
    }

    /// Account one failure event. Returns true when a record was appended.
    pub async fn observe_failure(&mut self, ev: &NormalizedEvent) -> Result<bool> {
        let Some(ip) = ev.src_ip().map(str::to_string) else {
            return Ok(false);
        };

        let now = Utc::now();
        let st = self.state.entry(ip.clone()).or_insert_with(|| IpState {
            first_seen: now,
            last_seen: now,
            last_emit: None,
            total_failures: 0,
            window_failures: 0,
            window_reset_at: now,
            users: BTreeSet::new(),
            ports: BTreeSet::new(),
        });

        st.last_seen = now;
        st.total_failures += 1;

        if now - st.window_reset_at > self.window {
            st.window_reset_at = now;
            st.window_failures = 0;
            st.users.clear();
            st.ports.clear();
        }

        st.window_failures += 1;
        if let Some(user) = ev.user_name() {
            st.users.insert(user.to_string());
        }
        if let Some(port) = ev.src.as_ref().and_then(|s| s.port) {
            st.ports.insert(port);
        }

        if st.window_failures < self.threshold {
            return Ok(false);
        }
        if let Some(last_emit) = st.last_emit {
            if self.cooldown > Duration::zero() && now - last_emit < self.cooldown {
                return Ok(false);
            }
        }
        st.last_emit = Some(now);

        let record = json!({
            "schema": SUSPICIOUS_SCHEMA,
            "ts": now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            "reason": format!(
                "local_ssh_bruteforce: >= {} failures in {}s",
                self.threshold,
                self.window.num_seconds()
            ),
            "src": { "ip": ip, "ports": st.ports },
            "usernames": st.users,
            "counts": {
                "window_failures": st.window_failures,
                "total_failures": st.total_failures,
                "window_s": self.window.num_seconds(),
                "threshold": self.threshold,
                "cooldown_s": self.cooldown.num_seconds(),
            },
            "first_seen": st.first_seen.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            "last_seen": st.last_seen.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            "host": { "name": ev.host.name, "ip": ev.host.ip },
            "event": ev.event,
            "source": ev.source,
            "raw": ev.raw,
        });

        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("open suspicious log {}", self.path.display()))?;
        f.write_all(format!("{record}\n").as_bytes()).await?;
        f.flush().await?;
        Ok(true)
    }
}
