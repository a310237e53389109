//! # replay
//!
//! Offline scenario driver: read a recorded JSONL scenario and push it
//! through `/ingest` at a paced delay, as if an agent were watching the
//! attack live. Payloads go over the wire exactly as recorded — the server's
//! validation is part of what a scenario exercises.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub sent: u64,
    pub failed: u64,
}

/// One JSON payload per non-blank, non-`#` line. An unparsable line is fatal:
/// a broken scenario should be fixed, not half-replayed.
pub fn parse_jsonl(text: &str, origin: &Path) -> Result<Vec<serde_json::Value>> {
    let mut payloads = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(v) => payloads.push(v),
            Err(e) => bail!(
                "invalid JSON on line {} of {}: {e}",
                idx + 1,
                origin.display()
            ),
        }
    }
    Ok(payloads)
}

pub async fn replay_scenario(
    server_url: &str,
    scenario: &Path,
    delay: Duration,
    timeout: Duration,
) -> Result<ReplayStats> {
    let text = tokio::fs::read_to_string(scenario)
        .await
        .with_context(|| format!("cannot read scenario {}", scenario.display()))?;
    let payloads = parse_jsonl(&text, scenario)?;

    let ingest_url = format!("{}/ingest", server_url.trim_end_matches('/'));
    let client = reqwest::Client::builder().timeout(timeout).build()?;

    info!(
        scenario = %scenario.display(),
        events = payloads.len(),
        delay_ms = delay.as_millis() as u64,
        "replay starting"
    );

    let mut stats = ReplayStats::default();
    for payload in payloads {
        stats.sent += 1;
        match client.post(&ingest_url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                stats.failed += 1;
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                error!(
                    "ingest failed status={status} body={}",
                    body.chars().take(500).collect::<String>()
                );
            }
            Err(e) => {
                stats.failed += 1;
                error!("ingest request error: {e}");
            }
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    info!(sent = stats.sent, failed = stats.failed, "replay done");
    Ok(stats)
}
