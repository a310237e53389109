//! # tail
//!
//! The agent's main loop: pull lines from the chosen source, parse, feed the
//! local burst tracker, POST to the server. One control flow per source —
//! everything downstream of the follower runs sequentially, so no state here
//! needs locking. Delivery is at-most-once: a failed POST is counted and
//! logged, never retried.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use minisoc_types::{NormalizedEvent, Outcome};
use tracing::{info, warn};

use crate::parser::parse_sshd_line;
use crate::sources::{
    FileFollower, JournalFollower, ReadMode, SourceDecision, SourceKind, JOURNAL_SOURCE_PATH,
};
use crate::suspicious::SuspiciousTracker;

const INGEST_TIMEOUT: Duration = Duration::from_secs(5);

// ── Counters ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TailStats {
    pub read: u64,
    pub parsed: u64,
    pub sent: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    read: AtomicU64,
    parsed: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> TailStats {
        TailStats {
            read: self.read.load(Ordering::Relaxed),
            parsed: self.parsed.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

// ── Options ───────────────────────────────────────────────────────────────────

pub struct TailOptions {
    pub server_url: String,
    pub host_name: String,
    pub host_ip: Option<String>,
    pub mode: ReadMode,
    pub from_start: bool,
    pub dry_run: bool,
    /// Heartbeat cadence in live mode; `None` disables it.
    pub heartbeat: Option<Duration>,
    pub suspicious_path: PathBuf,
}

// ── Line source dispatch ──────────────────────────────────────────────────────

enum LineSource {
    File(FileFollower),
    Journal(JournalFollower),
}

impl LineSource {
    async fn next_line(&mut self) -> Result<Option<String>> {
        match self {
            LineSource::File(f) => f.next_line().await,
            LineSource::Journal(j) => j.next_line().await,
        }
    }
}

// ── Main loop ─────────────────────────────────────────────────────────────────

/// Run the tail→parse→track→send pipeline until the source ends (replay) or
/// the process is interrupted (live).
pub async fn run_tail_auth(opts: TailOptions, decision: SourceDecision) -> Result<TailStats> {
    let (mut source, source_path) = match decision.kind {
        SourceKind::File => {
            let path = decision
                .path
                .as_deref()
                .with_context(|| format!("no auth log path available ({})", decision.reason))?;
            let follower = FileFollower::open(path, opts.mode, opts.from_start)?;
            (
                LineSource::File(follower),
                path.display().to_string(),
            )
        }
        SourceKind::Journal => (
            LineSource::Journal(JournalFollower::new(opts.mode)),
            JOURNAL_SOURCE_PATH.to_string(),
        ),
    };

    let mut tracker = SuspiciousTracker::new(
        &opts.suspicious_path,
        crate::suspicious::DEFAULT_WINDOW_S,
        crate::suspicious::DEFAULT_THRESHOLD,
        crate::suspicious::DEFAULT_COOLDOWN_S,
    )?;

    let client = reqwest::Client::builder()
        .timeout(INGEST_TIMEOUT)
        .build()
        .context("failed to build HTTP client")?;
    let ingest_url = format!("{}/ingest", opts.server_url.trim_end_matches('/'));

    let counters = Arc::new(Counters::default());
    let heartbeat = match (opts.mode, opts.heartbeat) {
        (ReadMode::Live, Some(every)) => {
            let counters = counters.clone();
            Some(tokio::spawn(async move {
                let mut tick = tokio::time::interval(every);
                tick.tick().await; // immediate first tick is noise
                loop {
                    tick.tick().await;
                    let s = counters.snapshot();
                    info!(
                        read = s.read,
                        parsed = s.parsed,
                        sent = s.sent,
                        failed = s.failed,
                        "agent heartbeat"
                    );
                }
            }))
        }
        _ => None,
    };

    while let Some(line) = source.next_line().await? {
        counters.read.fetch_add(1, Ordering::Relaxed);

        let Some(ev) = parse_sshd_line(&line, &opts.host_name, opts.host_ip.as_deref(), &source_path)
        else {
            continue;
        };
        counters.parsed.fetch_add(1, Ordering::Relaxed);

        if ev.event.outcome == Outcome::Failure {
            if let Err(e) = tracker.observe_failure(&ev).await {
                warn!("suspicious tracker write failed: {e}");
            }
        }

        if opts.dry_run {
            println!("{}", serde_json::to_string(&ev)?);
            continue;
        }

        match send_event(&client, &ingest_url, &ev).await {
            Ok(()) => {
                counters.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!("send failed: server={} err={e:#}", opts.server_url);
            }
        }
    }

    if let Some(hb) = heartbeat {
        hb.abort();
    }

    let stats = counters.snapshot();
    info!(
        read = stats.read,
        parsed = stats.parsed,
        sent = stats.sent,
        failed = stats.failed,
        "tail finished"
    );
    Ok(stats)
}

async fn send_event(
    client: &reqwest::Client,
    ingest_url: &str,
    ev: &NormalizedEvent,
) -> Result<()> {
    let resp = client.post(ingest_url).json(ev).send().await?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("ingest returned {status}: {}", body.chars().take(500).collect::<String>());
    }
    Ok(())
}
