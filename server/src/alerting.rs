//! # alerting
//!
//! Alert materialization and routing: stable IDs, persisted TTL dedupe, and
//! suppressed-repeat accounting in front of a pluggable notifier.
//!
//! The dedupe TTL is measured from *routing time*, not event time. Replay
//! labs and delayed logs carry old event timestamps; keying the TTL off
//! those would make every replay re-notify.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use minisoc_types::Alert;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

/// `"a_"` + first 24 hex chars of `sha256(rule_id|entity|bucket)`.
/// Deterministic across restarts and architectures — alert identity must not
/// depend on process state.
pub fn stable_alert_id(rule_id: &str, entity: &str, bucket: &str) -> String {
    let digest = Sha256::digest(format!("{rule_id}|{entity}|{bucket}").as_bytes());
    format!("a_{}", &hex::encode(digest)[..24])
}

// ── Notifier ──────────────────────────────────────────────────────────────────

pub trait Notifier: Send + Sync {
    fn notify(&self, alert: &Alert, suppressed_repeats: u64);
}

/// Prints alerts to stdout. The detail map is printed with sorted keys so
/// repeated runs diff cleanly.
pub struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify(&self, alert: &Alert, suppressed_repeats: u64) {
        let extra = if suppressed_repeats > 0 {
            format!(" (+{suppressed_repeats} suppressed repeats)")
        } else {
            String::new()
        };
        println!(
            "[ALERT] {} {} sev={} {} :: {}{extra}",
            alert.ts, alert.rule_id, alert.severity, alert.entity, alert.title
        );
        if let Some(details) = alert.details.as_object() {
            if !details.is_empty() {
                let sorted: BTreeMap<&String, &serde_json::Value> = details.iter().collect();
                println!(
                    "        details: {}",
                    serde_json::to_string(&sorted).unwrap_or_default()
                );
            }
        }
    }
}

// ── Dedupe Cache ──────────────────────────────────────────────────────────────

fn parse_rfc3339_utc(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Seen alert IDs persisted as one `alert_id|seen_ts` line per entry.
/// Pruned on load and rewritten on every state change; the file stays small
/// because the TTL bounds it.
pub struct DedupeCache {
    path: PathBuf,
    ttl: Duration,
    entries: HashMap<String, DateTime<Utc>>,
}

impl DedupeCache {
    pub fn load(path: &Path, ttl_minutes: i64) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut seen = HashMap::new();
        if path.exists() {
            let now = Utc::now();
            for line in std::fs::read_to_string(path)?.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match line.split_once('|') {
                    Some((id, ts)) => {
                        // A mangled timestamp counts as freshly seen rather
                        // than silently un-deduping the alert.
                        let seen_at = parse_rfc3339_utc(ts).unwrap_or(now);
                        seen.insert(id.to_string(), seen_at);
                    }
                    None => {
                        seen.insert(line.to_string(), now);
                    }
                }
            }
        }

        let mut cache = Self {
            path: path.to_path_buf(),
            ttl: Duration::minutes(ttl_minutes.max(0)),
            entries: seen,
        };
        cache.prune();
        cache.rewrite()?;
        Ok(cache)
    }

    fn prune(&mut self) {
        if self.ttl <= Duration::zero() {
            self.entries.clear();
            return;
        }
        let cutoff = Utc::now() - self.ttl;
        self.entries.retain(|_, seen_at| *seen_at >= cutoff);
    }

    fn rewrite(&self) -> std::io::Result<()> {
        let mut buf = String::new();
        for (id, seen_at) in &self.entries {
            buf.push_str(id);
            buf.push('|');
            buf.push_str(&seen_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true));
            buf.push('\n');
        }
        std::fs::write(&self.path, buf)
    }

    pub fn seen(&mut self, alert_id: &str) -> bool {
        if self.ttl <= Duration::zero() {
            return false;
        }
        self.prune();
        self.entries.contains_key(alert_id)
    }

    pub fn mark_seen_now(&mut self, alert_id: &str) -> std::io::Result<()> {
        if self.ttl <= Duration::zero() {
            return Ok(());
        }
        self.entries.insert(alert_id.to_string(), Utc::now());
        self.rewrite()
    }
}

// ── Router ────────────────────────────────────────────────────────────────────

const SUPPRESSION_MILESTONES: [u64; 4] = [10, 25, 50, 100];

/// Routes alerts through the dedupe cache to the notifier.
///
/// A suppressed alert bumps a per-id counter; when the id finally emits again
/// after TTL expiry the notification carries the accumulated repeat count.
pub struct AlertRouter {
    notifier: Box<dyn Notifier>,
    dedupe: DedupeCache,
    suppressed: HashMap<String, u64>,
}

impl AlertRouter {
    pub fn new(notifier: Box<dyn Notifier>, dedupe: DedupeCache) -> Self {
        Self {
            notifier,
            dedupe,
            suppressed: HashMap::new(),
        }
    }

    /// Returns true when the alert was notified (not suppressed).
    pub fn route(&mut self, alert: &Alert) -> std::io::Result<bool> {
        if self.dedupe.seen(&alert.alert_id) {
            let n = self
                .suppressed
                .entry(alert.alert_id.clone())
                .and_modify(|n| *n += 1)
                .or_insert(1);
            if SUPPRESSION_MILESTONES.contains(n) {
                info!("dedupe: alert_id={} suppressed={n}", alert.alert_id);
            }
            return Ok(false);
        }

        let repeats = self.suppressed.remove(&alert.alert_id).unwrap_or(0);
        self.notifier.notify(alert, repeats);

        // Seen-at is *now*, after notification — TTL tracks routing time.
        if let Err(e) = self.dedupe.mark_seen_now(&alert.alert_id) {
            warn!("dedupe cache write failed: {e}");
            return Err(e);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct RecordingNotifier {
        calls: Arc<Mutex<Vec<(String, u64)>>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, alert: &Alert, suppressed_repeats: u64) {
            self.calls
                .lock()
                .unwrap()
                .push((alert.alert_id.clone(), suppressed_repeats));
        }
    }

    fn alert(id: &str) -> Alert {
        Alert {
            alert_id: id.to_string(),
            ts: "2026-01-12T10:00:59Z".to_string(),
            rule_id: "AUTH001".to_string(),
            title: "SSH brute force suspected".to_string(),
            severity: 7,
            entity: "src_ip:203.0.113.10".to_string(),
            event_ids: vec!["e1".into()],
            details: serde_json::json!({"bucket": "2026-01-12T10:00"}),
        }
    }

    #[test]
    fn alert_id_is_deterministic_and_bucket_sensitive() {
        let a = stable_alert_id("AUTH001", "src_ip:1.2.3.4", "2026-01-12T10:00");
        let b = stable_alert_id("AUTH001", "src_ip:1.2.3.4", "2026-01-12T10:00");
        let c = stable_alert_id("AUTH001", "src_ip:1.2.3.4", "2026-01-12T10:01");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("a_"));
        assert_eq!(a.len(), 26);
        assert!(a[2..].chars().all(|ch| ch.is_ascii_hexdigit() && !ch.is_ascii_uppercase()));
    }

    #[test]
    fn cache_remembers_ids_within_ttl_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dedupe.txt");

        let mut cache = DedupeCache::load(&path, 60).unwrap();
        assert!(!cache.seen("a_x"));
        cache.mark_seen_now("a_x").unwrap();
        assert!(cache.seen("a_x"));

        // A fresh process loads the same file and still suppresses.
        let mut reloaded = DedupeCache::load(&path, 60).unwrap();
        assert!(reloaded.seen("a_x"));
        assert!(!reloaded.seen("a_y"));
    }

    #[test]
    fn expired_entries_are_pruned_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dedupe.txt");
        let old = (Utc::now() - Duration::minutes(120))
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let fresh = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        std::fs::write(&path, format!("a_old|{old}\na_new|{fresh}\n")).unwrap();

        let mut cache = DedupeCache::load(&path, 60).unwrap();
        assert!(!cache.seen("a_old"));
        assert!(cache.seen("a_new"));

        // The prune is persisted too.
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(!text.contains("a_old"));
        assert!(text.contains("a_new"));
    }

    #[test]
    fn zero_ttl_disables_dedupe() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = DedupeCache::load(&dir.path().join("dedupe.txt"), 0).unwrap();
        cache.mark_seen_now("a_x").unwrap();
        assert!(!cache.seen("a_x"));
    }

    #[test]
    fn router_notifies_once_within_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DedupeCache::load(&dir.path().join("dedupe.txt"), 60).unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut router = AlertRouter::new(
            Box::new(RecordingNotifier { calls: calls.clone() }),
            cache,
        );

        assert!(router.route(&alert("a_x")).unwrap());
        assert!(!router.route(&alert("a_x")).unwrap());
        assert!(!router.route(&alert("a_x")).unwrap());

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], ("a_x".to_string(), 0));
    }

    #[test]
    fn suppressed_count_is_reported_after_ttl_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dedupe.txt");
        let cache = DedupeCache::load(&path, 60).unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut router = AlertRouter::new(
            Box::new(RecordingNotifier { calls: calls.clone() }),
            cache,
        );

        router.route(&alert("a_x")).unwrap();
        router.route(&alert("a_x")).unwrap();
        router.route(&alert("a_x")).unwrap();

        // Age the seen-at entry past the TTL, as if an hour had passed:
        // rewrite the cache file with an old seen-at and reload it.
        let old = (Utc::now() - Duration::minutes(120))
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        std::fs::write(&path, format!("a_x|{old}\n")).unwrap();
        router.dedupe = DedupeCache::load(&path, 60).unwrap();

        assert!(router.route(&alert("a_x")).unwrap());

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1], ("a_x".to_string(), 2));
    }

    #[test]
    fn distinct_alert_ids_do_not_interfere() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DedupeCache::load(&dir.path().join("dedupe.txt"), 60).unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut router = AlertRouter::new(
            Box::new(RecordingNotifier { calls: calls.clone() }),
            cache,
        );

        assert!(router.route(&alert("a_x")).unwrap());
        assert!(router.route(&alert("a_y")).unwrap());
        assert!(!router.route(&alert("a_x")).unwrap());
        assert_eq!(calls.lock().unwrap().len(), 2);
    }
}
