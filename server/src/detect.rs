//! # detect
//!
//! Stateful detection rules over the ingested event stream.
//!
//! A rule is anything that can look at one event and maybe produce a
//! [`Detection`]; the engine holds an ordered list of them and runs every
//! rule against every event. Rule state lives on the rule instance — a
//! restart loses sliding history, and re-instantiating the engine in a test
//! starts from a clean slate. Detections carry a minute-precision `bucket`
//! in their details; the alert router folds repeats within a bucket into one
//! alert.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Timelike, Utc};
use minisoc_types::{Alert, NormalizedEvent, Outcome};
use serde_json::json;

use crate::alerting::stable_alert_id;

/// Rule output before alert materialization.
#[derive(Debug, Clone)]
pub struct Detection {
    pub rule_id: &'static str,
    pub title: &'static str,
    pub severity: u8,
    pub entity: String,
    pub event_ids: Vec<String>,
    pub details: serde_json::Value,
}

pub trait Rule: Send {
    fn on_event(&mut self, ev: &NormalizedEvent) -> Option<Detection>;
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Minute-precision timestamp prefix: `"YYYY-MM-DDTHH:MM"`.
pub fn bucket_minute(ts: &str) -> &str {
    ts.get(..16).unwrap_or(ts)
}

pub fn parse_ts(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Great-circle distance in kilometers (haversine, Earth radius 6371 km).
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;
    let p1 = lat1.to_radians();
    let p2 = lat2.to_radians();
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();
    let a = (dphi / 2.0).sin().powi(2) + p1.cos() * p2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}

fn is_ssh_login(ev: &NormalizedEvent) -> bool {
    ev.event.kind == "auth" && ev.event.action == "ssh_login"
}

fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

// ── AUTH001: Brute force ──────────────────────────────────────────────────────

/// Repeated failures from one source IP. History is bounded by count, not
/// time — the router's bucket dedupe absorbs the re-fires.
pub struct BruteForceRule {
    threshold: usize,
    fails: HashMap<String, Vec<(String, String)>>,
}

const BRUTE_FORCE_HISTORY: usize = 200;

impl BruteForceRule {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            fails: HashMap::new(),
        }
    }
}

impl Rule for BruteForceRule {
    fn on_event(&mut self, ev: &NormalizedEvent) -> Option<Detection> {
        if !is_ssh_login(ev) || ev.event.outcome != Outcome::Failure {
            return None;
        }
        let src_ip = ev.src_ip()?.to_string();

        let history = self.fails.entry(src_ip.clone()).or_default();
        history.push((ev.ts.clone(), ev.event_id.to_string()));
        if history.len() > BRUTE_FORCE_HISTORY {
            let drop = history.len() - BRUTE_FORCE_HISTORY;
            history.drain(..drop);
        }

        if history.len() < self.threshold {
            return None;
        }
        let event_ids = history[history.len() - self.threshold..]
            .iter()
            .map(|(_, eid)| eid.clone())
            .collect();
        Some(Detection {
            rule_id: "AUTH001",
            title: "SSH brute force suspected",
            severity: 7,
            entity: format!("src_ip:{src_ip}"),
            event_ids,
            details: json!({
                "threshold": self.threshold,
                "bucket": bucket_minute(&ev.ts),
            }),
        })
    }
}

// ── AUTH002: Password spray ───────────────────────────────────────────────────

/// Many users, few attempts each, from one IP within one minute bucket.
pub struct PasswordSprayRule {
    distinct_users: usize,
    max_per_user: usize,
    // src_ip -> bucket -> user -> [event_id]
    state: HashMap<String, HashMap<String, BTreeMap<String, Vec<String>>>>,
}

impl PasswordSprayRule {
    pub fn new(distinct_users: usize, max_per_user: usize) -> Self {
        Self {
            distinct_users,
            max_per_user,
            state: HashMap::new(),
        }
    }
}

impl Rule for PasswordSprayRule {
    fn on_event(&mut self, ev: &NormalizedEvent) -> Option<Detection> {
        if !is_ssh_login(ev) || ev.event.outcome != Outcome::Failure {
            return None;
        }
        let src_ip = ev.src_ip()?.to_string();
        let user = ev.user_name()?.to_string();
        let bucket = bucket_minute(&ev.ts).to_string();

        let users = self
            .state
            .entry(src_ip.clone())
            .or_default()
            .entry(bucket.clone())
            .or_default();
        users.entry(user).or_default().push(ev.event_id.to_string());

        let distinct = users.len();
        let spray_like =
            distinct >= self.distinct_users && users.values().all(|ids| ids.len() <= self.max_per_user);
        if !spray_like {
            return None;
        }
        // One event per targeted user keeps the alert compact.
        let event_ids = users
            .values()
            .filter_map(|ids| ids.last().cloned())
            .collect();
        Some(Detection {
            rule_id: "AUTH002",
            title: "Password spraying suspected",
            severity: 8,
            entity: format!("src_ip:{src_ip}"),
            event_ids,
            details: json!({
                "bucket": bucket,
                "distinct_users": distinct,
                "max_per_user": self.max_per_user,
            }),
        })
    }
}

// ── AUTH003: New IP for user ──────────────────────────────────────────────────

/// First success from an unseen IP for a known user. The user's very first
/// IP seeds the set silently.
pub struct NewIpForUserRule {
    known: HashMap<String, HashSet<String>>,
}

impl NewIpForUserRule {
    pub fn new() -> Self {
        Self {
            known: HashMap::new(),
        }
    }
}

impl Rule for NewIpForUserRule {
    fn on_event(&mut self, ev: &NormalizedEvent) -> Option<Detection> {
        if !is_ssh_login(ev) || ev.event.outcome != Outcome::Success {
            return None;
        }
        let user = ev.user_name()?.to_string();
        let ip = ev.src_ip()?.to_string();

        let known = self.known.entry(user.clone()).or_default();
        if !known.is_empty() && !known.contains(&ip) {
            known.insert(ip.clone());
            return Some(Detection {
                rule_id: "AUTH003",
                title: "New source IP for user login",
                severity: 5,
                entity: format!("user:{user}"),
                event_ids: vec![ev.event_id.to_string()],
                details: json!({
                    "bucket": bucket_minute(&ev.ts),
                    "new_ip": ip,
                    "known_ip_count": known.len() - 1,
                }),
            });
        }
        known.insert(ip);
        None
    }
}

// ── AUTH004: Off-hours login ──────────────────────────────────────────────────

/// Successful login outside business hours, judged in UTC.
pub struct OffHoursLoginRule {
    start_hour: u32,
    end_hour: u32,
}

impl OffHoursLoginRule {
    pub fn new(start_hour: u32, end_hour: u32) -> Self {
        Self {
            start_hour,
            end_hour,
        }
    }
}

impl Rule for OffHoursLoginRule {
    fn on_event(&mut self, ev: &NormalizedEvent) -> Option<Detection> {
        if !is_ssh_login(ev) || ev.event.outcome != Outcome::Success {
            return None;
        }
        let user = ev.user_name()?;
        let hour = parse_ts(&ev.ts)?.hour();
        if hour >= self.start_hour && hour < self.end_hour {
            return None;
        }
        Some(Detection {
            rule_id: "AUTH004",
            title: "Off-hours successful login",
            severity: 6,
            entity: format!("user:{user}"),
            event_ids: vec![ev.event_id.to_string()],
            details: json!({
                "bucket": bucket_minute(&ev.ts),
                "hour_utc": hour,
                "start_hour": self.start_hour,
                "end_hour": self.end_hour,
            }),
        })
    }
}

// ── AUTH005: Impossible travel ────────────────────────────────────────────────

/// Geo jump faster than anything that flies. Only successes carrying
/// `src.geo.{lat,lon}` participate; state is the previous such login per user.
pub struct ImpossibleTravelRule {
    max_kmh: f64,
    last: HashMap<String, (DateTime<Utc>, f64, f64, String)>,
}

impl ImpossibleTravelRule {
    pub fn new(max_kmh: f64) -> Self {
        Self {
            max_kmh,
            last: HashMap::new(),
        }
    }
}

impl Rule for ImpossibleTravelRule {
    fn on_event(&mut self, ev: &NormalizedEvent) -> Option<Detection> {
        if !is_ssh_login(ev) || ev.event.outcome != Outcome::Success {
            return None;
        }
        let user = ev.user_name()?.to_string();
        let geo = ev.src.as_ref()?.geo.as_ref()?;
        let lat = geo.get("lat")?.as_f64()?;
        let lon = geo.get("lon")?.as_f64()?;
        let ts = parse_ts(&ev.ts)?;

        let prev = self
            .last
            .insert(user.clone(), (ts, lat, lon, ev.event_id.to_string()));
        let (prev_ts, prev_lat, prev_lon, prev_eid) = prev?;

        let hours = ((ts - prev_ts).num_milliseconds() as f64 / 3_600_000.0).max(1e-6);
        let km = haversine_km(prev_lat, prev_lon, lat, lon);
        let speed_kmh = km / hours;
        if speed_kmh <= self.max_kmh {
            return None;
        }
        Some(Detection {
            rule_id: "AUTH005",
            title: "Impossible travel suspected (geo jump too fast)",
            severity: 9,
            entity: format!("user:{user}"),
            event_ids: vec![prev_eid, ev.event_id.to_string()],
            details: json!({
                "bucket": bucket_minute(&ev.ts),
                "km": round1(km),
                "hours": round3(hours),
                "speed_kmh": round1(speed_kmh),
                "max_kmh": self.max_kmh,
            }),
        })
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

pub struct DetectionEngine {
    rules: Vec<Box<dyn Rule>>,
}

impl DetectionEngine {
    /// Default rule set with the stock thresholds, in rule-id order. Order is
    /// the tie-breaker for detections fired by the same event.
    pub fn new() -> Self {
        Self {
            rules: vec![
                Box::new(BruteForceRule::new(5)),
                Box::new(PasswordSprayRule::new(4, 2)),
                Box::new(NewIpForUserRule::new()),
                Box::new(OffHoursLoginRule::new(8, 18)),
                Box::new(ImpossibleTravelRule::new(900.0)),
            ],
        }
    }

    pub fn process(&mut self, ev: &NormalizedEvent) -> Vec<Detection> {
        self.rules
            .iter_mut()
            .filter_map(|rule| rule.on_event(ev))
            .collect()
    }

    /// Materialize a detection into its durable alert. The alert id hashes
    /// `(rule, entity, bucket)` so the same detection in the same minute
    /// always lands on the same row.
    pub fn to_alert(&self, det: &Detection, ts: &str) -> Alert {
        let bucket = det
            .details
            .get("bucket")
            .and_then(|b| b.as_str())
            .unwrap_or_else(|| bucket_minute(ts))
            .to_string();
        Alert {
            alert_id: stable_alert_id(det.rule_id, &det.entity, &bucket),
            ts: ts.to_string(),
            rule_id: det.rule_id.to_string(),
            title: det.title.to_string(),
            severity: det.severity,
            entity: det.entity.clone(),
            event_ids: det.event_ids.clone(),
            details: det.details.clone(),
        }
    }
}

impl Default for DetectionEngine {
    fn default() -> Self {
        Self::new()
    }
}
