//! # parser
//!
//! sshd syslog line → normalized event. Non-matching lines are dropped
//! without a trace; everything else in the auth log is someone else's
//! problem. Events are stamped with the current wall clock, not the syslog
//! timestamp — agents and server share "time of observation" semantics.

use minisoc_types::{utc_now_rfc3339, NormalizedEvent, Outcome};
use once_cell::sync::Lazy;
use regex::Regex;

pub const PARSER_TAG: &str = "auth.sshd";

static SSH_FAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Failed password for (?P<user>\S+) from (?P<ip>\S+) port (?P<port>\d+)").unwrap()
});
static SSH_OK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Accepted \S+ for (?P<user>\S+) from (?P<ip>\S+) port (?P<port>\d+)").unwrap()
});

/// Parse one auth-log line into a normalized SSH login event.
pub fn parse_sshd_line(
    line: &str,
    host: &str,
    host_ip: Option<&str>,
    source_path: &str,
) -> Option<NormalizedEvent> {
    let (caps, outcome, severity) = if let Some(caps) = SSH_FAIL.captures(line) {
        (caps, Outcome::Failure, 4)
    } else if let Some(caps) = SSH_OK.captures(line) {
        (caps, Outcome::Success, 3)
    } else {
        return None;
    };

    let user = &caps["user"];
    let ip = &caps["ip"];
    let port: u16 = caps["port"].parse().ok()?;

    Some(NormalizedEvent::from_parts(
        utc_now_rfc3339(),
        host,
        host_ip,
        "auth",
        source_path,
        "auth",
        "ssh_login",
        outcome,
        severity,
        format!("SSH login {outcome} for user={user} from {ip}"),
        line,
        PARSER_TAG,
        user,
        ip,
        port,
        vec!["ssh".to_string(), "auth".to_string(), outcome.to_string()],
    ))
}
