//! # sources
//!
//! Where auth-log lines come from: a syslog file or the system journal.
//!
//! The two followers behave identically from the parser's point of view —
//! they yield one stripped line at a time and block while nothing new has
//! arrived. The file follower survives logrotate by watching the path's
//! inode; the journal follower polls `journalctl` with an opaque cursor
//! instead of holding a `-f` pipe open, because a long-lived pipe stalls
//! under stdout buffering and there is no way to make that robust.

use std::collections::{HashSet, VecDeque};
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::ValueEnum;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::process::Command;
use tracing::warn;

/// Source path reported on events produced by the journal follower.
pub const JOURNAL_SOURCE_PATH: &str = "journald:sshd";

/// Default auth log locations, most specific distro first.
pub const DEFAULT_AUTH_PATH_CANDIDATES: [&str; 3] = [
    "/var/log/auth.log", // Debian/Ubuntu/RPi OS
    "/var/log/secure",   // RHEL/CentOS/Fedora
    "/var/log/messages", // some syslog setups
];

const FILE_SLEEP: Duration = Duration::from_millis(200);
const JOURNAL_POLL: Duration = Duration::from_millis(350);
const JOURNAL_DEDUPE_CAPACITY: usize = 500;

static CURSOR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^-- cursor:\s*(.+?)\s*$").unwrap());
static SYSLOG_TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bsshd?\[\d+\]:").unwrap());

// ── Source Decision ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SourceKind {
    File,
    Journal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SourcePreference {
    Auto,
    File,
    Journal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReadMode {
    /// Follow the source forever.
    Live,
    /// Read existing content once and terminate.
    Replay,
}

/// Outcome of the startup probe: which follower to run and why.
#[derive(Debug, Clone)]
pub struct SourceDecision {
    pub kind: SourceKind,
    pub reason: String,
    pub path: Option<PathBuf>,
}

pub fn is_readable_file(p: &Path) -> bool {
    p.is_file() && std::fs::File::open(p).is_ok()
}

/// Capability probe: does `journalctl` answer a trivial zero-entry query?
pub async fn journalctl_available() -> bool {
    let probe = Command::new("journalctl")
        .args(["-n", "0", "--show-cursor", "--no-pager"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match tokio::time::timeout(Duration::from_secs(2), probe).await {
        Ok(Ok(status)) => status.success(),
        _ => false,
    }
}

/// Decide where to read sshd/auth events from.
///
/// - `prefer=file`: the requested path (or first readable candidate) wins;
///   an unreadable target is still returned as a `file` decision so the
///   caller can report the failure.
/// - `prefer=journal`: journald or nothing.
/// - `prefer=auto`: readable file first, journald fallback, and as a last
///   resort the best-guess file path even though it is unreadable.
pub async fn pick_auth_source(
    requested: Option<&Path>,
    prefer: SourcePreference,
) -> SourceDecision {
    let mut file_target: Option<PathBuf> = requested.map(Path::to_path_buf);
    if file_target.is_none() {
        file_target = DEFAULT_AUTH_PATH_CANDIDATES
            .iter()
            .map(PathBuf::from)
            .find(|c| is_readable_file(c));
    }

    match prefer {
        SourcePreference::File => {
            if let Some(p) = file_target.as_deref().filter(|p| is_readable_file(p)) {
                return SourceDecision {
                    kind: SourceKind::File,
                    reason: "prefer=file and path readable".to_string(),
                    path: Some(p.to_path_buf()),
                };
            }
            SourceDecision {
                kind: SourceKind::File,
                reason: "prefer=file but no readable auth log path found".to_string(),
                path: file_target,
            }
        }
        SourcePreference::Journal => {
            if journalctl_available().await {
                SourceDecision {
                    kind: SourceKind::Journal,
                    reason: "prefer=journal and journalctl available".to_string(),
                    path: None,
                }
            } else {
                SourceDecision {
                    kind: SourceKind::Journal,
                    reason: "prefer=journal but journalctl not available".to_string(),
                    path: None,
                }
            }
        }
        SourcePreference::Auto => {
            if let Some(p) = file_target.as_deref().filter(|p| is_readable_file(p)) {
                return SourceDecision {
                    kind: SourceKind::File,
                    reason: "auto picked readable auth log file".to_string(),
                    path: Some(p.to_path_buf()),
                };
            }
            if journalctl_available().await {
                return SourceDecision {
                    kind: SourceKind::Journal,
                    reason: "auto fell back to journald (no readable auth log file)".to_string(),
                    path: None,
                };
            }
            SourceDecision {
                kind: SourceKind::File,
                reason: "auto failed: no readable auth log file and journalctl unavailable"
                    .to_string(),
                path: file_target.or_else(|| Some(PathBuf::from(DEFAULT_AUTH_PATH_CANDIDATES[0]))),
            }
        }
    }
}

// ── File Follower ─────────────────────────────────────────────────────────────

/// Rotation-safe `tail -f`. Reads lossy UTF-8 so a stray byte in the log
/// never kills the agent.
pub struct FileFollower {
    reader: BufReader<std::fs::File>,
    path: PathBuf,
    inode: u64,
    mode: ReadMode,
    sleep: Duration,
}

impl FileFollower {
    pub fn open(path: &Path, mode: ReadMode, from_start: bool) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("cannot open auth log {}", path.display()))?;
        let inode = file.metadata()?.ino();
        let mut reader = BufReader::new(file);
        if mode == ReadMode::Live && !from_start {
            reader.seek(SeekFrom::End(0))?;
        }
        Ok(Self {
            reader,
            path: path.to_path_buf(),
            inode,
            mode,
            sleep: FILE_SLEEP,
        })
    }

    #[cfg(test)]
    fn with_sleep(mut self, sleep: Duration) -> Self {
        self.sleep = sleep;
        self
    }

    /// Next stripped line; `None` once a replay reaches EOF.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let n = self.reader.read_until(b'\n', &mut buf)?;
            if n == 0 {
                if self.mode == ReadMode::Replay {
                    return Ok(None);
                }
                tokio::time::sleep(self.sleep).await;
                self.check_rotation()?;
                continue;
            }
            // A line without a trailing newline is still being written;
            // back up and let the writer finish it.
            if buf.last() != Some(&b'\n') {
                let len = buf.len() as i64;
                self.reader.seek(SeekFrom::Current(-len))?;
                tokio::time::sleep(self.sleep).await;
                self.check_rotation()?;
                continue;
            }
            let mut line = String::from_utf8_lossy(&buf).into_owned();
            while line.ends_with('\n') || line.ends_with('\r') {
                line.pop();
            }
            return Ok(Some(line));
        }
    }

    /// Logrotate moved the file aside: the path now resolves to a new inode.
    /// Reopen and continue from the end of the new file in live mode.
    fn check_rotation(&mut self) -> Result<()> {
        let current = match std::fs::metadata(&self.path) {
            Ok(m) => m.ino(),
            // Rotation gap: old file renamed, new one not created yet.
            Err(_) => return Ok(()),
        };
        if current == self.inode {
            return Ok(());
        }
        let file = std::fs::File::open(&self.path)
            .with_context(|| format!("reopen after rotation: {}", self.path.display()))?;
        self.inode = file.metadata()?.ino();
        let mut reader = BufReader::new(file);
        if self.mode == ReadMode::Live {
            reader.seek(SeekFrom::End(0))?;
        }
        self.reader = reader;
        Ok(())
    }
}

// ── Journal Follower ──────────────────────────────────────────────────────────

/// Sliding de-duplication window over recently seen journal lines. Polling
/// with `--after-cursor` can hand back overlapping slices; the window keeps
/// the newest 500 lines and drops anything already in it.
struct DedupeWindow {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl DedupeWindow {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// True if the line is new to the window.
    fn insert(&mut self, line: &str) -> bool {
        if self.seen.contains(line) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.seen.insert(line.to_string());
        self.order.push_back(line.to_string());
        true
    }
}

/// Cursor-based `journalctl` poller filtered to the ssh/sshd units.
pub struct JournalFollower {
    cursor: Option<String>,
    pending: VecDeque<String>,
    window: DedupeWindow,
    mode: ReadMode,
    poll: Duration,
    primed: bool,
    drained: bool,
}

impl JournalFollower {
    pub fn new(mode: ReadMode) -> Self {
        Self {
            cursor: None,
            pending: VecDeque::new(),
            window: DedupeWindow::new(JOURNAL_DEDUPE_CAPACITY),
            mode,
            poll: JOURNAL_POLL,
            primed: false,
            drained: false,
        }
    }

    pub async fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Ok(Some(line));
            }
            if self.mode == ReadMode::Replay && self.drained {
                return Ok(None);
            }

            if self.mode == ReadMode::Live && !self.primed {
                self.establish_cursor().await;
                self.primed = true;
            }

            let mut extra: Vec<String> = Vec::new();
            if self.mode == ReadMode::Live {
                if let Some(c) = &self.cursor {
                    extra.push("--after-cursor".to_string());
                    extra.push(c.clone());
                }
            }

            match run_journalctl(&extra).await {
                Ok((lines, cursor)) => {
                    if let Some(c) = cursor {
                        self.cursor = Some(c);
                    }
                    for line in lines {
                        let line = rewrap_journal_line(line);
                        if self.window.insert(&line) {
                            self.pending.push_back(line);
                        }
                    }
                }
                Err(e) => {
                    if self.mode == ReadMode::Replay {
                        return Err(e).context("journalctl replay read failed");
                    }
                    warn!("journalctl poll failed: {e}");
                }
            }

            if self.mode == ReadMode::Replay {
                self.drained = true;
                continue;
            }
            if self.pending.is_empty() {
                tokio::time::sleep(self.poll).await;
            }
        }
    }

    /// Establish the "current" cursor without consuming entries. Falls back
    /// to taking (and discarding) the newest entry when the zero-entry probe
    /// yields no cursor.
    async fn establish_cursor(&mut self) {
        match run_journalctl(&["-n".to_string(), "0".to_string()]).await {
            Ok((_, Some(cursor))) => self.cursor = Some(cursor),
            Ok((_, None)) => {
                match run_journalctl(&["-n".to_string(), "1".to_string()]).await {
                    Ok((_, cursor)) => {
                        if cursor.is_none() {
                            warn!("journalctl cursor probe failed; reading from start of journal");
                        }
                        self.cursor = cursor;
                    }
                    Err(e) => warn!("journalctl cursor probe failed: {e}"),
                }
            }
            Err(e) => warn!("journalctl cursor probe failed: {e}"),
        }
    }
}

async fn run_journalctl(extra: &[String]) -> Result<(Vec<String>, Option<String>)> {
    let output = Command::new("journalctl")
        .args([
            "-o", "short", "-u", "ssh", "-u", "sshd", "--no-pager", "--show-cursor",
        ])
        .args(extra)
        .stderr(Stdio::null())
        .output()
        .await
        .context("failed to run journalctl")?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(split_journal_output(&stdout))
}

/// Separate content lines from the trailing `-- cursor: …` marker.
fn split_journal_output(stdout: &str) -> (Vec<String>, Option<String>) {
    let mut cursor = None;
    let mut lines = Vec::new();
    for raw in stdout.lines() {
        if let Some(caps) = CURSOR_RE.captures(raw) {
            cursor = Some(caps[1].to_string());
        } else if !raw.trim().is_empty() {
            lines.push(raw.trim_end_matches('\n').to_string());
        }
    }
    (lines, cursor)
}

/// Journal records without a syslog process tag ("Failed password for …"
/// straight from the unit) get a synthetic `sshd[0]:` prefix so the parser
/// sees the same shape either way.
fn rewrap_journal_line(line: String) -> String {
    if SYSLOG_TAG_RE.is_match(&line) {
        line
    } else {
        format!("sshd[0]: {line}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn requested_readable_file_wins() {
        let f = tempfile::NamedTempFile::new().unwrap();
        let d = pick_auth_source(Some(f.path()), SourcePreference::File).await;
        assert_eq!(d.kind, SourceKind::File);
        assert_eq!(d.path.as_deref(), Some(f.path()));
        assert_eq!(d.reason, "prefer=file and path readable");
    }

    #[tokio::test]
    async fn prefer_file_keeps_unreadable_target_for_error_reporting() {
        let missing = Path::new("/nonexistent/auth.log");
        let d = pick_auth_source(Some(missing), SourcePreference::File).await;
        assert_eq!(d.kind, SourceKind::File);
        assert_eq!(d.path.as_deref(), Some(missing));
        assert!(d.reason.contains("no readable"));
    }

    #[test]
    fn cursor_marker_is_split_from_content() {
        let out = "Jan 12 10:00:01 pi sshd[42]: Failed password for root from 1.2.3.4 port 22 ssh2\n-- cursor: s=deadbeef;i=1f4\n";
        let (lines, cursor) = split_journal_output(out);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("Failed password"));
        assert_eq!(cursor.as_deref(), Some("s=deadbeef;i=1f4"));
    }

    #[test]
    fn bare_journal_record_gets_synthetic_prefix() {
        let wrapped = rewrap_journal_line("Failed password for root from 1.2.3.4 port 22".into());
        assert!(wrapped.starts_with("sshd[0]: "));

        let tagged =
            rewrap_journal_line("Jan 12 10:00:01 pi sshd[42]: Accepted password for pi".into());
        assert!(!tagged.starts_with("sshd[0]: "));
    }

    #[test]
    fn dedupe_window_drops_repeats_until_eviction() {
        let mut w = DedupeWindow::new(3);
        assert!(w.insert("a"));
        assert!(!w.insert("a"));
        assert!(w.insert("b"));
        assert!(w.insert("c"));
        // "a" is evicted by the fourth distinct line and becomes fresh again.
        assert!(w.insert("d"));
        assert!(w.insert("a"));
    }

    #[tokio::test]
    async fn replay_reads_whole_file_then_ends() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "one").unwrap();
        writeln!(f, "two").unwrap();
        f.flush().unwrap();

        let mut src = FileFollower::open(f.path(), ReadMode::Replay, true).unwrap();
        assert_eq!(src.next_line().await.unwrap().as_deref(), Some("one"));
        assert_eq!(src.next_line().await.unwrap().as_deref(), Some("two"));
        assert_eq!(src.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn live_mode_starts_at_eof_unless_from_start() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "old line").unwrap();
        f.flush().unwrap();

        let mut src = FileFollower::open(f.path(), ReadMode::Live, false)
            .unwrap()
            .with_sleep(Duration::from_millis(10));

        let path = f.path().to_path_buf();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let mut h = std::fs::OpenOptions::new().append(true).open(path).unwrap();
            writeln!(h, "new line").unwrap();
        });

        let line = tokio::time::timeout(Duration::from_secs(5), src.next_line())
            .await
            .expect("tail timed out")
            .unwrap();
        assert_eq!(line.as_deref(), Some("new line"));
    }

    #[tokio::test]
    async fn rotation_is_detected_by_inode_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.log");
        std::fs::write(&path, "before rotation\n").unwrap();

        let mut src = FileFollower::open(&path, ReadMode::Live, false)
            .unwrap()
            .with_sleep(Duration::from_millis(10));

        let rotated = dir.path().join("auth.log.1");
        let write_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            std::fs::rename(&write_path, &rotated).unwrap();
            std::fs::write(&write_path, "").unwrap();
            // Give the follower a few ticks to reopen, then append.
            tokio::time::sleep(Duration::from_millis(200)).await;
            let mut h = std::fs::OpenOptions::new()
                .append(true)
                .open(&write_path)
                .unwrap();
            writeln!(h, "after rotation").unwrap();
        });

        let line = tokio::time::timeout(Duration::from_secs(5), src.next_line())
            .await
            .expect("rotation tail timed out")
            .unwrap();
        assert_eq!(line.as_deref(), Some("after rotation"));
    }
}
