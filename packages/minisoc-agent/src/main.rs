//! # main
//!
//! MiniSOC edge agent entry point. Three subcommands:
//!   - `tail-auth`: follow the host auth log (file or journal), normalize SSH
//!     login events and forward them to the server
//!   - `replay`: push a recorded JSONL scenario through `/ingest`
//!   - `doctor`: sanity checks for live deployment

mod parser;
mod replay;
mod sources;
mod suspicious;
mod tail;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use minisoc_types::{load_config, AppConfig};
use sources::{
    is_readable_file, journalctl_available, pick_auth_source, ReadMode, SourceKind,
    SourcePreference, DEFAULT_AUTH_PATH_CANDIDATES,
};

#[derive(Parser, Debug)]
#[command(
    name = "minisoc-agent",
    about = "MiniSOC edge agent: tail auth logs, normalize SSH events, forward to the server"
)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "configs/agent.yaml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Tail the host auth log and forward normalized SSH events
    TailAuth {
        /// Auth log file path, or "auto" to probe the usual locations
        #[arg(long, default_value = "auto")]
        log_path: String,
        /// Host name stamped on events (defaults to config agent.host_name)
        #[arg(long)]
        host: Option<String>,
        /// Host IP stamped on events
        #[arg(long)]
        host_ip: Option<String>,
        #[arg(long, value_enum, default_value = "auto")]
        source: SourcePreference,
        #[arg(long, value_enum, default_value = "live")]
        mode: ReadMode,
        /// Live mode: start reading at the beginning instead of seeking to EOF
        #[arg(long)]
        from_start: bool,
        /// Seconds between heartbeat logs (0 disables)
        #[arg(long, default_value_t = 30.0)]
        heartbeat_s: f64,
        /// Print events instead of sending them
        #[arg(long)]
        dry_run: bool,
    },
    /// Replay a recorded JSONL scenario against the server
    Replay {
        /// Path to a JSONL scenario file (one event JSON per line)
        #[arg(
            short,
            long,
            default_value = "data/replay_scenarios/01_ssh_bruteforce.jsonl"
        )]
        scenario: PathBuf,
        /// Delay between events (seconds)
        #[arg(long, default_value_t = 0.02)]
        delay_s: f64,
    },
    /// Quick sanity checks for live deployment
    Doctor,
}

fn init_tracing(cfg: &AppConfig) {
    let default = format!("minisoc_agent={}", cfg.logging.level);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;
    init_tracing(&cfg);

    match cli.command {
        Command::TailAuth {
            log_path,
            host,
            host_ip,
            source,
            mode,
            from_start,
            heartbeat_s,
            dry_run,
        } => {
            let requested = match log_path.trim().to_ascii_lowercase().as_str() {
                "auto" => None,
                _ => Some(PathBuf::from(log_path)),
            };
            let decision = pick_auth_source(requested.as_deref(), source).await;
            info!(
                kind = ?decision.kind,
                path = ?decision.path,
                "source decision: {}",
                decision.reason
            );

            // Strict preferences are fatal when unsatisfiable; auto degrades
            // and lets the open fail loudly if nothing was usable.
            match source {
                SourcePreference::File => {
                    let readable = decision
                        .path
                        .as_deref()
                        .is_some_and(is_readable_file);
                    if !readable {
                        bail!("source=file but no readable auth log ({})", decision.reason);
                    }
                }
                SourcePreference::Journal => {
                    if !journalctl_available().await {
                        bail!("source=journal but journalctl is not usable");
                    }
                }
                SourcePreference::Auto => {
                    if decision.kind == SourceKind::File
                        && !decision.path.as_deref().is_some_and(is_readable_file)
                    {
                        warn!("no readable source found; attempting {:?} anyway", decision.path);
                    }
                }
            }

            let opts = tail::TailOptions {
                server_url: cfg.agent.server_url.clone(),
                host_name: host.unwrap_or_else(|| cfg.agent.host_name.clone()),
                host_ip,
                mode,
                from_start,
                dry_run,
                heartbeat: (heartbeat_s > 0.0).then(|| Duration::from_secs_f64(heartbeat_s)),
                suspicious_path: cfg.logging.dir.join("suspicious.jsonl"),
            };

            let stats = tail::run_tail_auth(opts, decision).await?;
            println!(
                "agent: mode={} read={} parsed={} sent={} failed={}",
                match mode {
                    ReadMode::Live => "live",
                    ReadMode::Replay => "replay",
                },
                stats.read,
                stats.parsed,
                stats.sent,
                stats.failed
            );
        }

        Command::Replay { scenario, delay_s } => {
            let stats = replay::replay_scenario(
                &cfg.agent.server_url,
                &scenario,
                Duration::from_secs_f64(delay_s.max(0.0)),
                Duration::from_secs(5),
            )
            .await?;
            println!("replay: sent={} failed={}", stats.sent, stats.failed);
        }

        Command::Doctor => doctor(&cfg).await?,
    }

    Ok(())
}

async fn doctor(cfg: &AppConfig) -> Result<()> {
    println!("=== minisoc doctor ===");
    println!("server_url: {}", cfg.agent.server_url);

    let health_url = format!("{}/health", cfg.agent.server_url.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()?;
    match client.get(&health_url).send().await {
        Ok(resp) => {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            println!(
                "server /health: {status} {}",
                body.trim().chars().take(200).collect::<String>()
            );
        }
        Err(e) => println!("server /health: FAILED ({e})"),
    }

    let decision = pick_auth_source(None, SourcePreference::Auto).await;
    println!(
        "auth source decision: kind={:?} reason={} path={:?}",
        decision.kind, decision.reason, decision.path
    );

    for candidate in DEFAULT_AUTH_PATH_CANDIDATES {
        let p = Path::new(candidate);
        println!(
            "candidate: {candidate} exists={} readable={}",
            p.exists(),
            is_readable_file(p)
        );
    }

    println!("journalctl available: {}", journalctl_available().await);
    println!("=== end ===");
    Ok(())
}
