//! # main
//!
//! MiniSOC server entry point. `serve` runs the HTTP ingest pipeline;
//! `query` and `alerts` read recent rows straight from storage for a quick
//! terminal readout.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::Mutex;
use tracing::info;

use minisoc_server::alerting::{AlertRouter, ConsoleNotifier, DedupeCache};
use minisoc_server::api::{build_router, AppState, DetectionPipeline};
use minisoc_server::detect::DetectionEngine;
use minisoc_server::storage::SqliteStorage;
use minisoc_types::{load_config, AppConfig};

const DEDUPE_TTL_MINUTES: i64 = 60;

#[derive(Parser, Debug)]
#[command(
    name = "minisoc-server",
    about = "MiniSOC central server: ingest, detection rules, alert routing, SQLite storage"
)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "configs/server.yaml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP ingest server
    Serve,
    /// Print the most recent events
    Query {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: i64,
    },
    /// Print the most recent alerts
    Alerts {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: i64,
    },
}

fn init_tracing(cfg: &AppConfig) {
    let default = format!("minisoc_server={}", cfg.logging.level);
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
        Command::Serve => serve(&cfg).await,
        Command::Query { limit } => query_events(&cfg, limit).await,
        Command::Alerts { limit } => query_alerts(&cfg, limit).await,
    }
}

async fn serve(cfg: &AppConfig) -> Result<()> {
    info!(
        "minisoc server v{} starting — db: {}",
        env!("CARGO_PKG_VERSION"),
        cfg.server.db_path.display()
    );

    let storage = SqliteStorage::connect(&cfg.server.db_path).await?;
    storage.init().await?;

    std::fs::create_dir_all(&cfg.server.jsonl_dir).with_context(|| {
        format!("create jsonl dir {}", cfg.server.jsonl_dir.display())
    })?;
    let jsonl_path = cfg.server.jsonl_dir.join("events.jsonl");

    let dedupe = DedupeCache::load(
        &cfg.server.jsonl_dir.join("alerts_dedupe.txt"),
        DEDUPE_TTL_MINUTES,
    )?;
    let state = Arc::new(AppState {
        storage,
        pipeline: Mutex::new(DetectionPipeline {
            engine: DetectionEngine::new(),
            router: AlertRouter::new(Box::new(ConsoleNotifier), dedupe),
        }),
        jsonl_path,
    });

    let addr = format!("{}:{}", cfg.server.bind_host, cfg.server.bind_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("listening on {addr}");

    axum::serve(listener, build_router(state))
        .await
        .context("server error")?;
    Ok(())
}

async fn query_events(cfg: &AppConfig, limit: i64) -> Result<()> {
    let storage = SqliteStorage::connect(&cfg.server.db_path).await?;
    storage.init().await?;

    for ev in storage.recent_events(limit).await? {
        println!(
            "{} {} {}.{} {} sev={} :: {}",
            ev["ts"].as_str().unwrap_or("-"),
            ev["host"]["name"].as_str().unwrap_or("-"),
            ev["event"]["type"].as_str().unwrap_or("-"),
            ev["event"]["action"].as_str().unwrap_or("-"),
            ev["event"]["outcome"].as_str().unwrap_or("-"),
            ev["event"]["severity"],
            ev["message"].as_str().unwrap_or("")
        );
    }
    Ok(())
}

async fn query_alerts(cfg: &AppConfig, limit: i64) -> Result<()> {
    let storage = SqliteStorage::connect(&cfg.server.db_path).await?;
    storage.init().await?;

    for a in storage.recent_alerts(limit).await? {
        println!(
            "{} {} sev={} {} :: {} (events={})",
            a.ts,
            a.rule_id,
            a.severity,
            a.entity,
            a.title,
            a.event_ids.len()
        );
    }
    Ok(())
}
