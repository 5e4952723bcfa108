//! PulseBot - social-signal probability engine for prediction markets
//! Mission: turn scored posts into calibrated market probabilities
//!
//! The worker pulls candidate posts per market, scores them through the
//! oracle, recomputes probabilities, and records snapshots on a fixed tick.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use pulsebot_backend::models::Config;
use pulsebot_backend::oracle::LlmOracle;
use pulsebot_backend::sources::XApiClient;
use pulsebot_backend::{Orchestrator, ScoreStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pulsebot", about = "Prediction-market probability worker")]
struct Cli {
    /// Run one refresh pass over all active markets, then exit.
    #[arg(long)]
    once: bool,

    /// Refresh a single market by id, then exit.
    #[arg(long)]
    market: Option<String>,

    /// Synchronize filter rules, then exit.
    #[arg(long)]
    sync_rules: bool,
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_orchestrator(config: &Config) -> Result<Orchestrator> {
    let token = config
        .post_source_token
        .as_deref()
        .ok_or_else(|| anyhow!("POST_SOURCE_TOKEN missing (required for live ingest)"))?;
    let endpoint = config
        .oracle_endpoint
        .as_deref()
        .ok_or_else(|| anyhow!("ORACLE_ENDPOINT missing (required for scoring)"))?;
    let api_key = config
        .oracle_api_key
        .as_deref()
        .ok_or_else(|| anyhow!("ORACLE_API_KEY missing (required for scoring)"))?;
    let model = config
        .oracle_model_name
        .as_deref()
        .ok_or_else(|| anyhow!("ORACLE_MODEL_NAME missing (required for scoring)"))?;

    let store = ScoreStore::new(&config.database_path)?;
    let source = XApiClient::new(token).context("post source client")?;
    let oracle = LlmOracle::new(endpoint, api_key, model).context("oracle client")?;

    Ok(Orchestrator::new(
        store,
        Arc::new(source),
        Arc::new(oracle),
        config.clone(),
    ))
}

async fn run(cli: Cli, config: Config) -> Result<()> {
    let orchestrator = Arc::new(build_orchestrator(&config)?);

    if cli.sync_rules {
        let summary = orchestrator.sync_rules().await?;
        info!(
            deleted = summary.deleted,
            added = summary.added,
            failed = summary.failed,
            "rule sync finished"
        );
        return Ok(());
    }

    if let Some(market_id) = cli.market {
        let report = orchestrator.refresh(&market_id).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if cli.once {
        let report = orchestrator.refresh_all().await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    // Long-running worker: a refresh loop plus a slower rule-sync loop.
    info!(
        refresh_tick_ms = config.refresh_tick_ms,
        rule_sync_tick_ms = config.rule_sync_tick_ms,
        "worker starting"
    );

    let rule_sync = {
        let orchestrator = Arc::clone(&orchestrator);
        let tick = Duration::from_millis(config.rule_sync_tick_ms);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                if let Err(e) = orchestrator.sync_rules().await {
                    warn!("rule sync failed: {e}");
                }
            }
        })
    };

    let mut interval = tokio::time::interval(Duration::from_millis(config.refresh_tick_ms));
    loop {
        interval.tick().await;
        let report = orchestrator.refresh_all().await;
        if !report.errors.is_empty() {
            warn!(errors = ?report.errors, "refresh pass had failures");
        }
        info!(
            markets = report.markets_processed,
            duration_ms = report.duration_ms,
            "refresh pass complete"
        );
        if rule_sync.is_finished() {
            return Err(anyhow!("rule sync loop exited unexpectedly"));
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("fatal: configuration error: {e:#}");
            std::process::exit(1);
        }
    };
    init_tracing(&config.log_level);

    if let Err(e) = run(cli, config).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}
