//! Pipeline orchestrator: per-market ingest → score → compute → snapshot.
//!
//! Ingest and scoring failures are recorded in the tick report but never
//! block the compute stage; the engine runs whenever outcomes exist. Across
//! markets, ticks are sequential with a fixed delay, plus a longer cooldown
//! when the post source rate-limits.

use super::{ingest, rules, scoring, store_err, RuleSyncSummary};
use crate::engine::{self, EngineInput, EngineOutcome, EnginePost};
use crate::errors::PipelineError;
use crate::models::{Config, MarketState, MarketStatus, OutcomeScores, ProbabilitySnapshot};
use crate::oracle::ScoringOracle;
use crate::sources::PostSource;
use crate::storage::{now_ms, ScoreStore};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStatus {
    Success,
    Partial,
    Error,
}

/// Outcome of one `refresh` tick, the user-visible failure shape.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub status: RefreshStatus,
    pub market_id: String,
    pub tweets_fetched: u32,
    pub tweets_ingested: u32,
    pub posts_scored: u32,
    pub probabilities: Option<BTreeMap<String, f64>>,
    pub duration_ms: u64,
    pub errors: Vec<String>,
    /// Whether the post source rate-limited during this tick; drives the
    /// bulk-tick cooldown and is not part of the wire shape.
    #[serde(skip)]
    pub rate_limited: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshAllReport {
    pub markets_processed: u32,
    pub reports: Vec<RefreshReport>,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

pub struct Orchestrator {
    store: ScoreStore,
    source: Arc<dyn PostSource>,
    oracle: Arc<dyn ScoringOracle>,
    config: Config,
}

impl Orchestrator {
    pub fn new(
        store: ScoreStore,
        source: Arc<dyn PostSource>,
        oracle: Arc<dyn ScoringOracle>,
        config: Config,
    ) -> Self {
        Self {
            store,
            source,
            oracle,
            config,
        }
    }

    pub fn store(&self) -> &ScoreStore {
        &self.store
    }

    /// Run one full tick for a market.
    pub async fn refresh(&self, market_id: &str) -> Result<RefreshReport, PipelineError> {
        let start = Instant::now();

        let market = self
            .store
            .get_market(market_id)
            .map_err(store_err)?
            .ok_or_else(|| PipelineError::NotFound(market_id.to_string()))?;
        if market.status != MarketStatus::Active {
            return Err(PipelineError::Inactive(market_id.to_string()));
        }

        let now = now_ms();
        if let Some(state) = self.store.get_market_state(market_id).map_err(store_err)? {
            let elapsed = now - state.updated_at_ms;
            if state.accepted_post_count > 0 && elapsed < self.config.min_refresh_interval_ms {
                return Err(PipelineError::RateLimited(format!(
                    "market {market_id} refreshed {elapsed}ms ago"
                )));
            }
        }

        let mut errors: Vec<String> = Vec::new();
        let mut rate_limited = false;

        let ingest_summary =
            match ingest::ingest_for_market(&self.store, self.source.as_ref(), &market, self.config.ingest_batch)
                .await
            {
                Ok(summary) => summary,
                Err(e) => {
                    rate_limited = e.is_rate_limited();
                    warn!(market_id, "ingest stage failed: {e}");
                    errors.push(format!("ingest: {e}"));
                    Default::default()
                }
            };

        let posts_scored = match scoring::score_unscored(
            &self.store,
            self.oracle.as_ref(),
            &market,
            self.config.score_batch,
        )
        .await
        {
            Ok(n) => n,
            Err(e) => {
                warn!(market_id, "scoring stage failed: {e}");
                errors.push(format!("score: {e}"));
                0
            }
        };

        // Compute always runs; ingest/score failures only degrade freshness.
        let output = self.compute_and_persist(&market.market_id).map_err(|e| {
            warn!(market_id, "compute stage failed: {e}");
            e
        })?;

        let total = self.store.count_raw_posts(market_id).map_err(store_err)?;
        self.store
            .set_total_posts_processed(market_id, total)
            .map_err(store_err)?;

        let status = if errors.is_empty() {
            RefreshStatus::Success
        } else {
            RefreshStatus::Partial
        };
        let report = RefreshReport {
            status,
            market_id: market_id.to_string(),
            tweets_fetched: ingest_summary.fetched,
            tweets_ingested: ingest_summary.ingested,
            posts_scored,
            probabilities: output,
            duration_ms: start.elapsed().as_millis() as u64,
            errors,
            rate_limited,
        };
        info!(
            market_id,
            status = ?report.status,
            fetched = report.tweets_fetched,
            ingested = report.tweets_ingested,
            scored = report.posts_scored,
            duration_ms = report.duration_ms,
            "refresh tick done"
        );
        Ok(report)
    }

    /// Build the engine input from the store, run the engine, and persist
    /// state, snapshot, and per-outcome probabilities.
    fn compute_and_persist(
        &self,
        market_id: &str,
    ) -> Result<Option<BTreeMap<String, f64>>, PipelineError> {
        let outcomes = self.store.outcomes_for_market(market_id).map_err(store_err)?;
        if outcomes.is_empty() {
            return Err(PipelineError::InvalidInput(format!(
                "market {market_id} has no outcomes"
            )));
        }

        let now = now_ms();
        let prev = self
            .store
            .get_market_state(market_id)
            .map_err(store_err)?
            .map(|s| s.probabilities);

        let raw_posts = self.store.recent_raw_posts(market_id, now).map_err(store_err)?;
        let ids: Vec<i64> = raw_posts.iter().map(|p| p.id).collect();
        let scored = self.store.scored_for_posts(market_id, &ids).map_err(store_err)?;

        let mut per_post: HashMap<i64, HashMap<String, OutcomeScores>> = HashMap::new();
        for row in scored {
            per_post
                .entry(row.raw_post_id)
                .or_default()
                .insert(row.outcome_key, row.scores);
        }

        let posts: Vec<EnginePost> = raw_posts
            .iter()
            .filter_map(|raw| {
                let per_outcome = per_post.remove(&raw.id)?;
                Some(EnginePost {
                    author_id: raw.author_id.clone(),
                    post_created_at_ms: raw.post_created_at_ms,
                    author_followers: raw.author_followers,
                    author_verified: raw.author_verified,
                    metrics: raw.metrics,
                    features: raw.features,
                    per_outcome,
                })
            })
            .collect();

        let output = engine::compute(&EngineInput {
            market_id: market_id.to_string(),
            now_ms: now,
            outcomes: outcomes
                .iter()
                .map(|o| EngineOutcome {
                    outcome_key: o.outcome_key.clone(),
                    prior_probability: o.prior_probability,
                })
                .collect(),
            prev_probabilities: prev,
            posts,
        });

        let updated_at = now_ms();
        self.store
            .upsert_market_state(&MarketState {
                market_id: market_id.to_string(),
                probabilities: output.probabilities.clone(),
                updated_at_ms: updated_at,
                accepted_post_count: output.diagnostics.accepted_posts as i64,
            })
            .map_err(store_err)?;
        self.store
            .append_snapshot(&ProbabilitySnapshot {
                market_id: market_id.to_string(),
                snapshot_at_ms: updated_at,
                probabilities: output.probabilities.clone(),
            })
            .map_err(store_err)?;
        self.store
            .write_current_probabilities(market_id, &output.probabilities)
            .map_err(store_err)?;

        Ok(Some(output.probabilities))
    }

    /// Bulk tick: refresh every active market sequentially.
    pub async fn refresh_all(&self) -> RefreshAllReport {
        let start = Instant::now();
        let mut reports: Vec<RefreshReport> = Vec::new();
        let mut errors: Vec<String> = Vec::new();

        let markets = match self.store.list_active_markets() {
            Ok(m) => m,
            Err(e) => {
                return RefreshAllReport {
                    markets_processed: 0,
                    reports,
                    errors: vec![format!("list markets: {e:#}")],
                    duration_ms: start.elapsed().as_millis() as u64,
                }
            }
        };

        for (i, market) in markets.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.inter_market_delay_ms)).await;
            }
            match self.refresh(&market.market_id).await {
                Ok(report) => {
                    if report.rate_limited {
                        warn!(
                            market_id = %market.market_id,
                            cooldown_ms = self.config.rate_limit_cooldown_ms,
                            "post source rate limited, cooling down"
                        );
                        tokio::time::sleep(Duration::from_millis(self.config.rate_limit_cooldown_ms))
                            .await;
                    }
                    reports.push(report);
                }
                Err(e) if e.is_rate_limited() => {
                    // Local guard fired; the market is fresh enough.
                    continue;
                }
                Err(e) => errors.push(format!("{}: {e}", market.market_id)),
            }
        }

        RefreshAllReport {
            markets_processed: reports.len() as u32,
            reports,
            errors,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    pub async fn sync_rules(&self) -> Result<RuleSyncSummary, PipelineError> {
        rules::sync_rules(&self.store, self.source.as_ref()).await
    }
}
