//! Core domain types for markets, posts, scores, and runtime configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Market lifecycle status. Only active markets are processed by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketStatus {
    Active,
    Closed,
    Resolved,
}

impl MarketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketStatus::Active => "active",
            MarketStatus::Closed => "closed",
            MarketStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Some(Self::Active),
            "closed" => Some(Self::Closed),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }
}

/// A user question with a fixed set of mutually exclusive outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub market_id: String,
    pub question: String,
    pub normalized_question: String,
    pub status: MarketStatus,
    /// Opaque query strings consumed by the post source, in priority order.
    pub filter_templates: Vec<String>,
    pub total_posts_processed: i64,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// One candidate answer within a market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub outcome_key: String,
    pub label: String,
    pub sort_order: i64,
    pub prior_probability: Option<f64>,
    pub current_probability: Option<f64>,
}

/// Engagement counters captured at ingest time. All nullable upstream.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PostMetrics {
    pub likes: Option<i64>,
    pub reposts: Option<i64>,
    pub replies: Option<i64>,
    pub quotes: Option<i64>,
}

/// Spam-signal features computed from raw post text at ingest, immutable after.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PostFeatures {
    pub cashtag_count: u32,
    pub mention_count: u32,
    pub url_count: u32,
    pub caps_ratio: f64,
    pub is_reply: Option<bool>,
    pub is_quote: Option<bool>,
}

/// A post ingested for a specific market. `(external_post_id, market_id)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPost {
    pub id: i64,
    pub external_post_id: String,
    pub market_id: String,
    pub text: String,
    pub author_id: String,
    pub author_followers: Option<i64>,
    pub author_verified: bool,
    pub author_created_at_ms: Option<i64>,
    pub metrics: PostMetrics,
    pub features: PostFeatures,
    pub post_created_at_ms: i64,
    pub ingested_at_ms: i64,
    pub is_active: bool,
}

/// Per-outcome oracle scores, all in their declared ranges after clamping.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct OutcomeScores {
    pub relevance: f64,
    pub stance: f64,
    pub strength: f64,
    pub credibility: f64,
    pub confidence: f64,
}

impl OutcomeScores {
    /// Clamp every score into its declared range. The oracle is not perfectly
    /// reliable; out-of-range floats are clamped rather than rejected.
    pub fn clamped(&self) -> Self {
        let safe = |v: f64, lo: f64, hi: f64| if v.is_finite() { v.clamp(lo, hi) } else { 0.0 };
        Self {
            relevance: safe(self.relevance, 0.0, 1.0),
            stance: safe(self.stance, -1.0, 1.0),
            strength: safe(self.strength, 0.0, 1.0),
            credibility: safe(self.credibility, 0.0, 1.0),
            confidence: safe(self.confidence, 0.0, 1.0),
        }
    }
}

/// Post-level flags from the oracle, replicated across a post's outcomes.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PostFlags {
    #[serde(default)]
    pub is_sarcasm: bool,
    #[serde(default)]
    pub is_question: bool,
    #[serde(default)]
    pub is_quote: bool,
    #[serde(default)]
    pub is_rumor_style: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CredibilityLabel {
    High,
    Medium,
    Low,
}

impl CredibilityLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredibilityLabel::High => "High",
            CredibilityLabel::Medium => "Medium",
            CredibilityLabel::Low => "Low",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Some(Self::High),
            "medium" | "med" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

/// Human-readable labels produced by the oracle for display surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayLabels {
    pub summary: String,
    pub reason: String,
    pub credibility_label: CredibilityLabel,
    pub stance_label: String,
}

/// The scoring of one raw post against one outcome.
/// `(raw_post_id, market_id, outcome_key)` is unique; re-scoring replaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredPost {
    pub raw_post_id: i64,
    pub market_id: String,
    pub outcome_key: String,
    pub scores: OutcomeScores,
    pub flags: PostFlags,
    pub labels: DisplayLabels,
    pub scored_at_ms: i64,
}

/// Current probabilities per market, 1:1 with `Market`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketState {
    pub market_id: String,
    pub probabilities: BTreeMap<String, f64>,
    pub updated_at_ms: i64,
    pub accepted_post_count: i64,
}

/// Append-only probability history entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbabilitySnapshot {
    pub market_id: String,
    pub snapshot_at_ms: i64,
    pub probabilities: BTreeMap<String, f64>,
}

/// A filter rule registered against the external post source.
/// The tag always equals the market id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterRule {
    pub market_id: String,
    pub external_rule_id: String,
    pub rule_value: String,
    pub rule_tag: String,
    pub created_at_ms: i64,
}

/// Application configuration. Flat record with defaults; transport is env vars.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub post_source_token: Option<String>,
    pub oracle_endpoint: Option<String>,
    pub oracle_api_key: Option<String>,
    pub oracle_model_name: Option<String>,
    pub internal_secret: Option<String>,
    pub log_level: String,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub min_refresh_interval_ms: i64,
    pub inter_market_delay_ms: u64,
    pub rate_limit_cooldown_ms: u64,
    pub ingest_batch: u32,
    pub score_batch: u32,
    pub refresh_tick_ms: u64,
    pub rule_sync_tick_ms: u64,
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./pulsebot.db".to_string());

        let log_level = std::env::var("LOG_LEVEL")
            .ok()
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| matches!(s.as_str(), "debug" | "info" | "warn" | "error"))
            .unwrap_or_else(|| "info".to_string());

        Ok(Self {
            database_path,
            post_source_token: env_opt("POST_SOURCE_TOKEN"),
            oracle_endpoint: env_opt("ORACLE_ENDPOINT"),
            oracle_api_key: env_opt("ORACLE_API_KEY"),
            oracle_model_name: env_opt("ORACLE_MODEL_NAME"),
            internal_secret: env_opt("INTERNAL_SECRET"),
            log_level,
            reconnect_delay_ms: env_parsed("RECONNECT_DELAY_MS", 5000),
            max_reconnect_attempts: env_parsed("MAX_RECONNECT_ATTEMPTS", 10),
            min_refresh_interval_ms: env_parsed("MIN_REFRESH_INTERVAL_MS", 30_000),
            inter_market_delay_ms: env_parsed("INTER_MARKET_DELAY_MS", 2_000),
            rate_limit_cooldown_ms: env_parsed("RATE_LIMIT_COOLDOWN_MS", 30_000),
            ingest_batch: env_parsed("INGEST_BATCH", 15),
            score_batch: env_parsed("SCORE_BATCH", 8),
            refresh_tick_ms: env_parsed("REFRESH_TICK_MS", 60_000),
            rule_sync_tick_ms: env_parsed("RULE_SYNC_TICK_MS", 300_000),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for s in [
            MarketStatus::Active,
            MarketStatus::Closed,
            MarketStatus::Resolved,
        ] {
            assert_eq!(MarketStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(MarketStatus::parse("ACTIVE"), Some(MarketStatus::Active));
        assert_eq!(MarketStatus::parse("open"), None);
    }

    #[test]
    fn scores_clamped_into_declared_ranges() {
        let raw = OutcomeScores {
            relevance: 1.7,
            stance: -3.0,
            strength: -0.2,
            credibility: f64::NAN,
            confidence: 0.4,
        };
        let c = raw.clamped();
        assert_eq!(c.relevance, 1.0);
        assert_eq!(c.stance, -1.0);
        assert_eq!(c.strength, 0.0);
        assert_eq!(c.credibility, 0.0);
        assert_eq!(c.confidence, 0.4);
    }

    #[test]
    fn credibility_label_parse() {
        assert_eq!(CredibilityLabel::parse("High"), Some(CredibilityLabel::High));
        assert_eq!(CredibilityLabel::parse("med"), Some(CredibilityLabel::Medium));
        assert_eq!(CredibilityLabel::parse("???"), None);
    }
}
