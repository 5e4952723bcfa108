//! Database-backed score store.
//!
//! Owns every table the pipeline touches: markets, outcomes, raw posts,
//! per-outcome scores, market state, probability snapshots, and filter-rule
//! bookkeeping. All writes are idempotent upserts on natural keys; the
//! unique indexes on `(external_post_id, market_id)` and
//! `(raw_post_id, market_id, outcome_key)` are what make re-ingest and
//! re-scoring safe to repeat.

use crate::engine::MAX_AGE_MS;
use crate::models::{
    CredibilityLabel, DisplayLabels, FilterRule, Market, MarketState, MarketStatus, Outcome,
    OutcomeScores, PostFeatures, PostFlags, PostMetrics, ProbabilitySnapshot, RawPost, ScoredPost,
};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, Row};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS markets (
    market_id TEXT PRIMARY KEY,
    question TEXT NOT NULL,
    normalized_question TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    filter_templates TEXT NOT NULL DEFAULT '[]',
    total_posts_processed INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS outcomes (
    market_id TEXT NOT NULL,
    outcome_key TEXT NOT NULL,
    label TEXT NOT NULL,
    sort_order INTEGER NOT NULL DEFAULT 0,
    prior_probability REAL,
    current_probability REAL,
    PRIMARY KEY (market_id, outcome_key)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS raw_posts (
    id INTEGER PRIMARY KEY,
    external_post_id TEXT NOT NULL,
    market_id TEXT NOT NULL,
    text TEXT NOT NULL,
    author_id TEXT NOT NULL,
    author_followers INTEGER,
    author_verified INTEGER NOT NULL DEFAULT 0,
    author_created_at INTEGER,
    likes INTEGER,
    reposts INTEGER,
    replies INTEGER,
    quotes INTEGER,
    cashtag_count INTEGER NOT NULL DEFAULT 0,
    mention_count INTEGER NOT NULL DEFAULT 0,
    url_count INTEGER NOT NULL DEFAULT 0,
    caps_ratio REAL NOT NULL DEFAULT 0,
    is_reply INTEGER,
    is_quote INTEGER,
    post_created_at INTEGER NOT NULL,
    ingested_at INTEGER NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_raw_posts_external
    ON raw_posts(external_post_id, market_id);

CREATE INDEX IF NOT EXISTS idx_raw_posts_market_created
    ON raw_posts(market_id, post_created_at DESC);

CREATE TABLE IF NOT EXISTS scored_posts (
    raw_post_id INTEGER NOT NULL,
    market_id TEXT NOT NULL,
    outcome_key TEXT NOT NULL,
    relevance REAL NOT NULL,
    stance REAL NOT NULL,
    strength REAL NOT NULL,
    credibility REAL NOT NULL,
    confidence REAL NOT NULL,
    is_sarcasm INTEGER NOT NULL DEFAULT 0,
    is_question INTEGER NOT NULL DEFAULT 0,
    is_quote INTEGER NOT NULL DEFAULT 0,
    is_rumor_style INTEGER NOT NULL DEFAULT 0,
    summary TEXT NOT NULL DEFAULT '',
    reason TEXT NOT NULL DEFAULT '',
    credibility_label TEXT NOT NULL DEFAULT 'Medium',
    stance_label TEXT NOT NULL DEFAULT '',
    scored_at INTEGER NOT NULL,
    PRIMARY KEY (raw_post_id, market_id, outcome_key)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS market_state (
    market_id TEXT PRIMARY KEY,
    probabilities TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    accepted_post_count INTEGER NOT NULL DEFAULT 0
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS probability_snapshots (
    market_id TEXT NOT NULL,
    snapshot_at INTEGER NOT NULL,
    probabilities TEXT NOT NULL,
    PRIMARY KEY (market_id, snapshot_at)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_snapshots_market_at
    ON probability_snapshots(market_id, snapshot_at DESC);

CREATE TABLE IF NOT EXISTS filter_rules (
    market_id TEXT NOT NULL,
    external_rule_id TEXT NOT NULL,
    rule_value TEXT NOT NULL,
    rule_tag TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (market_id, external_rule_id)
) WITHOUT ROWID;
"#;

/// A raw post about to be inserted; the store assigns the row id.
#[derive(Debug, Clone)]
pub struct NewRawPost {
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
}

#[derive(Clone)]
pub struct ScoreStore {
    conn: Arc<Mutex<Connection>>,
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl ScoreStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let markets: i64 = conn
            .query_row("SELECT COUNT(*) FROM markets", [], |row| row.get(0))
            .unwrap_or(0);
        info!("Score store initialized at {} ({} markets)", db_path, markets);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ------------------------------------------------------------------
    // Markets & outcomes
    // ------------------------------------------------------------------

    pub fn create_market(&self, market: &Market, outcomes: &[Outcome]) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;
        let result = (|| -> Result<()> {
            conn.execute(
                "INSERT INTO markets \
                 (market_id, question, normalized_question, status, filter_templates, \
                  total_posts_processed, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                 ON CONFLICT(market_id) DO UPDATE SET \
                   question = excluded.question, \
                   normalized_question = excluded.normalized_question, \
                   status = excluded.status, \
                   filter_templates = excluded.filter_templates, \
                   updated_at = excluded.updated_at",
                params![
                    market.market_id,
                    market.question,
                    market.normalized_question,
                    market.status.as_str(),
                    serde_json::to_string(&market.filter_templates)?,
                    market.total_posts_processed,
                    market.created_at_ms,
                    market.updated_at_ms,
                ],
            )?;
            for o in outcomes {
                conn.execute(
                    "INSERT INTO outcomes \
                     (market_id, outcome_key, label, sort_order, prior_probability, current_probability) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                     ON CONFLICT(market_id, outcome_key) DO UPDATE SET \
                       label = excluded.label, \
                       sort_order = excluded.sort_order, \
                       prior_probability = excluded.prior_probability",
                    params![
                        market.market_id,
                        o.outcome_key,
                        o.label,
                        o.sort_order,
                        o.prior_probability,
                        o.current_probability,
                    ],
                )?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => {
                conn.execute("COMMIT", [])?;
                Ok(())
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    pub fn get_market(&self, market_id: &str) -> Result<Option<Market>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT market_id, question, normalized_question, status, filter_templates, \
                    total_posts_processed, created_at, updated_at \
             FROM markets WHERE market_id = ?1",
        )?;
        let mut rows = stmt.query_map([market_id], Self::row_to_market)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn list_active_markets(&self) -> Result<Vec<Market>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT market_id, question, normalized_question, status, filter_templates, \
                    total_posts_processed, created_at, updated_at \
             FROM markets WHERE status = 'active' ORDER BY created_at, market_id",
        )?;
        let markets = stmt
            .query_map([], Self::row_to_market)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(markets)
    }

    pub fn set_market_status(&self, market_id: &str, status: MarketStatus) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE markets SET status = ?2, updated_at = ?3 WHERE market_id = ?1",
            params![market_id, status.as_str(), now_ms()],
        )?;
        Ok(())
    }

    pub fn set_total_posts_processed(&self, market_id: &str, total: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE markets SET total_posts_processed = ?2 WHERE market_id = ?1",
            params![market_id, total],
        )?;
        Ok(())
    }

    pub fn outcomes_for_market(&self, market_id: &str) -> Result<Vec<Outcome>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT outcome_key, label, sort_order, prior_probability, current_probability \
             FROM outcomes WHERE market_id = ?1 ORDER BY sort_order, outcome_key",
        )?;
        let outcomes = stmt
            .query_map([market_id], |row| {
                Ok(Outcome {
                    outcome_key: row.get(0)?,
                    label: row.get(1)?,
                    sort_order: row.get(2)?,
                    prior_probability: row.get(3)?,
                    current_probability: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(outcomes)
    }

    pub fn write_current_probabilities(
        &self,
        market_id: &str,
        probabilities: &BTreeMap<String, f64>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;
        for (key, p) in probabilities {
            if let Err(e) = conn.execute(
                "UPDATE outcomes SET current_probability = ?3 \
                 WHERE market_id = ?1 AND outcome_key = ?2",
                params![market_id, key, p],
            ) {
                let _ = conn.execute("ROLLBACK", []);
                return Err(e.into());
            }
        }
        conn.execute("COMMIT", [])?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Raw posts
    // ------------------------------------------------------------------

    /// Insert a raw post, ignoring duplicates of `(external_post_id, market_id)`.
    /// Returns whether a new row was inserted.
    pub fn upsert_raw_post(&self, post: &NewRawPost) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO raw_posts \
             (external_post_id, market_id, text, author_id, author_followers, author_verified, \
              author_created_at, likes, reposts, replies, quotes, \
              cashtag_count, mention_count, url_count, caps_ratio, is_reply, is_quote, \
              post_created_at, ingested_at, is_active) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, 1)",
            params![
                post.external_post_id,
                post.market_id,
                post.text,
                post.author_id,
                post.author_followers,
                post.author_verified,
                post.author_created_at_ms,
                post.metrics.likes,
                post.metrics.reposts,
                post.metrics.replies,
                post.metrics.quotes,
                post.features.cashtag_count,
                post.features.mention_count,
                post.features.url_count,
                post.features.caps_ratio,
                post.features.is_reply,
                post.features.is_quote,
                post.post_created_at_ms,
                post.ingested_at_ms,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Newest previously-ingested external post id for a market, used as the
    /// ingest watermark.
    pub fn latest_external_post_id(&self, market_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let id = conn
            .query_row(
                "SELECT external_post_id FROM raw_posts WHERE market_id = ?1 \
                 ORDER BY post_created_at DESC, id DESC LIMIT 1",
                [market_id],
                |row| row.get::<_, String>(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(id)
    }

    /// Active raw posts inside the compute window, newest first.
    pub fn recent_raw_posts(&self, market_id: &str, now_ms: i64) -> Result<Vec<RawPost>> {
        let cutoff = now_ms - MAX_AGE_MS;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, external_post_id, market_id, text, author_id, author_followers, \
                    author_verified, author_created_at, likes, reposts, replies, quotes, \
                    cashtag_count, mention_count, url_count, caps_ratio, is_reply, is_quote, \
                    post_created_at, ingested_at, is_active \
             FROM raw_posts \
             WHERE market_id = ?1 AND is_active = 1 AND post_created_at >= ?2 \
             ORDER BY post_created_at DESC, id DESC",
        )?;
        let posts = stmt
            .query_map(params![market_id, cutoff], Self::row_to_raw_post)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(posts)
    }

    pub fn count_raw_posts(&self, market_id: &str) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM raw_posts WHERE market_id = ?1",
            [market_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Raw posts for a market that have no scored rows yet, most recently
    /// ingested first, bounded by `limit`.
    pub fn unscored_posts(&self, market_id: &str, limit: u32) -> Result<Vec<RawPost>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT r.id, r.external_post_id, r.market_id, r.text, r.author_id, \
                    r.author_followers, r.author_verified, r.author_created_at, \
                    r.likes, r.reposts, r.replies, r.quotes, \
                    r.cashtag_count, r.mention_count, r.url_count, r.caps_ratio, \
                    r.is_reply, r.is_quote, r.post_created_at, r.ingested_at, r.is_active \
             FROM raw_posts r \
             LEFT JOIN scored_posts s \
               ON s.raw_post_id = r.id AND s.market_id = r.market_id \
             WHERE r.market_id = ?1 AND r.is_active = 1 AND s.raw_post_id IS NULL \
             GROUP BY r.id \
             ORDER BY r.ingested_at DESC, r.id DESC \
             LIMIT ?2",
        )?;
        let posts = stmt
            .query_map(params![market_id, limit], Self::row_to_raw_post)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(posts)
    }

    // ------------------------------------------------------------------
    // Scored posts
    // ------------------------------------------------------------------

    /// Batch-upsert scored rows; conflicts on the natural key replace.
    pub fn upsert_scored(&self, rows: &[ScoredPost]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;
        for row in rows {
            let result = conn.execute(
                "INSERT OR REPLACE INTO scored_posts \
                 (raw_post_id, market_id, outcome_key, relevance, stance, strength, credibility, \
                  confidence, is_sarcasm, is_question, is_quote, is_rumor_style, \
                  summary, reason, credibility_label, stance_label, scored_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                params![
                    row.raw_post_id,
                    row.market_id,
                    row.outcome_key,
                    row.scores.relevance,
                    row.scores.stance,
                    row.scores.strength,
                    row.scores.credibility,
                    row.scores.confidence,
                    row.flags.is_sarcasm,
                    row.flags.is_question,
                    row.flags.is_quote,
                    row.flags.is_rumor_style,
                    row.labels.summary,
                    row.labels.reason,
                    row.labels.credibility_label.as_str(),
                    row.labels.stance_label,
                    row.scored_at_ms,
                ],
            );
            if let Err(e) = result {
                let _ = conn.execute("ROLLBACK", []);
                return Err(e.into());
            }
        }
        conn.execute("COMMIT", [])?;
        Ok(())
    }

    /// Scored rows for the given raw post ids within one market.
    pub fn scored_for_posts(&self, market_id: &str, post_ids: &[i64]) -> Result<Vec<ScoredPost>> {
        if post_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; post_ids.len()].join(",");
        let sql = format!(
            "SELECT raw_post_id, market_id, outcome_key, relevance, stance, strength, \
                    credibility, confidence, is_sarcasm, is_question, is_quote, is_rumor_style, \
                    summary, reason, credibility_label, stance_label, scored_at \
             FROM scored_posts \
             WHERE market_id = ? AND raw_post_id IN ({placeholders}) \
             ORDER BY raw_post_id, outcome_key"
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let mut values: Vec<rusqlite::types::Value> =
            vec![rusqlite::types::Value::Text(market_id.to_string())];
        values.extend(post_ids.iter().map(|id| rusqlite::types::Value::Integer(*id)));
        let rows = stmt
            .query_map(params_from_iter(values), Self::row_to_scored)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn count_scored_rows(&self, market_id: &str) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM scored_posts WHERE market_id = ?1",
            [market_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Market state & snapshots
    // ------------------------------------------------------------------

    pub fn get_market_state(&self, market_id: &str) -> Result<Option<MarketState>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT probabilities, updated_at, accepted_post_count \
                 FROM market_state WHERE market_id = ?1",
                [market_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        match row {
            None => Ok(None),
            Some((json, updated_at_ms, accepted_post_count)) => {
                let probabilities: BTreeMap<String, f64> = serde_json::from_str(&json)
                    .with_context(|| format!("corrupt market_state for {market_id}"))?;
                Ok(Some(MarketState {
                    market_id: market_id.to_string(),
                    probabilities,
                    updated_at_ms,
                    accepted_post_count,
                }))
            }
        }
    }

    pub fn upsert_market_state(&self, state: &MarketState) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO market_state (market_id, probabilities, updated_at, accepted_post_count) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(market_id) DO UPDATE SET \
               probabilities = excluded.probabilities, \
               updated_at = excluded.updated_at, \
               accepted_post_count = excluded.accepted_post_count",
            params![
                state.market_id,
                serde_json::to_string(&state.probabilities)?,
                state.updated_at_ms,
                state.accepted_post_count,
            ],
        )?;
        Ok(())
    }

    pub fn append_snapshot(&self, snapshot: &ProbabilitySnapshot) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO probability_snapshots (market_id, snapshot_at, probabilities) \
             VALUES (?1, ?2, ?3)",
            params![
                snapshot.market_id,
                snapshot.snapshot_at_ms,
                serde_json::to_string(&snapshot.probabilities)?,
            ],
        )?;
        Ok(())
    }

    /// Most recent snapshots for a market, newest first.
    pub fn recent_snapshots(&self, market_id: &str, limit: u32) -> Result<Vec<ProbabilitySnapshot>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT snapshot_at, probabilities FROM probability_snapshots \
             WHERE market_id = ?1 ORDER BY snapshot_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![market_id, limit], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut snapshots = Vec::with_capacity(rows.len());
        for (snapshot_at_ms, json) in rows {
            snapshots.push(ProbabilitySnapshot {
                market_id: market_id.to_string(),
                snapshot_at_ms,
                probabilities: serde_json::from_str(&json)
                    .with_context(|| format!("corrupt snapshot for {market_id}"))?,
            });
        }
        Ok(snapshots)
    }

    // ------------------------------------------------------------------
    // Filter rules
    // ------------------------------------------------------------------

    pub fn list_rules(&self) -> Result<Vec<FilterRule>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT market_id, external_rule_id, rule_value, rule_tag, created_at \
             FROM filter_rules ORDER BY market_id, external_rule_id",
        )?;
        let rules = stmt
            .query_map([], |row| {
                Ok(FilterRule {
                    market_id: row.get(0)?,
                    external_rule_id: row.get(1)?,
                    rule_value: row.get(2)?,
                    rule_tag: row.get(3)?,
                    created_at_ms: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rules)
    }

    pub fn upsert_rule(&self, rule: &FilterRule) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO filter_rules (market_id, external_rule_id, rule_value, rule_tag, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(market_id, external_rule_id) DO UPDATE SET \
               rule_value = excluded.rule_value, \
               rule_tag = excluded.rule_tag",
            params![
                rule.market_id,
                rule.external_rule_id,
                rule.rule_value,
                rule.rule_tag,
                rule.created_at_ms,
            ],
        )?;
        Ok(())
    }

    pub fn delete_rules_for_market(&self, market_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM filter_rules WHERE market_id = ?1", [market_id])?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Row mappers
    // ------------------------------------------------------------------

    fn row_to_market(row: &Row) -> rusqlite::Result<Market> {
        let status_raw: String = row.get(3)?;
        let templates_raw: String = row.get(4)?;
        Ok(Market {
            market_id: row.get(0)?,
            question: row.get(1)?,
            normalized_question: row.get(2)?,
            status: MarketStatus::parse(&status_raw).unwrap_or(MarketStatus::Closed),
            filter_templates: serde_json::from_str(&templates_raw).unwrap_or_default(),
            total_posts_processed: row.get(5)?,
            created_at_ms: row.get(6)?,
            updated_at_ms: row.get(7)?,
        })
    }

    fn row_to_raw_post(row: &Row) -> rusqlite::Result<RawPost> {
        Ok(RawPost {
            id: row.get(0)?,
            external_post_id: row.get(1)?,
            market_id: row.get(2)?,
            text: row.get(3)?,
            author_id: row.get(4)?,
            author_followers: row.get(5)?,
            author_verified: row.get(6)?,
            author_created_at_ms: row.get(7)?,
            metrics: PostMetrics {
                likes: row.get(8)?,
                reposts: row.get(9)?,
                replies: row.get(10)?,
                quotes: row.get(11)?,
            },
            features: PostFeatures {
                cashtag_count: row.get(12)?,
                mention_count: row.get(13)?,
                url_count: row.get(14)?,
                caps_ratio: row.get(15)?,
                is_reply: row.get(16)?,
                is_quote: row.get(17)?,
            },
            post_created_at_ms: row.get(18)?,
            ingested_at_ms: row.get(19)?,
            is_active: row.get(20)?,
        })
    }

    fn row_to_scored(row: &Row) -> rusqlite::Result<ScoredPost> {
        let credibility_raw: String = row.get(14)?;
        Ok(ScoredPost {
            raw_post_id: row.get(0)?,
            market_id: row.get(1)?,
            outcome_key: row.get(2)?,
            scores: OutcomeScores {
                relevance: row.get(3)?,
                stance: row.get(4)?,
                strength: row.get(5)?,
                credibility: row.get(6)?,
                confidence: row.get(7)?,
            },
            flags: PostFlags {
                is_sarcasm: row.get(8)?,
                is_question: row.get(9)?,
                is_quote: row.get(10)?,
                is_rumor_style: row.get(11)?,
            },
            labels: DisplayLabels {
                summary: row.get(12)?,
                reason: row.get(13)?,
                credibility_label: CredibilityLabel::parse(&credibility_raw)
                    .unwrap_or(CredibilityLabel::Medium),
                stance_label: row.get(15)?,
            },
            scored_at_ms: row.get(16)?,
        })
    }
}

/// Convenience constructor for fixtures: a two-outcome market with templates.
pub fn market_fixture(market_id: &str, question: &str, templates: &[&str]) -> Market {
    let now = now_ms();
    Market {
        market_id: market_id.to_string(),
        question: question.to_string(),
        normalized_question: question.trim().to_ascii_lowercase(),
        status: MarketStatus::Active,
        filter_templates: templates.iter().map(|t| t.to_string()).collect(),
        total_posts_processed: 0,
        created_at_ms: now,
        updated_at_ms: now,
    }
}

pub fn outcome_fixture(key: &str, label: &str, sort_order: i64) -> Outcome {
    Outcome {
        outcome_key: key.to_string(),
        label: label.to_string(),
        sort_order,
        prior_probability: None,
        current_probability: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, ScoreStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = ScoreStore::new(path.to_str().unwrap()).unwrap();
        (dir, store)
    }

    fn new_post(external_id: &str, market_id: &str, created_at_ms: i64) -> NewRawPost {
        NewRawPost {
            external_post_id: external_id.to_string(),
            market_id: market_id.to_string(),
            text: "some post".to_string(),
            author_id: "author1".to_string(),
            author_followers: Some(10),
            author_verified: false,
            author_created_at_ms: None,
            metrics: PostMetrics::default(),
            features: PostFeatures::default(),
            post_created_at_ms: created_at_ms,
            ingested_at_ms: created_at_ms + 500,
        }
    }

    fn scored_row(raw_post_id: i64, market_id: &str, key: &str, relevance: f64) -> ScoredPost {
        ScoredPost {
            raw_post_id,
            market_id: market_id.to_string(),
            outcome_key: key.to_string(),
            scores: OutcomeScores {
                relevance,
                stance: 0.5,
                strength: 0.5,
                credibility: 0.5,
                confidence: 0.5,
            },
            flags: PostFlags::default(),
            labels: DisplayLabels {
                summary: "s".into(),
                reason: "r".into(),
                credibility_label: CredibilityLabel::Medium,
                stance_label: "supports".into(),
            },
            scored_at_ms: 1_000,
        }
    }

    #[test]
    fn raw_post_upsert_is_idempotent() {
        let (_dir, store) = open_store();
        let post = new_post("ext1", "m1", 1_000);
        assert!(store.upsert_raw_post(&post).unwrap());
        assert!(!store.upsert_raw_post(&post).unwrap());
        assert_eq!(store.count_raw_posts("m1").unwrap(), 1);

        // Same external id under another market is a distinct row.
        let other = new_post("ext1", "m2", 1_000);
        assert!(store.upsert_raw_post(&other).unwrap());
    }

    #[test]
    fn scored_upsert_replaces_on_conflict() {
        let (_dir, store) = open_store();
        store.upsert_raw_post(&new_post("ext1", "m1", 1_000)).unwrap();
        let posts = store.unscored_posts("m1", 10).unwrap();
        let id = posts[0].id;

        store.upsert_scored(&[scored_row(id, "m1", "yes", 0.3)]).unwrap();
        store.upsert_scored(&[scored_row(id, "m1", "yes", 0.9)]).unwrap();
        assert_eq!(store.count_scored_rows("m1").unwrap(), 1);
        let rows = store.scored_for_posts("m1", &[id]).unwrap();
        assert_eq!(rows.len(), 1);
        assert!((rows[0].scores.relevance - 0.9).abs() < 1e-12);
    }

    #[test]
    fn unscored_excludes_scored_posts() {
        let (_dir, store) = open_store();
        store.upsert_raw_post(&new_post("ext1", "m1", 1_000)).unwrap();
        store.upsert_raw_post(&new_post("ext2", "m1", 2_000)).unwrap();
        let unscored = store.unscored_posts("m1", 10).unwrap();
        assert_eq!(unscored.len(), 2);

        store
            .upsert_scored(&[scored_row(unscored[0].id, "m1", "yes", 0.5)])
            .unwrap();
        let remaining = store.unscored_posts("m1", 10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_ne!(remaining[0].id, unscored[0].id);
    }

    #[test]
    fn watermark_is_newest_by_created_at() {
        let (_dir, store) = open_store();
        assert!(store.latest_external_post_id("m1").unwrap().is_none());
        store.upsert_raw_post(&new_post("ext_old", "m1", 1_000)).unwrap();
        store.upsert_raw_post(&new_post("ext_new", "m1", 9_000)).unwrap();
        store.upsert_raw_post(&new_post("ext_mid", "m1", 5_000)).unwrap();
        assert_eq!(
            store.latest_external_post_id("m1").unwrap().as_deref(),
            Some("ext_new")
        );
    }

    #[test]
    fn recent_posts_respects_window() {
        let (_dir, store) = open_store();
        let now = 1_700_000_000_000i64;
        store
            .upsert_raw_post(&new_post("fresh", "m1", now - 1_000))
            .unwrap();
        store
            .upsert_raw_post(&new_post("stale", "m1", now - MAX_AGE_MS - 1))
            .unwrap();
        let recent = store.recent_raw_posts("m1", now).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].external_post_id, "fresh");
    }

    #[test]
    fn market_state_roundtrip() {
        let (_dir, store) = open_store();
        assert!(store.get_market_state("m1").unwrap().is_none());
        let mut probabilities = BTreeMap::new();
        probabilities.insert("yes".to_string(), 0.7);
        probabilities.insert("no".to_string(), 0.3);
        let state = MarketState {
            market_id: "m1".to_string(),
            probabilities: probabilities.clone(),
            updated_at_ms: 123,
            accepted_post_count: 4,
        };
        store.upsert_market_state(&state).unwrap();
        let loaded = store.get_market_state("m1").unwrap().unwrap();
        assert_eq!(loaded.probabilities, probabilities);
        assert_eq!(loaded.accepted_post_count, 4);

        store
            .upsert_market_state(&MarketState {
                updated_at_ms: 456,
                ..state
            })
            .unwrap();
        assert_eq!(store.get_market_state("m1").unwrap().unwrap().updated_at_ms, 456);
    }

    #[test]
    fn snapshots_ordered_newest_first() {
        let (_dir, store) = open_store();
        for ts in [100i64, 300, 200] {
            store
                .append_snapshot(&ProbabilitySnapshot {
                    market_id: "m1".to_string(),
                    snapshot_at_ms: ts,
                    probabilities: BTreeMap::new(),
                })
                .unwrap();
        }
        let snaps = store.recent_snapshots("m1", 10).unwrap();
        let times: Vec<i64> = snaps.iter().map(|s| s.snapshot_at_ms).collect();
        assert_eq!(times, vec![300, 200, 100]);
    }

    #[test]
    fn market_and_outcomes_roundtrip() {
        let (_dir, store) = open_store();
        let market = market_fixture("m1", "Will it rain?", &["rain forecast", "storm"]);
        let outcomes = vec![
            outcome_fixture("yes", "Yes", 0),
            outcome_fixture("no", "No", 1),
        ];
        store.create_market(&market, &outcomes).unwrap();

        let loaded = store.get_market("m1").unwrap().unwrap();
        assert_eq!(loaded.filter_templates, vec!["rain forecast", "storm"]);
        assert_eq!(loaded.status, MarketStatus::Active);

        let keys: Vec<String> = store
            .outcomes_for_market("m1")
            .unwrap()
            .into_iter()
            .map(|o| o.outcome_key)
            .collect();
        assert_eq!(keys, vec!["yes", "no"]);

        store.set_market_status("m1", MarketStatus::Resolved).unwrap();
        assert!(store.list_active_markets().unwrap().is_empty());
    }

    #[test]
    fn rule_bookkeeping() {
        let (_dir, store) = open_store();
        let rule = FilterRule {
            market_id: "m1".to_string(),
            external_rule_id: "r1".to_string(),
            rule_value: "btc OR bitcoin".to_string(),
            rule_tag: "m1".to_string(),
            created_at_ms: 1,
        };
        store.upsert_rule(&rule).unwrap();
        store.upsert_rule(&rule).unwrap();
        assert_eq!(store.list_rules().unwrap().len(), 1);
        store.delete_rules_for_market("m1").unwrap();
        assert!(store.list_rules().unwrap().is_empty());
    }
}
