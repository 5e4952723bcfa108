//! Post source seam.
//!
//! Everything upstream of ingestion goes through the [`PostSource`] trait so
//! the pipeline can run against the live API or an in-memory fake. Rate
//! limits get their own error kind; the orchestrator backs off on them.

pub mod x_api;

pub use x_api::XApiClient;

use crate::models::PostMetrics;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("post source rate limited")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("post source api {status}: {message}")]
    Api { status: u16, message: String },

    #[error("post source transport: {0}")]
    Transport(String),
}

/// A filter rule as registered on the external source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRule {
    pub id: String,
    pub value: String,
    pub tag: Option<String>,
}

/// A rule to register; the source assigns the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSourceRule {
    pub value: String,
    pub tag: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceAuthor {
    pub username: Option<String>,
    pub verified: Option<bool>,
    pub followers_count: Option<i64>,
    pub created_at_ms: Option<i64>,
}

/// A candidate post returned by recent search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcePost {
    pub external_id: String,
    pub text: String,
    pub created_at_ms: i64,
    pub author_id: String,
    pub author: SourceAuthor,
    pub metrics: Option<PostMetrics>,
    pub is_reply: Option<bool>,
    pub is_quote: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchMeta {
    pub newest_id: Option<String>,
    pub oldest_id: Option<String>,
    pub result_count: u32,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchPage {
    pub posts: Vec<SourcePost>,
    pub meta: SearchMeta,
}

/// Abstract post source: keyword search plus filter-rule management.
#[async_trait]
pub trait PostSource: Send + Sync {
    async fn get_rules(&self) -> Result<Vec<SourceRule>, SourceError>;

    async fn add_rules(&self, rules: &[NewSourceRule]) -> Result<Vec<SourceRule>, SourceError>;

    async fn delete_rules(&self, ids: &[String]) -> Result<(), SourceError>;

    async fn search_recent(
        &self,
        query: &str,
        max_results: u32,
        since_id: Option<&str>,
    ) -> Result<SearchPage, SourceError>;
}
