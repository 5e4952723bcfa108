//! Ingestion dispatcher: pull candidate posts for one market, enrich with
//! spam-signal features, and upsert them idempotently.

use super::store_err;
use crate::errors::PipelineError;
use crate::features;
use crate::models::Market;
use crate::sources::PostSource;
use crate::storage::{now_ms, NewRawPost, ScoreStore};
use tracing::debug;

/// Search-operator suffix appended to every market query.
const STANDARD_FILTERS: &str = "-is:retweet lang:en";

#[derive(Debug, Clone, Copy, Default)]
pub struct IngestSummary {
    pub fetched: u32,
    pub ingested: u32,
}

/// Join a market's filter templates into one source query. Returns None when
/// the market has no usable templates (ingest is then a no-op).
pub fn build_query(templates: &[String]) -> Option<String> {
    let parts: Vec<&str> = templates
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .collect();
    if parts.is_empty() {
        return None;
    }
    let joined = if parts.len() == 1 {
        parts[0].to_string()
    } else {
        format!("({})", parts.join(") OR ("))
    };
    Some(format!("{joined} {STANDARD_FILTERS}"))
}

/// Pull up to `max_posts` posts newer than the market's watermark and persist
/// them. One source call per invocation; duplicates are ignored on conflict.
pub async fn ingest_for_market(
    store: &ScoreStore,
    source: &dyn PostSource,
    market: &Market,
    max_posts: u32,
) -> Result<IngestSummary, PipelineError> {
    let Some(query) = build_query(&market.filter_templates) else {
        debug!(market_id = %market.market_id, "no filter templates, skipping ingest");
        return Ok(IngestSummary::default());
    };

    let since_id = store
        .latest_external_post_id(&market.market_id)
        .map_err(store_err)?;

    let page = source
        .search_recent(&query, max_posts, since_id.as_deref())
        .await?;

    let ingested_at = now_ms();
    let mut ingested = 0u32;
    for post in &page.posts {
        let mut feats = features::extract(&post.text);
        feats.is_reply = post.is_reply;
        feats.is_quote = post.is_quote;

        let row = NewRawPost {
            external_post_id: post.external_id.clone(),
            market_id: market.market_id.clone(),
            text: post.text.clone(),
            author_id: post.author_id.clone(),
            author_followers: post.author.followers_count,
            author_verified: post.author.verified.unwrap_or(false),
            author_created_at_ms: post.author.created_at_ms,
            metrics: post.metrics.unwrap_or_default(),
            features: feats,
            post_created_at_ms: post.created_at_ms,
            ingested_at_ms: ingested_at,
        };
        if store.upsert_raw_post(&row).map_err(store_err)? {
            ingested += 1;
        }
    }

    debug!(
        market_id = %market.market_id,
        fetched = page.posts.len(),
        ingested,
        since_id = since_id.as_deref().unwrap_or("-"),
        "ingest complete"
    );
    Ok(IngestSummary {
        fetched: page.posts.len() as u32,
        ingested,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_joins_templates_with_or() {
        let templates = vec!["btc crash".to_string(), "\"bitcoin dump\"".to_string()];
        let query = build_query(&templates).unwrap();
        assert_eq!(
            query,
            "(btc crash) OR (\"bitcoin dump\") -is:retweet lang:en"
        );
    }

    #[test]
    fn single_template_is_not_wrapped() {
        let query = build_query(&["eth merge".to_string()]).unwrap();
        assert_eq!(query, "eth merge -is:retweet lang:en");
    }

    #[test]
    fn blank_templates_yield_none() {
        assert!(build_query(&[]).is_none());
        assert!(build_query(&["  ".to_string(), String::new()]).is_none());
    }
}
