//! Scoring dispatcher: batch unscored posts, call the oracle, and expand the
//! validated response into per-outcome rows.
//!
//! The whole batch is validated before anything is written; a partially
//! malformed response rejects the batch and the next tick retries it.

use super::store_err;
use crate::errors::PipelineError;
use crate::models::{Market, RawPost, ScoredPost};
use crate::oracle::{
    validate_response, ScoreRequest, ScoreRequestAuthor, ScoreRequestMarket, ScoreRequestOutcome,
    ScoreRequestPost, ScoringOracle,
};
use crate::storage::{now_ms, ScoreStore};
use std::collections::HashMap;
use tracing::{debug, info};

/// Score up to `batch_size` unscored posts for a market. Returns the number
/// of posts the oracle scored.
pub async fn score_unscored(
    store: &ScoreStore,
    oracle: &dyn ScoringOracle,
    market: &Market,
    batch_size: u32,
) -> Result<u32, PipelineError> {
    let outcomes = store
        .outcomes_for_market(&market.market_id)
        .map_err(store_err)?;
    if outcomes.is_empty() {
        return Err(PipelineError::InvalidInput(format!(
            "market {} has no outcomes",
            market.market_id
        )));
    }

    let posts = store
        .unscored_posts(&market.market_id, batch_size)
        .map_err(store_err)?;
    if posts.is_empty() {
        debug!(market_id = %market.market_id, "nothing to score");
        return Ok(0);
    }

    let request = ScoreRequest {
        market: ScoreRequestMarket {
            market_id: market.market_id.clone(),
            question: market.question.clone(),
            outcomes: outcomes
                .iter()
                .map(|o| ScoreRequestOutcome {
                    id: o.outcome_key.clone(),
                    label: o.label.clone(),
                })
                .collect(),
        },
        posts: posts.iter().map(request_post).collect(),
    };

    let response = oracle.score_batch(&request).await?;
    validate_response(&request, &response)?;

    let by_external: HashMap<&str, &RawPost> = posts
        .iter()
        .map(|p| (p.external_post_id.as_str(), p))
        .collect();

    let scored_at = now_ms();
    let mut rows: Vec<ScoredPost> = Vec::new();
    for result in &response.results {
        // Validation guarantees the lookup succeeds.
        let raw = by_external[result.post_id.as_str()];
        for (outcome_key, scores) in &result.per_outcome {
            rows.push(ScoredPost {
                raw_post_id: raw.id,
                market_id: market.market_id.clone(),
                outcome_key: outcome_key.clone(),
                scores: scores.clamped(),
                flags: result.flags,
                labels: result.display_labels.clone(),
                scored_at_ms: scored_at,
            });
        }
    }
    store.upsert_scored(&rows).map_err(store_err)?;

    info!(
        market_id = %market.market_id,
        batched = posts.len(),
        scored = response.results.len(),
        rows = rows.len(),
        "scoring batch persisted"
    );
    Ok(response.results.len() as u32)
}

fn request_post(post: &RawPost) -> ScoreRequestPost {
    ScoreRequestPost {
        post_id: post.external_post_id.clone(),
        created_at_ms: post.post_created_at_ms,
        text: post.text.clone(),
        author: ScoreRequestAuthor {
            verified: Some(post.author_verified),
            followers: post.author_followers,
            bio: None,
        },
        initial_metrics: Some(post.metrics),
    }
}
