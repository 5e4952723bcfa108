//! Scoring oracle seam.
//!
//! The oracle maps (market context, posts) to per-outcome scores plus display
//! labels. The trait hides whether that is a live language-model service or a
//! test double. Response shape is validated strictly; out-of-range floats are
//! clamped rather than rejected, since the oracle is not perfectly reliable.

pub mod llm;

pub use llm::LlmOracle;

use crate::models::{DisplayLabels, OutcomeScores, PostFlags, PostMetrics};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("oracle api {status}: {message}")]
    Api { status: u16, message: String },

    #[error("oracle transport: {0}")]
    Transport(String),

    #[error("oracle payload invalid: {0}")]
    InvalidPayload(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreRequestOutcome {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreRequestMarket {
    pub market_id: String,
    pub question: String,
    pub outcomes: Vec<ScoreRequestOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreRequestAuthor {
    pub verified: Option<bool>,
    pub followers: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreRequestPost {
    pub post_id: String,
    pub created_at_ms: i64,
    pub text: String,
    pub author: ScoreRequestAuthor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_metrics: Option<PostMetrics>,
}

/// The bundle sent to the oracle for one batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreRequest {
    pub market: ScoreRequestMarket,
    pub posts: Vec<ScoreRequestPost>,
}

/// Scores for one post. Outcomes absent from `per_outcome` are implied
/// zero-relevance, zero-stance and are never synthesized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostScoreResult {
    pub post_id: String,
    pub per_outcome: HashMap<String, OutcomeScores>,
    #[serde(default)]
    pub flags: PostFlags,
    pub display_labels: DisplayLabels,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreResponse {
    pub results: Vec<PostScoreResult>,
}

#[async_trait]
pub trait ScoringOracle: Send + Sync {
    async fn score_batch(&self, request: &ScoreRequest) -> Result<ScoreResponse, OracleError>;
}

/// Validate a response against its request: every result must reference a
/// requested post exactly once, and per-outcome keys must belong to the
/// market. Any violation rejects the whole batch.
pub fn validate_response(
    request: &ScoreRequest,
    response: &ScoreResponse,
) -> Result<(), OracleError> {
    let requested: HashSet<&str> = request.posts.iter().map(|p| p.post_id.as_str()).collect();
    let outcome_ids: HashSet<&str> = request
        .market
        .outcomes
        .iter()
        .map(|o| o.id.as_str())
        .collect();

    let mut seen: HashSet<&str> = HashSet::new();
    for result in &response.results {
        if !requested.contains(result.post_id.as_str()) {
            return Err(OracleError::InvalidPayload(format!(
                "result for unknown post_id {}",
                result.post_id
            )));
        }
        if !seen.insert(result.post_id.as_str()) {
            return Err(OracleError::InvalidPayload(format!(
                "duplicate result for post_id {}",
                result.post_id
            )));
        }
        for key in result.per_outcome.keys() {
            if !outcome_ids.contains(key.as_str()) {
                return Err(OracleError::InvalidPayload(format!(
                    "result for post_id {} references unknown outcome {}",
                    result.post_id, key
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CredibilityLabel;

    fn request() -> ScoreRequest {
        ScoreRequest {
            market: ScoreRequestMarket {
                market_id: "m1".into(),
                question: "Will X happen?".into(),
                outcomes: vec![
                    ScoreRequestOutcome {
                        id: "yes".into(),
                        label: "Yes".into(),
                    },
                    ScoreRequestOutcome {
                        id: "no".into(),
                        label: "No".into(),
                    },
                ],
            },
            posts: vec![ScoreRequestPost {
                post_id: "p1".into(),
                created_at_ms: 1,
                text: "text".into(),
                author: ScoreRequestAuthor {
                    verified: Some(false),
                    followers: Some(10),
                    bio: None,
                },
                initial_metrics: None,
            }],
        }
    }

    fn result_for(post_id: &str, outcome: &str) -> PostScoreResult {
        let mut per_outcome = HashMap::new();
        per_outcome.insert(outcome.to_string(), OutcomeScores::default());
        PostScoreResult {
            post_id: post_id.into(),
            per_outcome,
            flags: PostFlags::default(),
            display_labels: DisplayLabels {
                summary: "s".into(),
                reason: "r".into(),
                credibility_label: CredibilityLabel::Low,
                stance_label: "neutral".into(),
            },
        }
    }

    #[test]
    fn accepts_valid_response() {
        let resp = ScoreResponse {
            results: vec![result_for("p1", "yes")],
        };
        assert!(validate_response(&request(), &resp).is_ok());
    }

    #[test]
    fn missing_outcome_key_is_allowed() {
        // Scoring only "no" leaves "yes" implied at zero relevance.
        let resp = ScoreResponse {
            results: vec![result_for("p1", "no")],
        };
        assert!(validate_response(&request(), &resp).is_ok());
    }

    #[test]
    fn rejects_unknown_post() {
        let resp = ScoreResponse {
            results: vec![result_for("ghost", "yes")],
        };
        assert!(validate_response(&request(), &resp).is_err());
    }

    #[test]
    fn rejects_unknown_outcome() {
        let resp = ScoreResponse {
            results: vec![result_for("p1", "maybe")],
        };
        assert!(validate_response(&request(), &resp).is_err());
    }

    #[test]
    fn rejects_duplicate_posts() {
        let resp = ScoreResponse {
            results: vec![result_for("p1", "yes"), result_for("p1", "no")],
        };
        assert!(validate_response(&request(), &resp).is_err());
    }
}
