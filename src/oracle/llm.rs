//! Language-model scoring client.
//!
//! Sends the batch bundle as a chat-completion request and expects strict
//! JSON back. Models drift: fenced output is tolerated and stripped, but a
//! payload that does not parse into the response schema rejects the batch.

use super::{OracleError, ScoreRequest, ScoreResponse, ScoringOracle};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

const SYSTEM_PROMPT: &str = "You score social-media posts as evidence for prediction-market outcomes. \
You receive one market (question plus outcomes) and a batch of posts as JSON. \
For each post, return per-outcome scores: relevance [0,1], stance [-1,1], \
strength [0,1], credibility [0,1], confidence [0,1]. Omit outcomes the post \
says nothing about. Also return flags {is_sarcasm,is_question,is_quote,is_rumor_style} \
and display_labels {summary, reason, credibility_label one of High|Medium|Low, stance_label}. \
Respond with ONLY a JSON object of the form \
{\"results\":[{\"post_id\":...,\"per_outcome\":{...},\"flags\":{...},\"display_labels\":{...}}]} \
and no other text.";

const MAX_TOKENS: u32 = 4096;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct LlmOracle {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl LlmOracle {
    pub fn new(endpoint: &str, api_key: &str, model: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build oracle client")?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl ScoringOracle for LlmOracle {
    async fn score_batch(&self, request: &ScoreRequest) -> Result<ScoreResponse, OracleError> {
        let start = Instant::now();
        let user = serde_json::to_string(request)
            .map_err(|e| OracleError::InvalidPayload(format!("request encode: {e}")))?;

        let body = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user,
                },
            ],
            temperature: Some(0.0),
            max_tokens: Some(MAX_TOKENS),
        };

        let resp = self
            .http
            .post(format!("{}/chat/completions", self.endpoint))
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_key),
            )
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| OracleError::Transport(e.to_string()))?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(OracleError::Api {
                status: status.as_u16(),
                message: text.chars().take(400).collect(),
            });
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&text)
            .map_err(|e| OracleError::Transport(format!("completion parse: {e}")))?;
        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.as_ref())
            .map(|m| m.content.as_str())
            .unwrap_or_default();

        let response = parse_score_payload(content)?;
        debug!(
            model = %self.model,
            posts = request.posts.len(),
            results = response.results.len(),
            latency_ms = start.elapsed().as_millis() as u64,
            "oracle batch scored"
        );
        Ok(response)
    }
}

/// Parse the model's text output into the response schema, tolerating a
/// fenced code block around the JSON.
pub fn parse_score_payload(content: &str) -> Result<ScoreResponse, OracleError> {
    let stripped = strip_code_fences(content);
    if stripped.is_empty() {
        return Err(OracleError::InvalidPayload("empty completion".to_string()));
    }
    serde_json::from_str(stripped)
        .map_err(|e| OracleError::InvalidPayload(format!("schema mismatch: {e}")))
}

fn strip_code_fences(s: &str) -> &str {
    let trimmed = s.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop an optional language tag on the fence line.
    let rest = match rest.find('\n') {
        Some(i) => &rest[i + 1..],
        None => rest,
    };
    rest.trim_end().trim_end_matches("```").trim()
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessageOut>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatMessageOut {
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str = r#"{
        "results": [{
            "post_id": "p1",
            "per_outcome": {
                "yes": {"relevance": 0.9, "stance": 0.8, "strength": 0.7, "credibility": 0.6, "confidence": 0.5}
            },
            "flags": {"is_sarcasm": false, "is_question": false, "is_quote": false, "is_rumor_style": true},
            "display_labels": {
                "summary": "claims a leak",
                "reason": "single unsourced account",
                "credibility_label": "Low",
                "stance_label": "supports"
            }
        }]
    }"#;

    #[test]
    fn parses_bare_json() {
        let resp = parse_score_payload(PAYLOAD).unwrap();
        assert_eq!(resp.results.len(), 1);
        let scores = &resp.results[0].per_outcome["yes"];
        assert!((scores.relevance - 0.9).abs() < 1e-12);
        assert!(resp.results[0].flags.is_rumor_style);
    }

    #[test]
    fn parses_fenced_json() {
        let fenced = format!("```json\n{PAYLOAD}\n```");
        let resp = parse_score_payload(&fenced).unwrap();
        assert_eq!(resp.results[0].post_id, "p1");
    }

    #[test]
    fn rejects_non_schema_payload() {
        assert!(parse_score_payload("{\"ok\": true}").is_err());
        assert!(parse_score_payload("not json at all").is_err());
        assert!(parse_score_payload("").is_err());
    }
}
