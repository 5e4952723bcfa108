//! Live post-source client over the v2-style recent-search API.

use super::{
    NewSourceRule, PostSource, SearchMeta, SearchPage, SourceAuthor, SourceError, SourcePost,
    SourceRule,
};
use crate::models::PostMetrics;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

const API_BASE: &str = "https://api.twitter.com/2";

const TWEET_FIELDS: &str = "created_at,author_id,public_metrics,referenced_tweets";
const USER_FIELDS: &str = "username,verified,public_metrics,created_at";

#[derive(Clone)]
pub struct XApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl XApiClient {
    pub fn new(bearer_token: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90))
            .default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert(
                    reqwest::header::AUTHORIZATION,
                    format!("Bearer {}", bearer_token)
                        .parse()
                        .context("Invalid post source token")?,
                );
                headers
            })
            .build()
            .context("Failed to build post source client")?;

        Ok(Self {
            client,
            base_url: API_BASE.to_string(),
        })
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.to_string();
        self
    }

    #[inline]
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, SourceError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status.as_u16() == 429 {
            let retry_after_secs = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(SourceError::RateLimited { retry_after_secs });
        }
        let body = resp.text().await.unwrap_or_default();
        Err(SourceError::Api {
            status: status.as_u16(),
            message: body.chars().take(400).collect(),
        })
    }
}

#[async_trait]
impl PostSource for XApiClient {
    async fn get_rules(&self) -> Result<Vec<SourceRule>, SourceError> {
        let resp = self
            .client
            .get(self.url("/tweets/search/stream/rules"))
            .send()
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))?;
        let resp = Self::check(resp).await?;
        let parsed: RulesResponse = resp
            .json()
            .await
            .map_err(|e| SourceError::Transport(format!("rules parse: {e}")))?;
        Ok(parsed.data.unwrap_or_default())
    }

    async fn add_rules(&self, rules: &[NewSourceRule]) -> Result<Vec<SourceRule>, SourceError> {
        let body = RulesMutation {
            add: Some(rules.to_vec()),
            delete: None,
        };
        let resp = self
            .client
            .post(self.url("/tweets/search/stream/rules"))
            .json(&body)
            .send()
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))?;
        let resp = Self::check(resp).await?;
        let parsed: RulesResponse = resp
            .json()
            .await
            .map_err(|e| SourceError::Transport(format!("rules parse: {e}")))?;
        Ok(parsed.data.unwrap_or_default())
    }

    async fn delete_rules(&self, ids: &[String]) -> Result<(), SourceError> {
        if ids.is_empty() {
            return Ok(());
        }
        let body = RulesMutation {
            add: None,
            delete: Some(RuleDelete { ids: ids.to_vec() }),
        };
        let resp = self
            .client
            .post(self.url("/tweets/search/stream/rules"))
            .json(&body)
            .send()
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn search_recent(
        &self,
        query: &str,
        max_results: u32,
        since_id: Option<&str>,
    ) -> Result<SearchPage, SourceError> {
        let mut qp: Vec<(String, String)> = Vec::with_capacity(6);
        qp.push(("query".to_string(), query.to_string()));
        qp.push(("max_results".to_string(), max_results.clamp(10, 100).to_string()));
        qp.push(("tweet.fields".to_string(), TWEET_FIELDS.to_string()));
        qp.push(("expansions".to_string(), "author_id".to_string()));
        qp.push(("user.fields".to_string(), USER_FIELDS.to_string()));
        if let Some(id) = since_id {
            qp.push(("since_id".to_string(), id.to_string()));
        }

        let resp = self
            .client
            .get(self.url("/tweets/search/recent"))
            .query(&qp)
            .send()
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))?;
        let resp = Self::check(resp).await?;
        let parsed: SearchResponse = resp
            .json()
            .await
            .map_err(|e| SourceError::Transport(format!("search parse: {e}")))?;
        Ok(map_search_response(parsed))
    }
}

fn parse_ms(rfc3339: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(rfc3339)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

fn map_search_response(resp: SearchResponse) -> SearchPage {
    let users: HashMap<String, ApiUser> = resp
        .includes
        .map(|inc| inc.users)
        .unwrap_or_default()
        .into_iter()
        .map(|u| (u.id.clone(), u))
        .collect();

    let posts = resp
        .data
        .unwrap_or_default()
        .into_iter()
        .filter_map(|t| {
            let Some(created_at_ms) = t.created_at.as_deref().and_then(parse_ms) else {
                warn!("dropping post {} with unparseable created_at", t.id);
                return None;
            };
            let author = users.get(&t.author_id);
            let refs = t.referenced_tweets.unwrap_or_default();
            let is_reply = refs.iter().any(|r| r.kind == "replied_to");
            let is_quote = refs.iter().any(|r| r.kind == "quoted");
            Some(SourcePost {
                external_id: t.id,
                text: t.text,
                created_at_ms,
                author_id: t.author_id.clone(),
                author: SourceAuthor {
                    username: author.map(|u| u.username.clone()),
                    verified: author.and_then(|u| u.verified),
                    followers_count: author
                        .and_then(|u| u.public_metrics.as_ref())
                        .and_then(|m| m.followers_count),
                    created_at_ms: author
                        .and_then(|u| u.created_at.as_deref())
                        .and_then(parse_ms),
                },
                metrics: t.public_metrics.map(|m| PostMetrics {
                    likes: m.like_count,
                    reposts: m.retweet_count,
                    replies: m.reply_count,
                    quotes: m.quote_count,
                }),
                is_reply: Some(is_reply),
                is_quote: Some(is_quote),
            })
        })
        .collect();

    SearchPage {
        posts,
        meta: resp
            .meta
            .map(|m| SearchMeta {
                newest_id: m.newest_id,
                oldest_id: m.oldest_id,
                result_count: m.result_count.unwrap_or(0),
                next_token: m.next_token,
            })
            .unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Wire DTOs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
struct RulesMutation {
    #[serde(skip_serializing_if = "Option::is_none")]
    add: Option<Vec<NewSourceRule>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    delete: Option<RuleDelete>,
}

#[derive(Debug, Clone, Serialize)]
struct RuleDelete {
    ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RulesResponse {
    #[serde(default)]
    data: Option<Vec<SourceRule>>,
}

#[derive(Debug, Clone, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Option<Vec<ApiTweet>>,
    #[serde(default)]
    includes: Option<ApiIncludes>,
    #[serde(default)]
    meta: Option<ApiMeta>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiTweet {
    id: String,
    text: String,
    author_id: String,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    public_metrics: Option<ApiTweetMetrics>,
    #[serde(default)]
    referenced_tweets: Option<Vec<ApiReference>>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiReference {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiTweetMetrics {
    #[serde(default)]
    like_count: Option<i64>,
    #[serde(default)]
    retweet_count: Option<i64>,
    #[serde(default)]
    reply_count: Option<i64>,
    #[serde(default)]
    quote_count: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiIncludes {
    #[serde(default)]
    users: Vec<ApiUser>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiUser {
    id: String,
    username: String,
    #[serde(default)]
    verified: Option<bool>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    public_metrics: Option<ApiUserMetrics>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiUserMetrics {
    #[serde(default)]
    followers_count: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiMeta {
    #[serde(default)]
    newest_id: Option<String>,
    #[serde(default)]
    oldest_id: Option<String>,
    #[serde(default)]
    result_count: Option<u32>,
    #[serde(default)]
    next_token: Option<String>,
}
