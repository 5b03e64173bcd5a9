use std::time::Duration;

use anyhow::Context;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::analytics::extract_keywords;
use crate::storage::Article;

pub const DEFAULT_API_URL: &str = "https://newsapi.org/v2/";
const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum NewsError {
    #[error("News API key not configured")]
    NotConfigured,
    #[error("news API rejected the request ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("news API unavailable: {0}")]
    Upstream(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Parameters for one headlines/search call.
#[derive(Debug, Clone)]
pub struct NewsRequest {
    pub category: String,
    /// Free-text query; switches the call from top headlines to `/everything`
    pub query: Option<String>,
    pub country: String,
    pub page_size: u32,
}

/// Normalized response returned to clients and cached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsFeed {
    pub status: String,
    pub total_results: u64,
    pub articles: Vec<Article>,
}

// NewsAPI wire format
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewsApiResponse {
    status: String,
    total_results: Option<u64>,
    #[serde(default)]
    articles: Vec<RawArticle>,
    code: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawArticle {
    #[serde(default)]
    pub source: Option<RawSource>,
    pub author: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub url_to_image: Option<String>,
    pub published_at: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSource {
    pub id: Option<String>,
    pub name: Option<String>,
}

/// Client for a NewsAPI-compatible service.
pub struct NewsClient {
    base_url: Url,
    api_key: Option<String>,
    client: Client,
    backoff: Duration,
}

impl NewsClient {
    pub fn new(base_url: &str, api_key: Option<String>, timeout_secs: u64) -> anyhow::Result<Self> {
        let mut base_url =
            Url::parse(base_url).with_context(|| format!("invalid news API url: {}", base_url))?;
        // Url::join drops the last path segment unless the base ends with '/'
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(concat!("newsbot/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build reqwest client")?;

        Ok(Self {
            base_url,
            api_key: api_key.filter(|k| !k.is_empty()),
            client,
            backoff: Duration::from_secs(1),
        })
    }

    pub fn from_config(cfg: &common::NewsConfig) -> anyhow::Result<Self> {
        let api_key = common::Config::secret_from_env(
            Some(cfg.api_key_env.as_deref().unwrap_or("NEWS_API_KEY")),
        );
        if api_key.is_none() {
            warn!("news API key not set; /api/news will answer 503");
        }
        Self::new(
            cfg.api_url.as_deref().unwrap_or(DEFAULT_API_URL),
            api_key,
            cfg.timeout_seconds.unwrap_or(10),
        )
    }

    /// Base delay between retries; doubles on each further attempt.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    /// Fetch and normalize articles. 5xx, 429 and network errors are retried
    /// up to three attempts; other 4xx answers fail at once.
    pub async fn fetch(&self, req: &NewsRequest) -> Result<NewsFeed, NewsError> {
        let api_key = self.api_key.as_deref().ok_or(NewsError::NotConfigured)?;

        let (endpoint, params): (&str, Vec<(&str, String)>) = match req.query.as_deref() {
            Some(q) if !q.trim().is_empty() => (
                "everything",
                vec![("q", q.to_string()), ("pageSize", req.page_size.to_string())],
            ),
            _ => (
                "top-headlines",
                vec![
                    ("country", req.country.clone()),
                    ("category", req.category.clone()),
                    ("pageSize", req.page_size.to_string()),
                ],
            ),
        };
        let url = self
            .base_url
            .join(endpoint)
            .context("failed to build news API url")?;

        let mut last_error = None;

        for attempt in 1..=MAX_ATTEMPTS {
            if attempt > 1 {
                let backoff = self.backoff * 2u32.pow(attempt - 2); // 1s, 2s
                info!(
                    "Retrying news fetch for {} (attempt {}/{}) after {:?}...",
                    url, attempt, MAX_ATTEMPTS, backoff
                );
                tokio::time::sleep(backoff).await;
            }

            let sent = self
                .client
                .get(url.clone())
                .header("X-Api-Key", api_key)
                .query(&params)
                .send()
                .await;

            match sent {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let body: NewsApiResponse = response
                            .json()
                            .await
                            .map_err(|e| NewsError::Upstream(format!("invalid response body: {}", e)))?;
                        return self.into_feed(body, &req.category);
                    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                        warn!(%status, attempt, "news API answered with a retryable status");
                        last_error = Some(NewsError::Upstream(format!("status {}", status)));
                        continue;
                    } else {
                        let message = response
                            .json::<NewsApiResponse>()
                            .await
                            .ok()
                            .and_then(|b| b.message)
                            .unwrap_or_else(|| status.to_string());
                        return Err(NewsError::Api {
                            status: status.as_u16(),
                            message,
                        });
                    }
                }
                Err(e) => {
                    warn!(error = %e, attempt, "news API request failed");
                    last_error = Some(NewsError::Upstream(format!("network error: {}", e)));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| NewsError::Upstream("unknown error after retries".into())))
    }

    fn into_feed(&self, body: NewsApiResponse, category: &str) -> Result<NewsFeed, NewsError> {
        if body.status != "ok" {
            return Err(NewsError::Api {
                status: 200,
                message: body
                    .message
                    .or(body.code)
                    .unwrap_or_else(|| "unknown error".to_string()),
            });
        }
        let raw_count = body.articles.len();
        let articles: Vec<Article> = body
            .articles
            .into_iter()
            .filter_map(|raw| normalize(raw, category))
            .collect();
        debug!(raw = raw_count, kept = articles.len(), "normalized news articles");

        Ok(NewsFeed {
            status: "ok".to_string(),
            total_results: body.total_results.unwrap_or(articles.len() as u64),
            articles,
        })
    }
}

/// Stable article id: the first 16 hex chars of sha256(url).
pub fn article_id_for_url(url: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(url.as_bytes()));
    digest[..16].to_string()
}

/// Strip markup from API text fields and collapse whitespace.
fn clean_text(s: &str) -> String {
    let text = if s.contains('<') {
        html2text::from_read(s.as_bytes(), 10_000).unwrap_or_else(|_| s.to_string())
    } else {
        s.to_string()
    };
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Convert a NewsAPI article into an [`Article`]. Entries without a URL or
/// title, and NewsAPI's "[Removed]" placeholders, are dropped.
pub fn normalize(raw: RawArticle, category: &str) -> Option<Article> {
    let url = raw.url.filter(|u| !u.trim().is_empty())?;
    let title = raw
        .title
        .map(|t| clean_text(&t))
        .filter(|t| !t.is_empty() && t != "[Removed]")?;
    let description = raw.description.as_deref().map(clean_text).unwrap_or_default();

    let word_count = description.split_whitespace().count() as i64;
    let keywords = extract_keywords(&format!("{} {}", title, description), 10);

    Some(Article {
        article_id: article_id_for_url(&url),
        title,
        url: Some(url),
        source: raw.source.and_then(|s| s.name),
        author: raw.author.filter(|a| !a.is_empty()),
        content: description,
        url_to_image: raw.url_to_image,
        published_at: raw.published_at,
        category: Some(category.to_string()),
        word_count,
        keywords,
        is_active: true,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn article_ids_are_stable_and_short() {
        let a = article_id_for_url("https://example.com/story");
        assert_eq!(a.len(), 16);
        assert_eq!(a, article_id_for_url("https://example.com/story"));
        assert_ne!(a, article_id_for_url("https://example.com/other"));
    }

    #[test]
    fn normalize_drops_removed_and_counts_words() {
        let removed = RawArticle {
            title: Some("[Removed]".into()),
            url: Some("https://removed.com".into()),
            ..Default::default()
        };
        assert!(normalize(removed, "general").is_none());

        let raw = RawArticle {
            source: Some(RawSource { id: None, name: Some("Wire".into()) }),
            title: Some("Solar power breakthrough".into()),
            description: Some("Researchers   unveil cheaper <b>solar</b> panels".into()),
            url: Some("https://example.com/solar".into()),
            published_at: Some("2026-03-01T08:00:00Z".into()),
            ..Default::default()
        };
        let article = normalize(raw, "science").unwrap();
        assert_eq!(article.source.as_deref(), Some("Wire"));
        assert_eq!(article.category.as_deref(), Some("science"));
        assert_eq!(article.word_count, 5);
        assert!(!article.content.contains('<'));
        assert!(article.keywords.contains(&"solar".to_string()));
    }
}
