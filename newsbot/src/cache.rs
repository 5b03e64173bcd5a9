use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::storage;

/// Fallback TTL when the configuration does not set one (5 minutes)
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Aggregate counters reported by `/api/cache/stats`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub total_hits: i64,
    pub total_misses: i64,
    pub current_entries: i64,
    pub cache_size_bytes: i64,
    pub cache_size_mb: f64,
    pub hit_rate: f64,
    pub last_cleanup: Option<String>,
}

/// Key/value cache with per-entry expiry, persisted in `cache_entries`.
///
/// Values are stored as JSON text. Expired entries are removed lazily by `get`
/// and in bulk by `cleanup_expired` (see [`run_sweeper`]). There is no size-based
/// eviction.
#[derive(Clone)]
pub struct CacheManager {
    pool: SqlitePool,
    default_ttl: Duration,
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

impl CacheManager {
    pub fn new(pool: SqlitePool, default_ttl: Duration) -> Self {
        Self { pool, default_ttl }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Build `"<prefix>:<sha256 hex>"` from the key parts. The prefix stays readable
    /// so whole families of keys can be dropped with [`CacheManager::invalidate_prefix`].
    pub fn key(prefix: &str, parts: &[&str]) -> String {
        let mut hasher = Sha256::new();
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                hasher.update([0x1f]);
            }
            hasher.update(part.as_bytes());
        }
        format!("{}:{:x}", prefix, hasher.finalize())
    }

    /// Fetch a live entry. Expired entries are deleted on the spot and count as a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let now = now_millis();
        let row: Option<(String, Option<i64>)> =
            sqlx::query_as("SELECT value, expires_at FROM cache_entries WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .context("failed to read cache entry")?;

        let value = match row {
            Some((_, Some(expires_at))) if expires_at <= now => {
                debug!(key, "cache entry expired");
                self.delete(key).await?;
                None
            }
            Some((value, _)) => Some(value),
            None => None,
        };

        let Some(value) = value else {
            self.record_miss().await?;
            return Ok(None);
        };

        match serde_json::from_str::<T>(&value) {
            Ok(parsed) => {
                sqlx::query(
                    "UPDATE cache_entries SET access_count = access_count + 1, last_accessed = ? WHERE key = ?",
                )
                .bind(now)
                .bind(key)
                .execute(&self.pool)
                .await
                .context("failed to update cache access stats")?;
                sqlx::query("UPDATE cache_stats SET total_hits = total_hits + 1 WHERE id = 1")
                    .execute(&self.pool)
                    .await
                    .context("failed to update cache hit count")?;
                Ok(Some(parsed))
            }
            Err(e) => {
                warn!(key, error = %e, "cache entry does not match requested type, dropping it");
                self.delete(key).await?;
                self.record_miss().await?;
                Ok(None)
            }
        }
    }

    async fn record_miss(&self) -> Result<()> {
        sqlx::query("UPDATE cache_stats SET total_misses = total_misses + 1 WHERE id = 1")
            .execute(&self.pool)
            .await
            .context("failed to update cache miss count")?;
        Ok(())
    }

    /// Insert or overwrite `key`. `None` uses the default TTL; a zero TTL, or one
    /// too large to represent as an expiry time, never expires.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let now = now_millis();
        let expires_at = if ttl.is_zero() {
            None
        } else {
            i64::try_from(ttl.as_millis())
                .ok()
                .and_then(|ms| now.checked_add(ms))
        };
        let json = serde_json::to_string(value).context("failed to serialize cache value")?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO cache_entries
                (key, value, created_at, expires_at, access_count, last_accessed)
            VALUES (?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(key)
        .bind(&json)
        .bind(now)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("failed to write cache entry")?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM cache_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .context("failed to delete cache entry")?;
        Ok(res.rows_affected() > 0)
    }

    /// Drop every entry. Hit/miss counters are kept.
    pub async fn clear(&self) -> Result<u64> {
        let res = sqlx::query("DELETE FROM cache_entries")
            .execute(&self.pool)
            .await
            .context("failed to clear cache")?;
        info!(removed = res.rows_affected(), "cache cleared");
        Ok(res.rows_affected())
    }

    /// Delete all entries whose key starts with `prefix`.
    pub async fn invalidate_prefix(&self, prefix: &str) -> Result<u64> {
        let pattern = format!("{}%", storage::like_escape(prefix));
        let res = sqlx::query("DELETE FROM cache_entries WHERE key LIKE ? ESCAPE '\\'")
            .bind(&pattern)
            .execute(&self.pool)
            .await
            .context("failed to invalidate cache prefix")?;
        Ok(res.rows_affected())
    }

    /// Delete all expired entries and record the cleanup time.
    ///
    /// Returns the number of entries removed.
    pub async fn cleanup_expired(&self) -> Result<u64> {
        let res = sqlx::query(
            "DELETE FROM cache_entries WHERE expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(now_millis())
        .execute(&self.pool)
        .await
        .context("failed to delete expired cache entries")?;

        sqlx::query("UPDATE cache_stats SET last_cleanup = ? WHERE id = 1")
            .bind(common::now_timestamp())
            .execute(&self.pool)
            .await
            .context("failed to record cache cleanup")?;

        Ok(res.rows_affected())
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        let (hits, misses, last_cleanup): (i64, i64, Option<String>) = sqlx::query_as(
            "SELECT total_hits, total_misses, last_cleanup FROM cache_stats WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("failed to read cache stats")?
        .unwrap_or((0, 0, None));

        let (entries, size): (i64, Option<i64>) =
            sqlx::query_as("SELECT COUNT(*), SUM(LENGTH(value)) FROM cache_entries")
                .fetch_one(&self.pool)
                .await
                .context("failed to measure cache size")?;
        let size = size.unwrap_or(0);

        let lookups = hits + misses;
        let hit_rate = if lookups > 0 {
            hits as f64 / lookups as f64 * 100.0
        } else {
            0.0
        };

        Ok(CacheStats {
            total_hits: hits,
            total_misses: misses,
            current_entries: entries,
            cache_size_bytes: size,
            cache_size_mb: round2(size as f64 / (1024.0 * 1024.0)),
            hit_rate: round2(hit_rate),
            last_cleanup,
        })
    }

    /// Return the cached value for `key`, or run `producer`, store its output and return it.
    /// Producer errors are passed through and nothing is cached.
    pub async fn get_or_set_with<T, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        producer: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(hit) = self.get::<T>(key).await? {
            return Ok(hit);
        }
        let value = producer().await?;
        self.set(key, &value, ttl).await?;
        Ok(value)
    }
}

/// Per-kind TTLs used by [`NewsCache`].
#[derive(Debug, Clone, Copy)]
pub struct NewsCacheTtls {
    pub news: Duration,
    pub summary: Duration,
    pub sentiment: Duration,
    pub trending: Duration,
}

impl Default for NewsCacheTtls {
    fn default() -> Self {
        Self {
            news: Duration::from_secs(300),
            summary: Duration::from_secs(3600),
            sentiment: Duration::from_secs(3600),
            trending: Duration::from_secs(1800),
        }
    }
}

impl NewsCacheTtls {
    pub fn from_config(cfg: &common::CacheConfig) -> Self {
        let d = Self::default();
        let secs = |v: Option<u64>, fallback: Duration| v.map(Duration::from_secs).unwrap_or(fallback);
        Self {
            news: secs(cfg.news_ttl_seconds, d.news),
            summary: secs(cfg.summary_ttl_seconds, d.summary),
            sentiment: secs(cfg.sentiment_ttl_seconds, d.sentiment),
            trending: secs(cfg.trending_ttl_seconds, d.trending),
        }
    }
}

/// Typed cache facade for the news endpoints.
#[derive(Clone)]
pub struct NewsCache {
    cache: CacheManager,
    ttls: NewsCacheTtls,
}

impl NewsCache {
    pub fn new(cache: CacheManager, ttls: NewsCacheTtls) -> Self {
        Self { cache, ttls }
    }

    pub fn manager(&self) -> &CacheManager {
        &self.cache
    }

    fn news_key(category: &str, query: Option<&str>, country: &str) -> String {
        CacheManager::key(&format!("news:{}", category), &[query.unwrap_or(""), country])
    }

    pub async fn get_news<T: DeserializeOwned>(
        &self,
        category: &str,
        query: Option<&str>,
        country: &str,
    ) -> Result<Option<T>> {
        self.cache.get(&Self::news_key(category, query, country)).await
    }

    pub async fn set_news<T: Serialize>(
        &self,
        category: &str,
        query: Option<&str>,
        country: &str,
        data: &T,
    ) -> Result<()> {
        self.set_news_with_ttl(category, query, country, data, self.ttls.news)
            .await
    }

    /// Same as [`NewsCache::set_news`] with an explicit TTL (runtime override).
    pub async fn set_news_with_ttl<T: Serialize>(
        &self,
        category: &str,
        query: Option<&str>,
        country: &str,
        data: &T,
        ttl: Duration,
    ) -> Result<()> {
        self.cache
            .set(&Self::news_key(category, query, country), data, Some(ttl))
            .await
    }

    pub async fn get_summary(&self, content_hash: &str, language: &str) -> Result<Option<String>> {
        self.cache
            .get(&CacheManager::key("summary", &[content_hash, language]))
            .await
    }

    pub async fn set_summary(&self, content_hash: &str, language: &str, summary: &str) -> Result<()> {
        self.cache
            .set(
                &CacheManager::key("summary", &[content_hash, language]),
                summary,
                Some(self.ttls.summary),
            )
            .await
    }

    pub async fn get_sentiment(&self, content_hash: &str) -> Result<Option<String>> {
        self.cache
            .get(&CacheManager::key("sentiment", &[content_hash]))
            .await
    }

    pub async fn set_sentiment(&self, content_hash: &str, sentiment: &str) -> Result<()> {
        self.cache
            .set(
                &CacheManager::key("sentiment", &[content_hash]),
                sentiment,
                Some(self.ttls.sentiment),
            )
            .await
    }

    pub async fn get_trending<T: DeserializeOwned>(&self, days: i64) -> Result<Option<T>> {
        self.cache
            .get(&CacheManager::key("trending", &[&days.to_string()]))
            .await
    }

    pub async fn set_trending<T: Serialize>(&self, days: i64, topics: &T) -> Result<()> {
        self.cache
            .set(
                &CacheManager::key("trending", &[&days.to_string()]),
                topics,
                Some(self.ttls.trending),
            )
            .await
    }

    /// Drop the category's cached news and every trending entry.
    pub async fn invalidate_category(&self, category: &str) -> Result<u64> {
        let news = self
            .cache
            .invalidate_prefix(&format!("news:{}:", category))
            .await?;
        let trending = self.cache.invalidate_prefix("trending:").await?;
        Ok(news + trending)
    }
}

/// Sha256 hex of request content, used to key summary/sentiment entries.
pub fn content_hash(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

/// Periodically purge expired entries until `shutdown_notify` fires.
pub async fn run_sweeper(cache: CacheManager, every: Duration, shutdown_notify: Arc<Notify>) {
    info!(interval_secs = every.as_secs(), "cache sweeper: starting");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(every) => {
                match cache.cleanup_expired().await {
                    Ok(0) => debug!("cache sweeper: nothing expired"),
                    Ok(n) => info!(removed = n, "cache sweeper: purged expired entries"),
                    Err(e) => error!(error = %e, "cache sweeper: cleanup failed"),
                }
            }
            _ = shutdown_notify.notified() => {
                info!("cache sweeper: shutdown requested, exiting loop");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_keeps_prefix_and_separates_parts() {
        let k = CacheManager::key("news:sports", &["", "us"]);
        assert!(k.starts_with("news:sports:"));
        assert_eq!(k.len(), "news:sports:".len() + 64);
        assert_ne!(
            CacheManager::key("p", &["ab", "c"]),
            CacheManager::key("p", &["a", "bc"])
        );
    }
}
