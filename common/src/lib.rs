/*!
common/src/lib.rs

Shared configuration types and DB helper functions for newsbot.

This file provides:
- Config data structures (deserialized from TOML)
- An async loader that merges a default file with an override file
- Helpers to open an SQLite pool (file-backed or in-memory)
- The timestamp format shared by every table
*/

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Format used for every TEXT timestamp column. Lexicographic order matches time order.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Database configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the sqlite database file (e.g. "data/newsbot.db"), or ":memory:"
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/newsbot.db".to_string(),
        }
    }
}

/// HTTP server section (merged into Rocket's figment)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind: Option<String>,
    pub port: Option<u16>,
    /// Env var holding Rocket's `secret_key` (private cookies)
    pub secret_key_env: Option<String>,
}

/// External news API (NewsAPI-compatible)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewsConfig {
    pub api_url: Option<String>,
    pub api_key_env: Option<String>,
    pub default_country: Option<String>,
    pub page_size: Option<u32>,
    pub timeout_seconds: Option<u64>,
    /// How many fetched articles get written to the search index per request
    pub index_limit: Option<usize>,
}

/// Remote LLM config (used if `llm.adapter = "remote"`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteLlmConfig {
    pub api_url: Option<String>,
    pub api_key_env: Option<String>,
    pub model: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub max_tokens: Option<usize>,
}

/// LLM top-level config
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    pub adapter: Option<String>, // "remote", "none"
    pub remote: Option<RemoteLlmConfig>,
}

/// Cache TTLs and sweeper cadence, all in seconds
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    pub default_ttl_seconds: Option<u64>,
    pub news_ttl_seconds: Option<u64>,
    pub summary_ttl_seconds: Option<u64>,
    pub sentiment_ttl_seconds: Option<u64>,
    pub trending_ttl_seconds: Option<u64>,
    pub sweep_interval_seconds: Option<u64>,
}

/// User authentication settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Env var holding the JWT signing secret
    pub jwt_secret_env: Option<String>,
    pub session_days: Option<i64>,
}

/// Admin / maintenance config
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdminConfig {
    pub username: Option<String>,
    /// Argon2 PHC string, produce one with the `hash_password` binary
    pub password_hash: Option<String>,
    pub auto_migrate: Option<bool>,
}

/// Top-level application configuration (deserialized from config.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    pub server: Option<ServerConfig>,
    pub news: Option<NewsConfig>,
    pub llm: Option<LlmConfig>,
    pub cache: Option<CacheConfig>,
    pub auth: Option<AuthConfig>,
    pub admin: Option<AdminConfig>,
}

impl Config {
    /// Load configuration from a TOML file asynchronously.
    ///
    /// Example:
    ///   let cfg = Config::from_file("config.toml").await?;
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let cfg: Config = toml::from_str(&data).context("Failed to parse TOML configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load configuration with an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence).
    pub async fn load_with_defaults(
        default_path: Option<&Path>,
        override_path: Option<&Path>,
    ) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        for path in [default_path, override_path].into_iter().flatten() {
            if !path.exists() {
                continue;
            }
            let data = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            let val: toml::Value = toml::from_str(&data)
                .with_context(|| format!("Failed to parse configuration: {}", path.display()))?;
            merge_toml(&mut config_value, val);
        }

        let cfg: Config = config_value
            .try_into()
            .context("Failed to parse merged configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject URLs that cannot be parsed so misconfiguration shows up at startup.
    pub fn validate(&self) -> Result<()> {
        let urls = [
            self.news.as_ref().and_then(|n| n.api_url.as_deref()),
            self.llm
                .as_ref()
                .and_then(|l| l.remote.as_ref())
                .and_then(|r| r.api_url.as_deref()),
        ];
        for url in urls.into_iter().flatten() {
            url::Url::parse(url).with_context(|| format!("Invalid URL in configuration: {}", url))?;
        }
        Ok(())
    }

    /// Read the secret named by `env_var`, if both the name and the variable are set.
    pub fn secret_from_env(env_var: Option<&str>) -> Option<String> {
        env_var
            .and_then(|name| std::env::var(name).ok())
            .filter(|v| !v.is_empty())
    }

    pub fn cache_section(&self) -> CacheConfig {
        self.cache.clone().unwrap_or_default()
    }
}

fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}

/// Initialize an SQLite connection pool.
///
/// Creates the parent directory if necessary and returns a configured `SqlitePool`.
/// `":memory:"` is routed to [`init_memory_pool`]. Schema creation is the caller's job.
///
/// Example:
///   let pool = init_db_pool("data/newsbot.db").await?;
pub async fn init_db_pool(path: &str) -> Result<SqlitePool> {
    if path == ":memory:" {
        return init_memory_pool().await;
    }

    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create DB parent directory: {}", parent.display())
            })?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to sqlite database at path: {}", path))?;

    Ok(pool)
}

/// Single-connection in-memory pool. Each SQLite connection to `:memory:` is its
/// own database, so the pool must never open a second one or drop the first.
pub async fn init_memory_pool() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .context("Failed to open in-memory sqlite database")?;
    Ok(pool)
}

pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.format(TIMESTAMP_FORMAT).to_string()
}

pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

/// Timestamp `days` days ago, for `WHERE col >= ?` window filters.
pub fn days_ago_timestamp(days: i64) -> String {
    format_timestamp(Utc::now() - chrono::Duration::days(days))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn config_from_string_and_db_pool() {
        let toml = r#"
            [database]
            path = "data/test.db"

            [news]
            api_url = "https://newsapi.org/v2/"
            api_key_env = "NEWS_API_KEY"
            page_size = 10

            [cache]
            default_ttl_seconds = 300
        "#;

        let cfg: Config = toml::from_str(toml).expect("parse config");
        assert_eq!(cfg.news.as_ref().and_then(|n| n.page_size), Some(10));
        assert_eq!(cfg.cache_section().default_ttl_seconds, Some(300));
        assert!(cfg.admin.is_none());
        cfg.validate().expect("valid urls");

        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("nested").join("newsbot.db");
        let pool = init_db_pool(&db_path.to_string_lossy()).await.expect("init pool");
        let conn = pool.acquire().await.expect("acquire conn");
        drop(conn);
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn override_file_wins_over_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let default_path = dir.path().join("config.default.toml");
        let override_path = dir.path().join("config.toml");
        std::fs::write(
            &default_path,
            "[database]\npath = \"a.db\"\n[cache]\nnews_ttl_seconds = 300\nsummary_ttl_seconds = 3600\n",
        )
        .unwrap();
        std::fs::write(&override_path, "[cache]\nnews_ttl_seconds = 60\n").unwrap();

        let cfg = Config::load_with_defaults(Some(&default_path), Some(&override_path))
            .await
            .expect("load");
        let cache = cfg.cache_section();
        assert_eq!(cfg.database.path, "a.db");
        assert_eq!(cache.news_ttl_seconds, Some(60));
        assert_eq!(cache.summary_ttl_seconds, Some(3600));
    }

    #[test]
    fn invalid_url_is_rejected() {
        let cfg: Config = toml::from_str("[news]\napi_url = \"not a url\"\n").unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn timestamps_sort_lexicographically() {
        let earlier = days_ago_timestamp(2);
        let later = now_timestamp();
        assert!(earlier < later);
        assert_eq!(later.len(), "2026-01-01T00:00:00Z".len());
    }

    #[tokio::test]
    async fn memory_pool_keeps_state_between_queries() {
        let pool = init_memory_pool().await.unwrap();
        sqlx::query("CREATE TABLE t (x INTEGER)").execute(&pool).await.unwrap();
        sqlx::query("INSERT INTO t (x) VALUES (1)").execute(&pool).await.unwrap();
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM t")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(n, 1);
    }
}
