//! Per-user preferences and reading history.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;

/// Bucket used for preferences stored without a category.
pub const DEFAULT_GROUP: &str = "default";

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ReadingEntry {
    pub article_id: String,
    pub article_title: Option<String>,
    pub category: Option<String>,
    pub read_at: String,
    pub reading_time: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadingStats {
    pub total_articles: i64,
    pub category_stats: BTreeMap<String, i64>,
    pub total_reading_time: i64,
    pub avg_reading_time: f64,
}

/// Store or overwrite one preference. `value` is kept as JSON.
pub async fn set_preference(
    pool: &SqlitePool,
    user_id: i64,
    category: Option<&str>,
    preference_type: &str,
    value: &Value,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO user_preferences (user_id, category, preference_type, preference_value, updated_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(user_id, category, preference_type) DO UPDATE SET
            preference_value = excluded.preference_value,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(user_id)
    .bind(category.unwrap_or(""))
    .bind(preference_type)
    .bind(value.to_string())
    .bind(common::now_timestamp())
    .execute(pool)
    .await
    .context("failed to store preference")?;
    Ok(())
}

/// A category-specific value wins over an uncategorized one.
pub async fn get_preference(
    pool: &SqlitePool,
    user_id: i64,
    preference_type: &str,
    category: Option<&str>,
) -> Result<Option<Value>> {
    let raw: Option<String> = sqlx::query_scalar(
        r#"
        SELECT preference_value FROM user_preferences
        WHERE user_id = ? AND preference_type = ? AND category IN (?, '')
        ORDER BY category DESC
        LIMIT 1
        "#,
    )
    .bind(user_id)
    .bind(preference_type)
    .bind(category.unwrap_or(""))
    .fetch_optional(pool)
    .await
    .context("failed to read preference")?;

    raw.map(|s| serde_json::from_str(&s).context("stored preference is not valid JSON"))
        .transpose()
}

/// `{category: {preference_type: value}}`; uncategorized entries under `"default"`.
pub async fn get_all_preferences(
    pool: &SqlitePool,
    user_id: i64,
) -> Result<BTreeMap<String, BTreeMap<String, Value>>> {
    let rows: Vec<(String, String, String)> = sqlx::query_as(
        "SELECT category, preference_type, preference_value FROM user_preferences WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .context("failed to list preferences")?;

    let mut out: BTreeMap<String, BTreeMap<String, Value>> = BTreeMap::new();
    for (category, ptype, raw) in rows {
        let group = if category.is_empty() {
            DEFAULT_GROUP.to_string()
        } else {
            category
        };
        let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
        out.entry(group).or_default().insert(ptype, value);
    }
    Ok(out)
}

pub async fn track_reading(
    pool: &SqlitePool,
    user_id: i64,
    article_id: &str,
    article_title: Option<&str>,
    category: Option<&str>,
    reading_time: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO reading_history (user_id, article_id, article_title, category, read_at, reading_time)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(user_id)
    .bind(article_id)
    .bind(article_title)
    .bind(category)
    .bind(common::now_timestamp())
    .bind(reading_time.max(0))
    .execute(pool)
    .await
    .context("failed to track reading")?;
    Ok(())
}

/// Most recent first.
pub async fn reading_history(pool: &SqlitePool, user_id: i64, limit: i64) -> Result<Vec<ReadingEntry>> {
    sqlx::query_as::<_, ReadingEntry>(
        r#"
        SELECT article_id, article_title, category, read_at, reading_time
        FROM reading_history
        WHERE user_id = ?
        ORDER BY read_at DESC, id DESC
        LIMIT ?
        "#,
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to fetch reading history")
}

pub async fn reading_stats(pool: &SqlitePool, user_id: i64, days: i64) -> Result<ReadingStats> {
    let cutoff = common::days_ago_timestamp(days);

    let rows: Vec<(Option<String>, i64, i64)> = sqlx::query_as(
        r#"
        SELECT category, COUNT(*), COALESCE(SUM(reading_time), 0)
        FROM reading_history
        WHERE user_id = ? AND read_at >= ?
        GROUP BY category
        "#,
    )
    .bind(user_id)
    .bind(&cutoff)
    .fetch_all(pool)
    .await
    .context("failed to compute reading stats")?;

    let mut stats = ReadingStats::default();
    for (category, count, time) in rows {
        stats.total_articles += count;
        stats.total_reading_time += time;
        stats
            .category_stats
            .insert(category.unwrap_or_else(|| "uncategorized".to_string()), count);
    }
    if stats.total_articles > 0 {
        stats.avg_reading_time = stats.total_reading_time as f64 / stats.total_articles as f64;
    }
    Ok(stats)
}
