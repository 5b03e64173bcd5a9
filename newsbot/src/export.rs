//! Data export (JSON, CSV, XML), backups and computed reports.

use std::io::Cursor;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::SqlitePool;

use crate::analytics::{self, CategoryStats, SentimentCounts};
use crate::auth::{self, preferences};
use crate::cache::CacheManager;
use crate::search;
use crate::security::RateLimiter;
use crate::storage::{self, Article, ArticleQuery};

const BACKUP_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
    Xml,
}

impl ExportFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Some(ExportFormat::Json),
            "csv" => Some(ExportFormat::Csv),
            "xml" => Some(ExportFormat::Xml),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
            ExportFormat::Xml => "xml",
        }
    }
}

/// A rendered export ready to be sent as an attachment.
#[derive(Debug, Clone)]
pub struct ExportFile {
    pub filename: String,
    pub format: ExportFormat,
    pub body: Vec<u8>,
}

fn export_date() -> String {
    Utc::now().to_rfc3339()
}

fn today_compact() -> String {
    Utc::now().format("%Y%m%d").to_string()
}

pub async fn export_user_data(pool: &SqlitePool, user_id: i64, format: ExportFormat) -> Result<ExportFile> {
    let prefs = preferences::get_all_preferences(pool, user_id).await?;
    let history = preferences::reading_history(pool, user_id, 1000).await?;
    let stats = preferences::reading_stats(pool, user_id, 365).await?;

    let body = match format {
        ExportFormat::Csv => {
            let mut wtr = csv::Writer::from_writer(Vec::new());
            wtr.write_record(["Article ID", "Title", "Category", "Read At", "Reading Time"])?;
            for entry in &history {
                wtr.write_record([
                    entry.article_id.as_str(),
                    entry.article_title.as_deref().unwrap_or(""),
                    entry.category.as_deref().unwrap_or(""),
                    entry.read_at.as_str(),
                    &entry.reading_time.to_string(),
                ])?;
            }
            finish_csv(wtr)?
        }
        _ => {
            let data = json!({
                "user_id": user_id,
                "export_date": export_date(),
                "preferences": prefs,
                "reading_history": history,
                "reading_stats": stats,
            });
            render_structured(&data, format, "user_data")?
        }
    };

    Ok(ExportFile {
        filename: format!("user_data_{}_{}.{}", user_id, today_compact(), format.extension()),
        format,
        body,
    })
}

/// Everything the analytics dashboards show for the last `days` days.
pub async fn analytics_snapshot(pool: &SqlitePool, days: i64) -> Result<Value> {
    Ok(json!({
        "export_date": export_date(),
        "period_days": days,
        "sentiment_trends": analytics::sentiment_trends(pool, days).await?,
        "category_analytics": analytics::category_analytics(pool).await?,
        "trending_topics": analytics::trending_topics(pool, days).await?,
        "search_analytics": search::search_analytics(pool, days).await?,
    }))
}

pub async fn export_analytics(pool: &SqlitePool, days: i64, format: ExportFormat) -> Result<ExportFile> {
    let body = match format {
        ExportFormat::Csv => sentiment_csv(&analytics::sentiment_trends(pool, days).await?)?,
        _ => render_structured(&analytics_snapshot(pool, days).await?, format, "analytics_data")?,
    };
    Ok(ExportFile {
        filename: format!("analytics_{}days_{}.{}", days, today_compact(), format.extension()),
        format,
        body,
    })
}

fn sentiment_csv(trends: &std::collections::BTreeMap<String, SentimentCounts>) -> Result<Vec<u8>> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    wtr.write_record(["Date", "Positive", "Negative", "Neutral"])?;
    for (day, counts) in trends {
        wtr.write_record([
            day.clone(),
            counts.positive.to_string(),
            counts.negative.to_string(),
            counts.neutral.to_string(),
        ])?;
    }
    finish_csv(wtr)
}

/// Articles matching the filters, newest first (up to 10 000).
pub async fn export_articles(
    pool: &SqlitePool,
    category: Option<String>,
    date_from: Option<String>,
    date_to: Option<String>,
    format: ExportFormat,
) -> Result<ExportFile> {
    let query = ArticleQuery {
        category: category.clone(),
        date_from: date_from.clone(),
        date_to: date_to.clone(),
        include_inactive: false,
        limit: 10_000,
        offset: 0,
    };
    let articles = storage::list_articles(pool, &query).await?;

    let body = match format {
        ExportFormat::Csv => articles_csv(&articles)?,
        _ => {
            let data = json!({
                "export_date": export_date(),
                "filters": {
                    "category": category,
                    "date_from": date_from,
                    "date_to": date_to,
                },
                "articles": articles,
            });
            render_structured(&data, format, "articles_data")?
        }
    };
    Ok(ExportFile {
        filename: format!("articles_{}.{}", today_compact(), format.extension()),
        format,
        body,
    })
}

fn articles_csv(articles: &[Article]) -> Result<Vec<u8>> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    wtr.write_record(["ID", "Title", "Category", "Source", "Published At", "Sentiment", "Reliability"])?;
    for a in articles {
        wtr.write_record([
            a.article_id.clone(),
            a.title.clone(),
            a.category.clone().unwrap_or_default(),
            a.source.clone().unwrap_or_default(),
            a.published_at.clone().unwrap_or_default(),
            a.sentiment.clone().unwrap_or_default(),
            a.reliability_score.map(|s| s.to_string()).unwrap_or_default(),
        ])?;
    }
    finish_csv(wtr)
}

/// Full backup as one JSON bundle of named files:
/// `backup.json`, `analytics.csv`, `analytics.xml` and `metadata.json`.
/// User accounts are included only on request and never with password hashes.
pub async fn create_backup(pool: &SqlitePool, cache: &CacheManager, include_users: bool) -> Result<ExportFile> {
    let analytics_data = analytics_snapshot(pool, 365).await?;
    let articles = storage::list_articles(
        pool,
        &ArticleQuery {
            include_inactive: true,
            limit: i64::MAX,
            ..Default::default()
        },
    )
    .await?;

    let mut backup = json!({
        "backup_date": export_date(),
        "version": BACKUP_VERSION,
        "analytics": analytics_data,
        "search_index": articles,
        "cache_stats": cache.stats().await?,
    });
    if include_users {
        backup["users"] = serde_json::to_value(auth::list_users(pool, i64::MAX, 0).await?)?;
    }

    let trends = analytics::sentiment_trends(pool, 365).await?;
    let files = json!({
        "backup.json": backup,
        "analytics.csv": String::from_utf8(sentiment_csv(&trends)?)?,
        "analytics.xml": String::from_utf8(to_xml(&analytics_data, "analytics")?)?,
        "metadata.json": {
            "created_by": "newsbot",
            "export_date": export_date(),
            "file_count": 3,
            "formats": ["json", "csv", "xml"],
        },
    });

    Ok(ExportFile {
        filename: format!("backup_{}.json", Utc::now().format("%Y%m%d_%H%M%S")),
        format: ExportFormat::Json,
        body: serde_json::to_vec_pretty(&json!({ "files": files }))?,
    })
}

fn render_structured(data: &Value, format: ExportFormat, root: &str) -> Result<Vec<u8>> {
    match format {
        ExportFormat::Xml => to_xml(data, root),
        _ => serde_json::to_vec_pretty(data).context("failed to render JSON export"),
    }
}

fn finish_csv(wtr: csv::Writer<Vec<u8>>) -> Result<Vec<u8>> {
    wtr.into_inner()
        .map_err(|e| anyhow!("failed to flush CSV export: {}", e))
}

/// XML element names must start with a letter or underscore and contain only
/// name characters; map keys like dates are adjusted to fit.
fn xml_name(key: &str) -> String {
    let mut name: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if !name
        .chars()
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false)
    {
        name.insert(0, '_');
    }
    name
}

fn write_value<W: std::io::Write>(writer: &mut Writer<W>, name: &str, value: &Value) -> Result<()> {
    let tag = xml_name(name);
    match value {
        Value::Null => {
            writer.write_event(Event::Empty(BytesStart::new(tag.as_str())))?;
        }
        Value::Object(map) => {
            writer.write_event(Event::Start(BytesStart::new(tag.as_str())))?;
            for (k, v) in map {
                write_value(writer, k, v)?;
            }
            writer.write_event(Event::End(BytesEnd::new(tag.as_str())))?;
        }
        Value::Array(items) => {
            writer.write_event(Event::Start(BytesStart::new(tag.as_str())))?;
            for item in items {
                write_value(writer, "item", item)?;
            }
            writer.write_event(Event::End(BytesEnd::new(tag.as_str())))?;
        }
        scalar => {
            let text = match scalar {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            writer.write_event(Event::Start(BytesStart::new(tag.as_str())))?;
            writer.write_event(Event::Text(BytesText::new(&text)))?;
            writer.write_event(Event::End(BytesEnd::new(tag.as_str())))?;
        }
    }
    Ok(())
}

/// Objects become nested elements, arrays become `<item>` children.
pub fn to_xml(data: &Value, root: &str) -> Result<Vec<u8>> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    write_value(&mut writer, root, data)?;
    Ok(writer.into_inner().into_inner())
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
    pub total_searches: i64,
    pub top_category: Option<String>,
    pub total_categories: usize,
    pub avg_daily_searches: f64,
}

fn top_category(categories: &std::collections::BTreeMap<String, CategoryStats>) -> Option<(&String, &CategoryStats)> {
    categories.iter().max_by_key(|(_, s)| s.total_articles)
}

/// Searches, categories and sentiment over the last `days` days, with
/// plain-language insights.
pub async fn usage_report(pool: &SqlitePool, days: i64) -> Result<Value> {
    let days = days.max(1);
    let sentiment_trends = analytics::sentiment_trends(pool, days).await?;
    let categories = analytics::category_analytics(pool).await?;
    let searches = search::search_analytics(pool, days).await?;

    let summary = UsageSummary {
        total_searches: searches.total_searches,
        top_category: top_category(&categories).map(|(name, _)| name.clone()),
        total_categories: categories.len(),
        avg_daily_searches: analytics::round2(searches.total_searches as f64 / days as f64),
    };

    let mut insights = Vec::new();
    let recent: Vec<&SentimentCounts> = sentiment_trends.values().rev().take(7).collect();
    if !recent.is_empty() {
        let positive: i64 = recent.iter().map(|s| s.positive).sum();
        let negative: i64 = recent.iter().map(|s| s.negative).sum();
        if positive > negative {
            insights.push("News sentiment has been predominantly positive recently".to_string());
        } else if negative > positive {
            insights.push("News sentiment has been predominantly negative recently".to_string());
        }
    }
    if let Some((name, stats)) = top_category(&categories) {
        insights.push(format!(
            "Most popular category: {} with {} articles",
            name, stats.total_articles
        ));
    }
    if let Some(top) = searches.top_queries.first() {
        insights.push(format!(
            "Most searched topic: '{}' with {} searches",
            top.query, top.count
        ));
    }

    Ok(json!({
        "report_type": "usage_report",
        "period_days": days,
        "generated_at": export_date(),
        "summary": summary,
        "detailed_analytics": {
            "sentiment_trends": sentiment_trends,
            "category_analytics": categories,
            "search_analytics": searches,
        },
        "insights": insights,
    }))
}

/// Cache efficiency, request volume and blocking, measured from stored counters.
pub async fn performance_report(
    pool: &SqlitePool,
    cache: &CacheManager,
    limiter: &RateLimiter,
    uptime_seconds: i64,
) -> Result<Value> {
    let cache_stats = cache.stats().await?;
    let limits = limiter.stats().await?;
    let indexed = storage::count_articles(pool, &ArticleQuery::default()).await?;

    let mut recommendations = Vec::new();
    if cache_stats.total_hits + cache_stats.total_misses > 0 && cache_stats.hit_rate < 50.0 {
        recommendations.push("Cache hit rate is below 50%; consider longer cache TTLs".to_string());
    }
    if limits.active_blocks > 0 {
        recommendations.push(format!(
            "{} client(s) currently blocked by rate limiting; review security events",
            limits.active_blocks
        ));
    }
    if cache_stats.last_cleanup.is_none() {
        recommendations.push("Expired cache entries have never been swept".to_string());
    }

    Ok(json!({
        "report_type": "performance_report",
        "generated_at": export_date(),
        "metrics": {
            "cache_hit_rate": cache_stats.hit_rate,
            "cache_entries": cache_stats.current_entries,
            "cache_size_mb": cache_stats.cache_size_mb,
            "total_requests": limits.total_requests,
            "active_blocks": limits.active_blocks,
            "security_events_24h": limits.recent_events,
            "indexed_articles": indexed,
            "uptime_seconds": uptime_seconds,
        },
        "recommendations": recommendations,
    }))
}

/// Active and new users, reading volume and the busiest categories.
pub async fn engagement_report(pool: &SqlitePool, days: i64) -> Result<Value> {
    let days = days.max(1);
    let cutoff = common::days_ago_timestamp(days);

    let active_users: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(DISTINCT user_id) FROM (
            SELECT user_id FROM user_interactions WHERE recorded_at >= ?1 AND user_id IS NOT NULL
            UNION
            SELECT user_id FROM reading_history WHERE read_at >= ?1
        )
        "#,
    )
    .bind(&cutoff)
    .fetch_one(pool)
    .await
    .context("failed to count active users")?;

    let new_users: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE created_at >= ?")
        .bind(&cutoff)
        .fetch_one(pool)
        .await
        .context("failed to count new users")?;

    let (articles_read, avg_reading_time): (i64, Option<f64>) = sqlx::query_as(
        "SELECT COUNT(*), AVG(reading_time) FROM reading_history WHERE read_at >= ?",
    )
    .bind(&cutoff)
    .fetch_one(pool)
    .await
    .context("failed to summarize reading")?;

    let summary_requests: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM user_interactions WHERE action = 'summarize' AND recorded_at >= ?",
    )
    .bind(&cutoff)
    .fetch_one(pool)
    .await
    .context("failed to count summary requests")?;

    let search_queries: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM search_history WHERE searched_at >= ?")
            .bind(&cutoff)
            .fetch_one(pool)
            .await
            .context("failed to count searches")?;

    let daily: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT substr(recorded_at, 1, 10) AS day, COUNT(DISTINCT user_id)
        FROM user_interactions
        WHERE recorded_at >= ? AND user_id IS NOT NULL
        GROUP BY day
        ORDER BY day
        "#,
    )
    .bind(common::days_ago_timestamp(7))
    .fetch_all(pool)
    .await
    .context("failed to compute daily active users")?;

    let popular: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT category FROM reading_history
        WHERE read_at >= ? AND category IS NOT NULL
        GROUP BY category
        ORDER BY COUNT(*) DESC
        LIMIT 3
        "#,
    )
    .bind(&cutoff)
    .fetch_all(pool)
    .await
    .context("failed to rank categories")?;

    let articles_per_user = if active_users > 0 {
        analytics::round2(articles_read as f64 / active_users as f64)
    } else {
        0.0
    };

    Ok(json!({
        "report_type": "user_engagement_report",
        "period_days": days,
        "generated_at": export_date(),
        "metrics": {
            "active_users": active_users,
            "new_users": new_users,
            "total_users": auth::count_users(pool).await?,
            "articles_read": articles_read,
            "avg_reading_time": analytics::round2(avg_reading_time.unwrap_or(0.0)),
            "articles_per_user": articles_per_user,
            "summary_requests": summary_requests,
            "search_queries": search_queries,
        },
        "engagement_trends": {
            "daily_active_users": daily.into_iter().collect::<std::collections::BTreeMap<_, _>>(),
            "popular_categories": popular.into_iter().map(|(c,)| c).collect::<Vec<_>>(),
        },
    }))
}
