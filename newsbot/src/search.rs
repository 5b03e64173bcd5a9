//! Full-text search over indexed articles, with filters, sorting and search
//! tracking.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::{debug, warn};

use crate::storage::{self, Article, ArticleRow, ARTICLE_COLUMNS};

pub const CATEGORIES: &[&str] = &[
    "general",
    "business",
    "technology",
    "entertainment",
    "health",
    "science",
    "sports",
];
pub const SENTIMENTS: &[&str] = &["Positive", "Negative", "Neutral"];
pub const LANGUAGES: &[&str] = &["English", "Hindi", "Spanish", "French", "German"];

/// Optional narrowing applied on top of the text match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_reliability: Option<i64>,
    /// `YYYY-MM-DD`, inclusive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_to: Option<String>,
}

impl SearchFilters {
    /// Drop every filter that is not one of the known values or is malformed.
    pub fn validate(self) -> Self {
        fn known(v: Option<String>, allowed: &[&str]) -> Option<String> {
            v.filter(|v| allowed.contains(&v.as_str()))
        }
        fn date(v: Option<String>) -> Option<String> {
            v.filter(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").is_ok())
        }

        SearchFilters {
            category: known(self.category, CATEGORIES),
            source: self
                .source
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty() && s.chars().count() <= 100),
            sentiment: known(self.sentiment, SENTIMENTS),
            language: known(self.language, LANGUAGES),
            min_reliability: self.min_reliability.filter(|r| (0..=100).contains(r)),
            date_from: date(self.date_from),
            date_to: date(self.date_to),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortBy {
    #[default]
    Relevance,
    Date,
    Reliability,
    /// Longest articles first
    Popularity,
}

impl SortBy {
    /// Unknown names fall back to relevance.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "date" => SortBy::Date,
            "reliability" => SortBy::Reliability,
            "popularity" => SortBy::Popularity,
            _ => SortBy::Relevance,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResults {
    pub articles: Vec<Article>,
    pub total_count: i64,
    pub limit: i64,
    pub offset: i64,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PopularSearch {
    pub query: String,
    #[sqlx(rename = "search_count")]
    pub count: i64,
    pub last_searched: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct QueryCount {
    pub query: String,
    pub count: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchAnalytics {
    pub total_searches: i64,
    pub top_queries: Vec<QueryCount>,
    /// Searches per `YYYY-MM-DD`
    pub search_trends: BTreeMap<String, i64>,
}

/// How the text part of a search is matched.
enum TextMatch {
    All,
    Fts(String),
    Like(String),
}

/// Quote each whitespace-separated term so user input is never parsed as
/// FTS5 syntax. Terms are ANDed.
pub fn fts_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|t| t.replace('"', ""))
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

/// Add or refresh an article in the index.
pub async fn index_article(pool: &SqlitePool, article: &Article) -> Result<()> {
    storage::upsert_article(pool, article).await
}

/// Search active articles. An empty query lists everything matching the filters.
pub async fn search(
    pool: &SqlitePool,
    query: &str,
    filters: &SearchFilters,
    sort: SortBy,
    limit: i64,
    offset: i64,
) -> Result<SearchResults> {
    let limit = limit.clamp(1, 100);
    let offset = offset.max(0);

    let Some(fts) = fts_query(query) else {
        return run_search(pool, &TextMatch::All, filters, sort, limit, offset).await;
    };

    match run_search(pool, &TextMatch::Fts(fts), filters, sort, limit, offset).await {
        Ok(results) => Ok(results),
        Err(e) => {
            warn!(error = %e, query = %query, "FTS5 search failed, falling back to LIKE");
            let pattern = format!("%{}%", storage::like_escape(query.trim()));
            run_search(pool, &TextMatch::Like(pattern), filters, sort, limit, offset).await
        }
    }
}

fn push_search_body(qb: &mut QueryBuilder<'_, Sqlite>, text: &TextMatch, filters: &SearchFilters) {
    match text {
        TextMatch::Fts(q) => {
            qb.push(" FROM articles a JOIN articles_fts ON a.id = articles_fts.rowid WHERE a.is_active = 1");
            qb.push(" AND articles_fts MATCH ").push_bind(q.clone());
        }
        TextMatch::Like(p) => {
            qb.push(" FROM articles a WHERE a.is_active = 1");
            qb.push(" AND (a.title LIKE ")
                .push_bind(p.clone())
                .push(" ESCAPE '\\' OR a.content LIKE ")
                .push_bind(p.clone())
                .push(" ESCAPE '\\')");
        }
        TextMatch::All => {
            qb.push(" FROM articles a WHERE a.is_active = 1");
        }
    }

    if let Some(v) = &filters.category {
        qb.push(" AND a.category = ").push_bind(v.clone());
    }
    if let Some(v) = &filters.source {
        qb.push(" AND a.source = ").push_bind(v.clone());
    }
    if let Some(v) = &filters.sentiment {
        qb.push(" AND a.sentiment = ").push_bind(v.clone());
    }
    if let Some(v) = &filters.language {
        qb.push(" AND a.language = ").push_bind(v.clone());
    }
    if let Some(v) = filters.min_reliability {
        qb.push(" AND a.reliability_score >= ").push_bind(v);
    }
    if let Some(v) = &filters.date_from {
        qb.push(" AND substr(a.published_at, 1, 10) >= ").push_bind(v.clone());
    }
    if let Some(v) = &filters.date_to {
        qb.push(" AND substr(a.published_at, 1, 10) <= ").push_bind(v.clone());
    }
}

async fn run_search(
    pool: &SqlitePool,
    text: &TextMatch,
    filters: &SearchFilters,
    sort: SortBy,
    limit: i64,
    offset: i64,
) -> Result<SearchResults> {
    let mut count_qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT COUNT(*)");
    push_search_body(&mut count_qb, text, filters);
    let (total_count,): (i64,) = count_qb
        .build_query_as()
        .fetch_one(pool)
        .await
        .context("failed to count search results")?;

    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!("SELECT {}", ARTICLE_COLUMNS));
    push_search_body(&mut qb, text, filters);
    qb.push(match (sort, text) {
        // bm25 is lower for better matches
        (SortBy::Relevance, TextMatch::Fts(_)) => " ORDER BY bm25(articles_fts), a.published_at DESC",
        (SortBy::Relevance, _) | (SortBy::Date, _) => " ORDER BY a.published_at DESC, a.id DESC",
        (SortBy::Reliability, _) => " ORDER BY a.reliability_score DESC, a.published_at DESC",
        (SortBy::Popularity, _) => " ORDER BY a.word_count DESC, a.published_at DESC",
    });
    qb.push(" LIMIT ").push_bind(limit).push(" OFFSET ").push_bind(offset);

    let rows = qb
        .build_query_as::<ArticleRow>()
        .fetch_all(pool)
        .await
        .context("failed to run search")?;

    debug!(total_count, returned = rows.len(), "search complete");
    Ok(SearchResults {
        articles: rows.into_iter().map(ArticleRow::into_article).collect(),
        total_count,
        limit,
        offset,
        has_more: offset + limit < total_count,
    })
}

/// Titles and keywords containing `partial`, titles first, no duplicates.
pub async fn suggestions(pool: &SqlitePool, partial: &str, limit: i64) -> Result<Vec<String>> {
    let partial = partial.trim();
    if partial.is_empty() {
        return Ok(Vec::new());
    }
    let pattern = format!("%{}%", storage::like_escape(partial));
    let rows: Vec<(String, String)> = sqlx::query_as(
        r#"
        SELECT DISTINCT title, keywords FROM articles
        WHERE is_active = 1 AND (title LIKE ?1 ESCAPE '\' OR keywords LIKE ?1 ESCAPE '\')
        ORDER BY published_at DESC
        LIMIT ?2
        "#,
    )
    .bind(&pattern)
    .bind(limit * 2)
    .fetch_all(pool)
    .await
    .context("failed to fetch suggestions")?;

    let needle = partial.to_lowercase();
    let mut out: Vec<String> = Vec::new();
    for (title, keywords) in rows {
        if title.to_lowercase().contains(&needle) && !out.contains(&title) {
            out.push(title);
        }
        let list: Vec<String> = serde_json::from_str(&keywords).unwrap_or_default();
        for keyword in list {
            if keyword.to_lowercase().contains(&needle) && !out.contains(&keyword) {
                out.push(keyword);
            }
        }
    }
    out.truncate(limit.max(0) as usize);
    Ok(out)
}

/// Most searched queries, ties broken by recency.
pub async fn popular_searches(pool: &SqlitePool, limit: i64) -> Result<Vec<PopularSearch>> {
    sqlx::query_as::<_, PopularSearch>(
        r#"
        SELECT query, search_count, last_searched
        FROM popular_searches
        ORDER BY search_count DESC, last_searched DESC
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list popular searches")
}

/// Log a search and bump its popularity counter.
pub async fn track_search(
    pool: &SqlitePool,
    user_id: Option<i64>,
    query: &str,
    filters: &SearchFilters,
    results_count: i64,
) -> Result<()> {
    let query = query.trim();
    let now = common::now_timestamp();
    let filters_json = serde_json::to_string(filters).context("failed to serialize filters")?;

    let mut tx = pool.begin().await.context("failed to begin transaction")?;
    sqlx::query(
        "INSERT INTO search_history (user_id, query, filters, results_count, searched_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(query)
    .bind(&filters_json)
    .bind(results_count)
    .bind(&now)
    .execute(&mut tx)
    .await
    .context("failed to record search")?;

    sqlx::query(
        r#"
        INSERT INTO popular_searches (query, search_count, last_searched) VALUES (?, 1, ?)
        ON CONFLICT(query) DO UPDATE SET
            search_count = search_count + 1,
            last_searched = excluded.last_searched
        "#,
    )
    .bind(query)
    .bind(&now)
    .execute(&mut tx)
    .await
    .context("failed to update popular searches")?;

    tx.commit().await.context("failed to commit search tracking")?;
    Ok(())
}

pub async fn search_analytics(pool: &SqlitePool, days: i64) -> Result<SearchAnalytics> {
    let cutoff = common::days_ago_timestamp(days);

    let total_searches: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM search_history WHERE searched_at >= ?")
            .bind(&cutoff)
            .fetch_one(pool)
            .await
            .context("failed to count searches")?;

    let top_queries = sqlx::query_as::<_, QueryCount>(
        r#"
        SELECT query, COUNT(*) AS count
        FROM search_history
        WHERE searched_at >= ?
        GROUP BY query
        ORDER BY count DESC, MAX(searched_at) DESC
        LIMIT 10
        "#,
    )
    .bind(&cutoff)
    .fetch_all(pool)
    .await
    .context("failed to list top queries")?;

    let trend_rows: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT substr(searched_at, 1, 10) AS day, COUNT(*)
        FROM search_history
        WHERE searched_at >= ?
        GROUP BY day
        ORDER BY day
        "#,
    )
    .bind(&cutoff)
    .fetch_all(pool)
    .await
    .context("failed to compute search trends")?;

    Ok(SearchAnalytics {
        total_searches,
        top_queries,
        search_trends: trend_rows.into_iter().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_keep_only_known_values() {
        let raw = SearchFilters {
            category: Some("technology".into()),
            source: Some("  ".into()),
            sentiment: Some("happy".into()),
            language: Some("German".into()),
            min_reliability: Some(101),
            date_from: Some("2026-01-01".into()),
            date_to: Some("01/02/2026".into()),
        };
        let v = raw.validate();
        assert_eq!(v.category.as_deref(), Some("technology"));
        assert_eq!(v.source, None);
        assert_eq!(v.sentiment, None);
        assert_eq!(v.language.as_deref(), Some("German"));
        assert_eq!(v.min_reliability, None);
        assert_eq!(v.date_from.as_deref(), Some("2026-01-01"));
        assert_eq!(v.date_to, None);
    }

    #[test]
    fn user_terms_are_quoted() {
        assert_eq!(fts_query("solar  \"power\" OR"), Some("\"solar\" \"power\" \"OR\"".into()));
        assert_eq!(fts_query("   "), None);
        assert_eq!(SortBy::parse("DATE"), SortBy::Date);
        assert_eq!(SortBy::parse("nonsense"), SortBy::Relevance);
    }
}
