use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::{debug, info};

/// A news article as stored in the search index.
///
/// `article_id` is the stable string id derived from the article URL; the
/// integer rowid only exists to back the FTS5 external-content table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub article_id: String,
    pub title: String,
    pub url: Option<String>,
    pub source: Option<String>,
    pub author: Option<String>,
    pub content: String,
    pub url_to_image: Option<String>,
    pub published_at: Option<String>,
    pub category: Option<String>,
    pub sentiment: Option<String>,
    pub reliability_score: Option<i64>,
    pub word_count: i64,
    pub language: Option<String>,
    pub keywords: Vec<String>,
    pub indexed_at: Option<String>,
    pub is_active: bool,
}

// Internal row type for SQLx mapping; keywords are a JSON array in TEXT.
#[derive(sqlx::FromRow)]
pub(crate) struct ArticleRow {
    article_id: String,
    title: String,
    url: Option<String>,
    source: Option<String>,
    author: Option<String>,
    content: String,
    url_to_image: Option<String>,
    published_at: Option<String>,
    category: Option<String>,
    sentiment: Option<String>,
    reliability_score: Option<i64>,
    word_count: i64,
    language: Option<String>,
    keywords: String,
    indexed_at: Option<String>,
    is_active: bool,
}

impl ArticleRow {
    pub(crate) fn into_article(self) -> Article {
        Article {
            article_id: self.article_id,
            title: self.title,
            url: self.url,
            source: self.source,
            author: self.author,
            content: self.content,
            url_to_image: self.url_to_image,
            published_at: self.published_at,
            category: self.category,
            sentiment: self.sentiment,
            reliability_score: self.reliability_score,
            word_count: self.word_count,
            language: self.language,
            keywords: serde_json::from_str(&self.keywords).unwrap_or_default(),
            indexed_at: self.indexed_at,
            is_active: self.is_active,
        }
    }
}

/// Column list shared by every article SELECT (prefix with the table alias `a`).
pub(crate) const ARTICLE_COLUMNS: &str = "a.article_id, a.title, a.url, a.source, a.author, a.content, \
     a.url_to_image, a.published_at, a.category, a.sentiment, a.reliability_score, a.word_count, \
     a.language, a.keywords, a.indexed_at, a.is_active";

/// Filters for listing/exporting articles straight from the table (no FTS).
#[derive(Debug, Clone, Default)]
pub struct ArticleQuery {
    pub category: Option<String>,
    /// Inclusive `YYYY-MM-DD` bounds on `published_at`
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub include_inactive: bool,
    pub limit: i64,
    pub offset: i64,
}

/// Ensure the required schema exists. This runs CREATE ... IF NOT EXISTS statements for every table.
/// This function is idempotent and safe to call at startup.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    info!("storage: ensuring DB schema (CREATE TABLE IF NOT EXISTS ...)");

    let stmts = [
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            last_login TEXT,
            is_active BOOLEAN NOT NULL DEFAULT 1
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS user_sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            token TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            expires_at TEXT NOT NULL,
            ip_address TEXT,
            user_agent TEXT,
            is_active BOOLEAN NOT NULL DEFAULT 1,
            FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS user_preferences (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            category TEXT NOT NULL DEFAULT '',
            preference_type TEXT NOT NULL,
            preference_value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE,
            UNIQUE(user_id, category, preference_type)
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS reading_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            article_id TEXT NOT NULL,
            article_title TEXT,
            category TEXT,
            read_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            reading_time INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
        );
        "#,
        "CREATE INDEX IF NOT EXISTS idx_reading_history_user ON reading_history(user_id, read_at);",
        r#"
        CREATE TABLE IF NOT EXISTS articles (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            article_id TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL,
            url TEXT,
            source TEXT,
            author TEXT,
            content TEXT NOT NULL DEFAULT '',
            url_to_image TEXT,
            published_at TEXT,
            category TEXT,
            sentiment TEXT,
            reliability_score INTEGER,
            word_count INTEGER NOT NULL DEFAULT 0,
            language TEXT,
            keywords TEXT NOT NULL DEFAULT '[]',
            indexed_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            is_active BOOLEAN NOT NULL DEFAULT 1
        );
        "#,
        "CREATE INDEX IF NOT EXISTS idx_articles_category ON articles(category, published_at);",
        r#"
        CREATE VIRTUAL TABLE IF NOT EXISTS articles_fts USING fts5(
            title, content, keywords, category, source, author,
            content='articles', content_rowid='id'
        );
        "#,
        r#"
        CREATE TRIGGER IF NOT EXISTS articles_fts_insert AFTER INSERT ON articles BEGIN
            INSERT INTO articles_fts(rowid, title, content, keywords, category, source, author)
            VALUES (new.id, new.title, new.content, new.keywords, new.category, new.source, new.author);
        END;
        "#,
        r#"
        CREATE TRIGGER IF NOT EXISTS articles_fts_delete AFTER DELETE ON articles BEGIN
            INSERT INTO articles_fts(articles_fts, rowid, title, content, keywords, category, source, author)
            VALUES ('delete', old.id, old.title, old.content, old.keywords, old.category, old.source, old.author);
        END;
        "#,
        r#"
        CREATE TRIGGER IF NOT EXISTS articles_fts_update AFTER UPDATE ON articles BEGIN
            INSERT INTO articles_fts(articles_fts, rowid, title, content, keywords, category, source, author)
            VALUES ('delete', old.id, old.title, old.content, old.keywords, old.category, old.source, old.author);
            INSERT INTO articles_fts(rowid, title, content, keywords, category, source, author)
            VALUES (new.id, new.title, new.content, new.keywords, new.category, new.source, new.author);
        END;
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS search_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER,
            query TEXT NOT NULL,
            filters TEXT,
            results_count INTEGER NOT NULL DEFAULT 0,
            searched_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );
        "#,
        "CREATE INDEX IF NOT EXISTS idx_search_history_time ON search_history(searched_at);",
        r#"
        CREATE TABLE IF NOT EXISTS popular_searches (
            query TEXT PRIMARY KEY,
            search_count INTEGER NOT NULL DEFAULT 0,
            last_searched TEXT NOT NULL
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS cache_entries (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            expires_at INTEGER,
            access_count INTEGER NOT NULL DEFAULT 0,
            last_accessed INTEGER
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS cache_stats (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            total_hits INTEGER NOT NULL DEFAULT 0,
            total_misses INTEGER NOT NULL DEFAULT 0,
            last_cleanup TEXT
        );
        "#,
        "INSERT OR IGNORE INTO cache_stats (id) VALUES (1);",
        r#"
        CREATE TABLE IF NOT EXISTS news_analytics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            recorded_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            category TEXT,
            sentiment TEXT,
            reliability_score INTEGER,
            word_count INTEGER,
            language TEXT,
            keywords TEXT,
            source TEXT
        );
        "#,
        "CREATE INDEX IF NOT EXISTS idx_news_analytics_time ON news_analytics(recorded_at);",
        r#"
        CREATE TABLE IF NOT EXISTS user_interactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            recorded_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            user_id INTEGER,
            action TEXT NOT NULL,
            category TEXT,
            search_query TEXT,
            article_id TEXT
        );
        "#,
        "CREATE INDEX IF NOT EXISTS idx_user_interactions_time ON user_interactions(recorded_at);",
        r#"
        CREATE TABLE IF NOT EXISTS rate_limits (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            identifier TEXT NOT NULL,
            endpoint TEXT NOT NULL,
            request_count INTEGER NOT NULL DEFAULT 1,
            window_start INTEGER NOT NULL,
            last_request INTEGER NOT NULL,
            is_blocked BOOLEAN NOT NULL DEFAULT 0,
            block_until INTEGER,
            UNIQUE(identifier, endpoint)
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS security_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_type TEXT NOT NULL,
            identifier TEXT,
            details TEXT,
            recorded_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );
        "#,
    ];

    for s in &stmts {
        sqlx::query(s)
            .execute(pool)
            .await
            .with_context(|| "failed to ensure schema")?;
    }

    info!("storage: DB schema ensured");
    Ok(())
}

/// Insert an article or refresh an existing one (matched by `article_id`).
///
/// Uses an upsert rather than `INSERT OR REPLACE` so the FTS update trigger fires
/// instead of a silent delete. Analysis results already attached to the stored
/// row survive a refresh that carries none.
pub async fn upsert_article(pool: &SqlitePool, article: &Article) -> Result<()> {
    let keywords_json =
        serde_json::to_string(&article.keywords).context("failed to serialize keywords")?;

    sqlx::query(
        r#"
        INSERT INTO articles
            (article_id, title, url, source, author, content, url_to_image, published_at,
             category, sentiment, reliability_score, word_count, language, keywords, indexed_at, is_active)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)
        ON CONFLICT(article_id) DO UPDATE SET
            title = excluded.title,
            url = excluded.url,
            source = excluded.source,
            author = excluded.author,
            content = excluded.content,
            url_to_image = excluded.url_to_image,
            published_at = excluded.published_at,
            category = excluded.category,
            sentiment = COALESCE(excluded.sentiment, articles.sentiment),
            reliability_score = COALESCE(excluded.reliability_score, articles.reliability_score),
            word_count = excluded.word_count,
            language = COALESCE(excluded.language, articles.language),
            keywords = excluded.keywords,
            indexed_at = excluded.indexed_at
        "#,
    )
    .bind(&article.article_id)
    .bind(&article.title)
    .bind(&article.url)
    .bind(&article.source)
    .bind(&article.author)
    .bind(&article.content)
    .bind(&article.url_to_image)
    .bind(&article.published_at)
    .bind(&article.category)
    .bind(&article.sentiment)
    .bind(article.reliability_score)
    .bind(article.word_count)
    .bind(&article.language)
    .bind(&keywords_json)
    .bind(common::now_timestamp())
    .execute(pool)
    .await
    .context("failed to upsert article")?;

    debug!(article_id = %article.article_id, "article indexed");
    Ok(())
}

pub async fn get_article(pool: &SqlitePool, article_id: &str) -> Result<Option<Article>> {
    let sql = format!("SELECT {} FROM articles a WHERE a.article_id = ?", ARTICLE_COLUMNS);
    let row = sqlx::query_as::<_, ArticleRow>(&sql)
        .bind(article_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch article")?;
    Ok(row.map(ArticleRow::into_article))
}

/// Returns `false` when no article has that id.
pub async fn update_article_sentiment(
    pool: &SqlitePool,
    article_id: &str,
    sentiment: &str,
) -> Result<bool> {
    let res = sqlx::query("UPDATE articles SET sentiment = ? WHERE article_id = ?")
        .bind(sentiment)
        .bind(article_id)
        .execute(pool)
        .await
        .context("failed to update article sentiment")?;
    Ok(res.rows_affected() > 0)
}

pub async fn update_article_reliability(
    pool: &SqlitePool,
    article_id: &str,
    score: i64,
) -> Result<bool> {
    let res = sqlx::query("UPDATE articles SET reliability_score = ? WHERE article_id = ?")
        .bind(score)
        .bind(article_id)
        .execute(pool)
        .await
        .context("failed to update article reliability")?;
    Ok(res.rows_affected() > 0)
}

/// Hide or restore an article without deleting it (admin moderation).
pub async fn set_article_active(pool: &SqlitePool, article_id: &str, active: bool) -> Result<bool> {
    let res = sqlx::query("UPDATE articles SET is_active = ? WHERE article_id = ?")
        .bind(active)
        .bind(article_id)
        .execute(pool)
        .await
        .context("failed to update article status")?;
    Ok(res.rows_affected() > 0)
}

fn push_article_filters<'a>(qb: &mut QueryBuilder<'a, Sqlite>, q: &'a ArticleQuery) {
    qb.push(" WHERE 1 = 1");
    if !q.include_inactive {
        qb.push(" AND a.is_active = 1");
    }
    if let Some(category) = &q.category {
        qb.push(" AND a.category = ").push_bind(category.as_str());
    }
    if let Some(from) = &q.date_from {
        qb.push(" AND substr(a.published_at, 1, 10) >= ").push_bind(from.as_str());
    }
    if let Some(to) = &q.date_to {
        qb.push(" AND substr(a.published_at, 1, 10) <= ").push_bind(to.as_str());
    }
}

/// Newest-first listing with optional category/date filters.
pub async fn list_articles(pool: &SqlitePool, q: &ArticleQuery) -> Result<Vec<Article>> {
    let mut qb: QueryBuilder<Sqlite> =
        QueryBuilder::new(format!("SELECT {} FROM articles a", ARTICLE_COLUMNS));
    push_article_filters(&mut qb, q);
    qb.push(" ORDER BY a.published_at DESC, a.id DESC LIMIT ")
        .push_bind(q.limit)
        .push(" OFFSET ")
        .push_bind(q.offset);

    let rows = qb
        .build_query_as::<ArticleRow>()
        .fetch_all(pool)
        .await
        .context("failed to list articles")?;
    Ok(rows.into_iter().map(ArticleRow::into_article).collect())
}

pub async fn count_articles(pool: &SqlitePool, q: &ArticleQuery) -> Result<i64> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT COUNT(*) FROM articles a");
    push_article_filters(&mut qb, q);
    let count: (i64,) = qb
        .build_query_as()
        .fetch_one(pool)
        .await
        .context("failed to count articles")?;
    Ok(count.0)
}

/// Mean reliability over active articles that have been scored.
pub async fn average_reliability(pool: &SqlitePool) -> Result<Option<f64>> {
    let avg: Option<f64> = sqlx::query_scalar(
        "SELECT AVG(reliability_score) FROM articles WHERE is_active = 1 AND reliability_score IS NOT NULL",
    )
    .fetch_one(pool)
    .await
    .context("failed to compute average reliability")?;
    Ok(avg)
}

/// Escape LIKE wildcards; patterns built with this must use `ESCAPE '\'`.
pub(crate) fn like_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_patterns_are_escaped() {
        assert_eq!(like_escape("a_b%"), "a\\_b\\%");
        assert_eq!(like_escape("c:\\x"), "c:\\\\x");
    }

    fn sample(id: &str, category: &str, published: &str) -> Article {
        Article {
            article_id: id.to_string(),
            title: format!("Title {}", id),
            content: "Markets rallied after the announcement".to_string(),
            category: Some(category.to_string()),
            published_at: Some(published.to_string()),
            word_count: 5,
            keywords: vec!["markets".to_string()],
            is_active: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn ensure_schema_is_idempotent() {
        let pool = common::init_memory_pool().await.unwrap();
        ensure_schema(&pool).await.unwrap();
        ensure_schema(&pool).await.unwrap();
        let stats_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cache_stats")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(stats_rows, 1);
    }

    #[tokio::test]
    async fn upsert_keeps_existing_analysis() {
        let pool = common::init_memory_pool().await.unwrap();
        ensure_schema(&pool).await.unwrap();

        let article = sample("a1", "business", "2026-01-02T10:00:00Z");
        upsert_article(&pool, &article).await.unwrap();
        assert!(update_article_sentiment(&pool, "a1", "Positive").await.unwrap());
        assert!(update_article_reliability(&pool, "a1", 82).await.unwrap());

        let mut refreshed = article.clone();
        refreshed.title = "Updated title".to_string();
        upsert_article(&pool, &refreshed).await.unwrap();

        let stored = get_article(&pool, "a1").await.unwrap().unwrap();
        assert_eq!(stored.title, "Updated title");
        assert_eq!(stored.sentiment.as_deref(), Some("Positive"));
        assert_eq!(stored.reliability_score, Some(82));
        assert_eq!(stored.keywords, vec!["markets".to_string()]);

        let fts_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM articles_fts WHERE articles_fts MATCH 'updated'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(fts_rows, 1);
    }

    #[tokio::test]
    async fn list_filters_by_category_and_date() {
        let pool = common::init_memory_pool().await.unwrap();
        ensure_schema(&pool).await.unwrap();
        upsert_article(&pool, &sample("a1", "business", "2026-01-02T10:00:00Z")).await.unwrap();
        upsert_article(&pool, &sample("a2", "business", "2026-01-05T10:00:00Z")).await.unwrap();
        upsert_article(&pool, &sample("a3", "sports", "2026-01-05T10:00:00Z")).await.unwrap();
        assert!(!update_article_sentiment(&pool, "missing", "Neutral").await.unwrap());

        let q = ArticleQuery {
            category: Some("business".to_string()),
            date_from: Some("2026-01-03".to_string()),
            limit: 10,
            ..Default::default()
        };
        let found = list_articles(&pool, &q).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].article_id, "a2");
        assert_eq!(count_articles(&pool, &q).await.unwrap(), 1);

        set_article_active(&pool, "a3", false).await.unwrap();
        let all = ArticleQuery { limit: 10, ..Default::default() };
        assert_eq!(count_articles(&pool, &all).await.unwrap(), 2);
    }
}
