use newsbot::search::{self, SearchFilters, SortBy};
use newsbot::storage::{self, Article};
use sqlx::SqlitePool;

async fn setup_index() -> SqlitePool {
    let pool = common::init_memory_pool().await.unwrap();
    storage::ensure_schema(&pool).await.unwrap();

    let articles = [
        ("a1", "Solar panels get cheaper", "science", "Wire", "2026-03-01T08:00:00Z", 90, 120),
        ("a2", "Stock markets rally on solar boom", "business", "Daily", "2026-03-03T08:00:00Z", 60, 40),
        ("a3", "Local team wins the cup", "sports", "Wire", "2026-03-02T08:00:00Z", 70, 80),
    ];
    for (id, title, category, source, published, reliability, words) in articles {
        let article = Article {
            article_id: id.to_string(),
            title: title.to_string(),
            url: Some(format!("https://example.com/{}", id)),
            source: Some(source.to_string()),
            content: format!("{} and more details", title),
            published_at: Some(published.to_string()),
            category: Some(category.to_string()),
            reliability_score: Some(reliability),
            word_count: words,
            keywords: title.to_lowercase().split(' ').map(str::to_string).collect(),
            is_active: true,
            ..Default::default()
        };
        search::index_article(&pool, &article).await.unwrap();
    }
    pool
}

fn ids(results: &search::SearchResults) -> Vec<&str> {
    results.articles.iter().map(|a| a.article_id.as_str()).collect()
}

#[tokio::test]
async fn test_text_search_matches_title_words() {
    let pool = setup_index().await;

    let results = search::search(&pool, "solar", &SearchFilters::default(), SortBy::Date, 10, 0)
        .await
        .unwrap();
    assert_eq!(results.total_count, 2);
    assert_eq!(ids(&results), vec!["a2", "a1"]);
    assert!(!results.has_more);
}

#[tokio::test]
async fn test_filters_and_sorting() {
    let pool = setup_index().await;

    let filters = SearchFilters {
        category: Some("science".to_string()),
        ..Default::default()
    };
    let results = search::search(&pool, "solar", &filters, SortBy::Relevance, 10, 0)
        .await
        .unwrap();
    assert_eq!(ids(&results), vec!["a1"]);

    let by_reliability = search::search(&pool, "", &SearchFilters::default(), SortBy::Reliability, 10, 0)
        .await
        .unwrap();
    assert_eq!(ids(&by_reliability), vec!["a1", "a3", "a2"]);

    let by_length = search::search(&pool, "", &SearchFilters::default(), SortBy::Popularity, 10, 0)
        .await
        .unwrap();
    assert_eq!(ids(&by_length), vec!["a1", "a3", "a2"]);

    let dated = SearchFilters {
        date_from: Some("2026-03-02".to_string()),
        min_reliability: Some(65),
        ..Default::default()
    };
    let results = search::search(&pool, "", &dated, SortBy::Date, 10, 0).await.unwrap();
    assert_eq!(ids(&results), vec!["a3"]);
}

#[tokio::test]
async fn test_pagination_reports_has_more() {
    let pool = setup_index().await;

    let page = search::search(&pool, "", &SearchFilters::default(), SortBy::Date, 2, 0)
        .await
        .unwrap();
    assert_eq!(page.total_count, 3);
    assert_eq!(page.articles.len(), 2);
    assert!(page.has_more);

    let last = search::search(&pool, "", &SearchFilters::default(), SortBy::Date, 2, 2)
        .await
        .unwrap();
    assert_eq!(ids(&last), vec!["a1"]);
    assert!(!last.has_more);
}

#[tokio::test]
async fn test_hidden_articles_are_not_found() {
    let pool = setup_index().await;
    storage::set_article_active(&pool, "a1", false).await.unwrap();

    let results = search::search(&pool, "solar", &SearchFilters::default(), SortBy::Date, 10, 0)
        .await
        .unwrap();
    assert_eq!(ids(&results), vec!["a2"]);
}

#[tokio::test]
async fn test_fts_syntax_in_query_is_harmless() {
    let pool = setup_index().await;

    let results = search::search(
        &pool,
        "solar\" OR NEAR(",
        &SearchFilters::default(),
        SortBy::Relevance,
        10,
        0,
    )
    .await;
    assert!(results.is_ok());
}

#[tokio::test]
async fn test_suggestions_and_popular_searches() {
    let pool = setup_index().await;

    let suggestions = search::suggestions(&pool, "sol", 5).await.unwrap();
    assert!(suggestions.contains(&"Solar panels get cheaper".to_string()));
    assert!(suggestions.contains(&"solar".to_string()));
    assert!(search::suggestions(&pool, "  ", 5).await.unwrap().is_empty());

    let filters = SearchFilters::default();
    search::track_search(&pool, None, "solar", &filters, 2).await.unwrap();
    search::track_search(&pool, None, "solar", &filters, 2).await.unwrap();
    search::track_search(&pool, None, "cup", &filters, 1).await.unwrap();

    let popular = search::popular_searches(&pool, 10).await.unwrap();
    assert_eq!(popular[0].query, "solar");
    assert_eq!(popular[0].count, 2);
    assert_eq!(popular[1].query, "cup");

    let analytics = search::search_analytics(&pool, 7).await.unwrap();
    assert_eq!(analytics.total_searches, 3);
    assert_eq!(analytics.top_queries[0].query, "solar");
    assert_eq!(analytics.search_trends.values().sum::<i64>(), 3);
}
