use std::time::Duration;

use newsbot::analytics::{self, AnalysisRecord};
use newsbot::auth::{self, preferences};
use newsbot::cache::CacheManager;
use newsbot::export::{self, ExportFormat};
use newsbot::storage::{self, Article};
use serde_json::Value;
use sqlx::SqlitePool;

async fn setup_db() -> SqlitePool {
    let pool = common::init_memory_pool().await.unwrap();
    storage::ensure_schema(&pool).await.unwrap();
    pool
}

fn article(id: &str, category: &str, published: &str) -> Article {
    Article {
        article_id: id.to_string(),
        title: format!("Story {}", id),
        source: Some("Wire".to_string()),
        content: "Short body".to_string(),
        published_at: Some(published.to_string()),
        category: Some(category.to_string()),
        reliability_score: Some(80),
        is_active: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_user_data_export_formats() {
    let pool = setup_db().await;
    let user = auth::register(&pool, "alice", "alice@example.com", "Str0ng!Pass")
        .await
        .unwrap();
    preferences::track_reading(&pool, user.id, "a1", Some("Story, with comma"), Some("science"), 42)
        .await
        .unwrap();

    let csv = export::export_user_data(&pool, user.id, ExportFormat::Csv)
        .await
        .unwrap();
    assert!(csv.filename.starts_with(&format!("user_data_{}_", user.id)));
    assert!(csv.filename.ends_with(".csv"));
    let text = String::from_utf8(csv.body).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("Article ID,Title,Category,Read At,Reading Time"));
    let row = lines.next().unwrap();
    assert!(row.starts_with("a1,\"Story, with comma\",science,"));
    assert!(row.ends_with(",42"));

    let json = export::export_user_data(&pool, user.id, ExportFormat::Json)
        .await
        .unwrap();
    let data: Value = serde_json::from_slice(&json.body).unwrap();
    assert_eq!(data["user_id"], user.id);
    assert_eq!(data["reading_stats"]["total_articles"], 1);

    let xml = export::export_user_data(&pool, user.id, ExportFormat::Xml)
        .await
        .unwrap();
    let text = String::from_utf8(xml.body).unwrap();
    assert!(text.contains("<user_data>"));
    assert!(text.contains("<article_id>a1</article_id>"));
}

#[tokio::test]
async fn test_article_export_applies_filters() {
    let pool = setup_db().await;
    storage::upsert_article(&pool, &article("a1", "science", "2026-03-01T08:00:00Z"))
        .await
        .unwrap();
    storage::upsert_article(&pool, &article("a2", "science", "2026-03-05T08:00:00Z"))
        .await
        .unwrap();
    storage::upsert_article(&pool, &article("a3", "sports", "2026-03-05T08:00:00Z"))
        .await
        .unwrap();

    let file = export::export_articles(
        &pool,
        Some("science".to_string()),
        Some("2026-03-02".to_string()),
        None,
        ExportFormat::Csv,
    )
    .await
    .unwrap();
    let text = String::from_utf8(file.body).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "ID,Title,Category,Source,Published At,Sentiment,Reliability");
    assert_eq!(lines.len(), 2);
    assert!(lines[1].starts_with("a2,Story a2,science,Wire,"));
}

#[tokio::test]
async fn test_backup_bundles_every_file() {
    let pool = setup_db().await;
    auth::register(&pool, "alice", "alice@example.com", "Str0ng!Pass")
        .await
        .unwrap();
    storage::upsert_article(&pool, &article("a1", "science", "2026-03-01T08:00:00Z"))
        .await
        .unwrap();
    analytics::record_analysis(
        &pool,
        &AnalysisRecord {
            category: Some("science".to_string()),
            sentiment: Some("Positive".to_string()),
            reliability_score: Some(80),
            keywords: vec!["rover".to_string()],
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let cache = CacheManager::new(pool.clone(), Duration::from_secs(60));

    let without_users = export::create_backup(&pool, &cache, false).await.unwrap();
    assert!(without_users.filename.starts_with("backup_"));
    let bundle: Value = serde_json::from_slice(&without_users.body).unwrap();
    let files = &bundle["files"];
    assert!(files["backup.json"]["users"].is_null());
    assert_eq!(files["backup.json"]["search_index"].as_array().unwrap().len(), 1);
    assert!(files["analytics.csv"]
        .as_str()
        .unwrap()
        .starts_with("Date,Positive,Negative,Neutral"));
    assert!(files["analytics.xml"].as_str().unwrap().contains("<analytics>"));
    assert_eq!(files["metadata.json"]["file_count"], 3);

    let with_users = export::create_backup(&pool, &cache, true).await.unwrap();
    let bundle: Value = serde_json::from_slice(&with_users.body).unwrap();
    let users = bundle["files"]["backup.json"]["users"].as_array().unwrap();
    assert_eq!(users.len(), 1);
    assert!(users[0].get("password_hash").is_none());
}
