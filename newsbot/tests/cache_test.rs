use std::time::Duration;

use newsbot::cache::{CacheManager, NewsCache, NewsCacheTtls};
use newsbot::storage;
use serde_json::json;

async fn setup_cache() -> CacheManager {
    let pool = common::init_memory_pool().await.unwrap();
    storage::ensure_schema(&pool).await.unwrap();
    CacheManager::new(pool, Duration::from_secs(300))
}

#[tokio::test]
async fn test_entry_is_served_until_it_expires() {
    let cache = setup_cache().await;

    cache
        .set("k", &json!({"n": 1}), Some(Duration::from_millis(50)))
        .await
        .unwrap();
    let hit: Option<serde_json::Value> = cache.get("k").await.unwrap();
    assert_eq!(hit, Some(json!({"n": 1})));

    tokio::time::sleep(Duration::from_millis(120)).await;
    let miss: Option<serde_json::Value> = cache.get("k").await.unwrap();
    assert_eq!(miss, None);

    let stats = cache.stats().await.unwrap();
    assert_eq!(stats.total_hits, 1);
    assert_eq!(stats.total_misses, 1);
    assert_eq!(stats.current_entries, 0);
    assert_eq!(stats.hit_rate, 50.0);
}

#[tokio::test]
async fn test_huge_ttl_never_expires() {
    let cache = setup_cache().await;

    cache
        .set("forever", "v", Some(Duration::from_secs(u64::MAX)))
        .await
        .unwrap();
    let hit: Option<String> = cache.get("forever").await.unwrap();
    assert_eq!(hit.as_deref(), Some("v"));
    assert_eq!(cache.cleanup_expired().await.unwrap(), 0);
}

#[tokio::test]
async fn test_set_overwrites_value_and_ttl() {
    let cache = setup_cache().await;

    cache
        .set("k", "old", Some(Duration::from_millis(50)))
        .await
        .unwrap();
    cache.set("k", "new", Some(Duration::from_secs(60))).await.unwrap();

    tokio::time::sleep(Duration::from_millis(120)).await;
    let value: Option<String> = cache.get("k").await.unwrap();
    assert_eq!(value.as_deref(), Some("new"));
}

#[tokio::test]
async fn test_zero_ttl_never_expires_and_cleanup_keeps_it() {
    let cache = setup_cache().await;

    cache.set("forever", &42, Some(Duration::ZERO)).await.unwrap();
    cache
        .set("short", &1, Some(Duration::from_millis(10)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(cache.cleanup_expired().await.unwrap(), 1);
    let value: Option<i32> = cache.get("forever").await.unwrap();
    assert_eq!(value, Some(42));

    let stats = cache.stats().await.unwrap();
    assert!(stats.last_cleanup.is_some());
}

#[tokio::test]
async fn test_get_or_set_with_runs_producer_once() {
    let cache = setup_cache().await;

    let first: Vec<String> = cache
        .get_or_set_with("topics", None, || async { Ok(vec!["ai".to_string()]) })
        .await
        .unwrap();
    let second: Vec<String> = cache
        .get_or_set_with("topics", None, || async {
            Ok::<_, anyhow::Error>(vec!["never".to_string()])
        })
        .await
        .unwrap();
    assert_eq!(first, second);

    let failed = cache
        .get_or_set_with::<Vec<String>, _, _>("other", None, || async {
            Err(anyhow::anyhow!("upstream down"))
        })
        .await;
    assert!(failed.is_err());
    assert!(cache.get::<Vec<String>>("other").await.unwrap().is_none());
}

#[tokio::test]
async fn test_news_cache_invalidates_one_category() {
    let cache = setup_cache().await;
    let news = NewsCache::new(cache.clone(), NewsCacheTtls::default());

    news.set_news("technology", None, "us", &json!({"articles": []}))
        .await
        .unwrap();
    news.set_news("sports", None, "us", &json!({"articles": []}))
        .await
        .unwrap();
    news.set_trending(7, &json!([{"topic": "ai"}])).await.unwrap();

    assert_eq!(news.invalidate_category("technology").await.unwrap(), 2);

    let tech: Option<serde_json::Value> = news.get_news("technology", None, "us").await.unwrap();
    let sports: Option<serde_json::Value> = news.get_news("sports", None, "us").await.unwrap();
    assert!(tech.is_none());
    assert!(sports.is_some());
}

#[tokio::test]
async fn test_clear_removes_everything() {
    let cache = setup_cache().await;
    cache.set("a", &1, None).await.unwrap();
    cache.set("b", &2, None).await.unwrap();

    assert_eq!(cache.clear().await.unwrap(), 2);
    assert_eq!(cache.stats().await.unwrap().current_entries, 0);
}

#[tokio::test]
async fn test_entries_survive_reopening_the_database() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("newsbot.db");
    let db_path = db_path.to_string_lossy();

    let pool = common::init_db_pool(&db_path).await.unwrap();
    storage::ensure_schema(&pool).await.unwrap();
    CacheManager::new(pool.clone(), Duration::from_secs(300))
        .set("summary:abc", "cached summary", None)
        .await
        .unwrap();
    pool.close().await;

    let pool = common::init_db_pool(&db_path).await.unwrap();
    storage::ensure_schema(&pool).await.unwrap();
    let value: Option<String> = CacheManager::new(pool, Duration::from_secs(300))
        .get("summary:abc")
        .await
        .unwrap();
    assert_eq!(value.as_deref(), Some("cached summary"));
}
