use newsbot::auth::{self, preferences, AuthError};
use newsbot::{sessions, storage};
use serde_json::json;
use sqlx::SqlitePool;

const PASSWORD: &str = "Str0ng!Pass";

async fn setup_test_db() -> SqlitePool {
    let pool = common::init_memory_pool()
        .await
        .expect("Failed to create test pool");
    storage::ensure_schema(&pool).await.expect("Failed to create schema");
    pool
}

#[tokio::test]
async fn test_register_and_login() {
    let pool = setup_test_db().await;

    let user = auth::register(&pool, "alice", "alice@example.com", PASSWORD)
        .await
        .expect("Failed to register");
    assert_eq!(user.username, "alice");
    assert!(user.is_active);
    assert!(user.last_login.is_none());

    let by_name = auth::authenticate(&pool, "alice", PASSWORD).await.unwrap();
    assert_eq!(by_name.id, user.id);
    assert!(by_name.last_login.is_some());

    let by_email = auth::authenticate(&pool, "alice@example.com", PASSWORD)
        .await
        .unwrap();
    assert_eq!(by_email.id, user.id);

    let wrong = auth::authenticate(&pool, "alice", "Wr0ng!Pass").await;
    assert!(matches!(wrong, Err(AuthError::InvalidCredentials)));
    let unknown = auth::authenticate(&pool, "bob", PASSWORD).await;
    assert!(matches!(unknown, Err(AuthError::InvalidCredentials)));
}

#[tokio::test]
async fn test_register_rejects_duplicates_and_bad_input() {
    let pool = setup_test_db().await;
    auth::register(&pool, "alice", "alice@example.com", PASSWORD)
        .await
        .unwrap();

    let same_email = auth::register(&pool, "alice2", "alice@example.com", PASSWORD).await;
    assert!(matches!(same_email, Err(AuthError::UserExists)));
    let same_name = auth::register(&pool, "alice", "other@example.com", PASSWORD).await;
    assert!(matches!(same_name, Err(AuthError::UserExists)));

    let bad_email = auth::register(&pool, "carol", "not-an-email", PASSWORD).await;
    assert!(matches!(bad_email, Err(AuthError::InvalidEmail)));

    match auth::register(&pool, "dave", "dave@example.com", "weak").await {
        Err(AuthError::WeakPassword(problems)) => assert_eq!(problems.len(), 4),
        other => panic!("expected weak password, got {other:?}"),
    }

    assert_eq!(auth::count_users(&pool).await.unwrap(), 1);
}

#[tokio::test]
async fn test_disabled_account_cannot_log_in() {
    let pool = setup_test_db().await;
    let user = auth::register(&pool, "alice", "alice@example.com", PASSWORD)
        .await
        .unwrap();
    let session = sessions::create_session(&pool, user.id, None, None, 7)
        .await
        .unwrap();

    assert!(auth::set_user_active(&pool, user.id, false).await.unwrap());

    let res = auth::authenticate(&pool, "alice", PASSWORD).await;
    assert!(matches!(res, Err(AuthError::AccountDisabled)));
    // disabling ends existing sessions
    assert!(sessions::validate_session(&pool, &session.token)
        .await
        .unwrap()
        .is_none());

    assert!(!auth::set_user_active(&pool, 999, true).await.unwrap());
}

#[tokio::test]
async fn test_session_lifecycle() {
    let pool = setup_test_db().await;
    let user = auth::register(&pool, "alice", "alice@example.com", PASSWORD)
        .await
        .unwrap();

    let session = sessions::create_session(&pool, user.id, Some("10.0.0.1"), Some("tests"), 7)
        .await
        .expect("Failed to create session");
    assert_eq!(session.user_id, user.id);
    assert_eq!(session.ip_address.as_deref(), Some("10.0.0.1"));
    assert!(session.expires_at > session.created_at);

    let found = sessions::validate_session(&pool, &session.token)
        .await
        .unwrap()
        .expect("session should be valid");
    assert_eq!(found.id, session.id);
    assert_eq!(sessions::count_active_sessions(&pool).await.unwrap(), 1);

    assert!(sessions::invalidate_session(&pool, &session.token).await.unwrap());
    assert!(!sessions::invalidate_session(&pool, &session.token).await.unwrap());
    assert!(sessions::validate_session(&pool, &session.token)
        .await
        .unwrap()
        .is_none());
    assert!(sessions::validate_session(&pool, "no-such-token")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_expired_session_is_rejected() {
    let pool = setup_test_db().await;
    let user = auth::register(&pool, "alice", "alice@example.com", PASSWORD)
        .await
        .unwrap();

    let session = sessions::create_session(&pool, user.id, None, None, -1)
        .await
        .unwrap();
    assert!(sessions::validate_session(&pool, &session.token)
        .await
        .unwrap()
        .is_none());

    let stored = sessions::get_session(&pool, session.id).await.unwrap();
    assert!(!stored.is_active);
}

#[tokio::test]
async fn test_preferences_and_reading_history() {
    let pool = setup_test_db().await;
    let user = auth::register(&pool, "alice", "alice@example.com", PASSWORD)
        .await
        .unwrap();

    preferences::set_preference(&pool, user.id, None, "language", &json!("French"))
        .await
        .unwrap();
    preferences::set_preference(&pool, user.id, Some("sports"), "language", &json!("German"))
        .await
        .unwrap();

    let general = preferences::get_preference(&pool, user.id, "language", None)
        .await
        .unwrap();
    assert_eq!(general, Some(json!("French")));
    let sports = preferences::get_preference(&pool, user.id, "language", Some("sports"))
        .await
        .unwrap();
    assert_eq!(sports, Some(json!("German")));

    let all = preferences::get_all_preferences(&pool, user.id).await.unwrap();
    assert_eq!(all["default"]["language"], json!("French"));
    assert_eq!(all["sports"]["language"], json!("German"));

    preferences::track_reading(&pool, user.id, "a1", Some("First story"), Some("sports"), 30)
        .await
        .unwrap();
    preferences::track_reading(&pool, user.id, "a2", Some("Second story"), Some("business"), 90)
        .await
        .unwrap();

    let history = preferences::reading_history(&pool, user.id, 10).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].article_id, "a2");

    let stats = preferences::reading_stats(&pool, user.id, 30).await.unwrap();
    assert_eq!(stats.total_articles, 2);
    assert_eq!(stats.total_reading_time, 120);
    assert_eq!(stats.avg_reading_time, 60.0);
    assert_eq!(stats.category_stats["sports"], 1);
}
