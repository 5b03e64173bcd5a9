use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{debug, info};

/// Sessions last a week unless `auth.session_days` says otherwise.
pub const DEFAULT_SESSION_DAYS: i64 = 7;

const TOKEN_LEN: usize = 43;

/// A logged-in user's session, identified by an opaque random token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub user_id: i64,
    #[serde(skip_serializing)]
    pub token: String,
    pub created_at: String,
    pub expires_at: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub is_active: bool,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= common::format_timestamp(now)
    }
}

// Internal row type for SQLx mapping
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: i64,
    user_id: i64,
    token: String,
    created_at: String,
    expires_at: String,
    ip_address: Option<String>,
    user_agent: Option<String>,
    is_active: bool,
}

impl From<SessionRow> for Session {
    fn from(row: SessionRow) -> Self {
        Session {
            id: row.id,
            user_id: row.user_id,
            token: row.token,
            created_at: row.created_at,
            expires_at: row.expires_at,
            ip_address: row.ip_address,
            user_agent: row.user_agent,
            is_active: row.is_active,
        }
    }
}

/// URL-safe random token (alphanumeric, ~256 bits).
pub fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Create a new session for `user_id`, valid for `days` days.
pub async fn create_session(
    pool: &SqlitePool,
    user_id: i64,
    ip_address: Option<&str>,
    user_agent: Option<&str>,
    days: i64,
) -> Result<Session> {
    let token = generate_token();
    let now = Utc::now();
    let expires_at = common::format_timestamp(now + Duration::days(days));

    let result = sqlx::query(
        r#"
        INSERT INTO user_sessions (user_id, token, created_at, expires_at, ip_address, user_agent)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(user_id)
    .bind(&token)
    .bind(common::format_timestamp(now))
    .bind(&expires_at)
    .bind(ip_address)
    .bind(user_agent)
    .execute(pool)
    .await
    .context("Failed to insert session")?;

    info!(user_id, session_id = result.last_insert_rowid(), "session created");
    get_session(pool, result.last_insert_rowid()).await
}

pub async fn get_session(pool: &SqlitePool, session_id: i64) -> Result<Session> {
    let row = sqlx::query_as::<_, SessionRow>(
        r#"
        SELECT id, user_id, token, created_at, expires_at, ip_address, user_agent, is_active
        FROM user_sessions
        WHERE id = ?
        "#,
    )
    .bind(session_id)
    .fetch_one(pool)
    .await
    .context("Failed to fetch session")?;
    Ok(row.into())
}

/// Look up an active session by token. An expired session is deactivated on
/// the spot and reported as absent.
pub async fn validate_session(pool: &SqlitePool, token: &str) -> Result<Option<Session>> {
    let row = sqlx::query_as::<_, SessionRow>(
        r#"
        SELECT id, user_id, token, created_at, expires_at, ip_address, user_agent, is_active
        FROM user_sessions
        WHERE token = ? AND is_active = 1
        "#,
    )
    .bind(token)
    .fetch_optional(pool)
    .await
    .context("Failed to look up session")?;

    let Some(session) = row.map(Session::from) else {
        return Ok(None);
    };

    if session.is_expired(Utc::now()) {
        debug!(session_id = session.id, "session expired");
        invalidate_session(pool, token).await?;
        return Ok(None);
    }
    Ok(Some(session))
}

/// Returns `false` if the token matched no active session.
pub async fn invalidate_session(pool: &SqlitePool, token: &str) -> Result<bool> {
    let res = sqlx::query("UPDATE user_sessions SET is_active = 0 WHERE token = ? AND is_active = 1")
        .bind(token)
        .execute(pool)
        .await
        .context("Failed to invalidate session")?;
    Ok(res.rows_affected() > 0)
}

pub async fn invalidate_all_sessions(pool: &SqlitePool, user_id: i64) -> Result<u64> {
    let res = sqlx::query("UPDATE user_sessions SET is_active = 0 WHERE user_id = ? AND is_active = 1")
        .bind(user_id)
        .execute(pool)
        .await
        .context("Failed to invalidate user sessions")?;
    Ok(res.rows_affected())
}

/// Active, unexpired sessions across all users (admin dashboard).
pub async fn count_active_sessions(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM user_sessions WHERE is_active = 1 AND expires_at > ?",
    )
    .bind(common::now_timestamp())
    .fetch_one(pool)
    .await
    .context("Failed to count sessions")?;
    Ok(count)
}
