//! User accounts: registration, login and password hashing.
//!
//! Session tokens live in [`crate::sessions`]; the JWT wrapping and the Rocket
//! request guards are in [`jwt`] and [`guards`].

use anyhow::{anyhow, Context};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::security;

pub mod guards;
pub mod jwt;
pub mod preferences;

pub use guards::{AdminUser, AuthUser, OptionalUser};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Username is required")]
    InvalidUsername,
    #[error("Invalid email format")]
    InvalidEmail,
    #[error("{}", .0.join("; "))]
    WeakPassword(Vec<String>),
    #[error("User already exists")]
    UserExists,
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Account is disabled")]
    AccountDisabled,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::InvalidUsername | AuthError::InvalidEmail | AuthError::WeakPassword(_) => {
                ApiError::BadRequest(e.to_string())
            }
            AuthError::UserExists => ApiError::Conflict(e.to_string()),
            AuthError::InvalidCredentials => ApiError::Unauthorized(e.to_string()),
            AuthError::AccountDisabled => ApiError::Forbidden(e.to_string()),
            AuthError::Internal(inner) => ApiError::Internal(inner),
        }
    }
}

/// Public view of a user row; the password hash never leaves this module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub created_at: String,
    pub last_login: Option<String>,
    pub is_active: bool,
}

#[derive(sqlx::FromRow)]
struct CredentialRow {
    id: i64,
    password_hash: String,
    is_active: bool,
}

const USER_COLUMNS: &str = "id, username, email, created_at, last_login, is_active";

/// Hash with a fresh random salt.
pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    hash_password_with_salt(password, salt.as_str())
}

/// Argon2 PHC string for `password` under a given B64 `salt`. The same
/// password and salt always produce the same string.
pub fn hash_password_with_salt(password: &str, salt: &str) -> anyhow::Result<String> {
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), salt)
        .map_err(|e| anyhow!("failed to hash password: {}", e))?;
    Ok(hash.to_string())
}

/// `false` for a wrong password or an unparseable stored hash.
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    let parsed = match PasswordHash::new(stored_hash) {
        Ok(h) => h,
        Err(e) => {
            warn!("invalid password hash in db: {}", e);
            return false;
        }
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Create an account after validating the email and password strength.
pub async fn register(
    pool: &SqlitePool,
    username: &str,
    email: &str,
    password: &str,
) -> Result<User, AuthError> {
    let username = username.trim();
    let email = email.trim();
    if username.is_empty() {
        return Err(AuthError::InvalidUsername);
    }
    if !security::validate_email(email) {
        return Err(AuthError::InvalidEmail);
    }
    security::validate_password(password).map_err(AuthError::WeakPassword)?;

    let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM users WHERE username = ? OR email = ?")
        .bind(username)
        .bind(email)
        .fetch_optional(pool)
        .await
        .context("failed to check existing users")?;
    if existing.is_some() {
        return Err(AuthError::UserExists);
    }

    let password_hash = hash_password(password)?;
    let res = sqlx::query(
        "INSERT INTO users (username, email, password_hash, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(username)
    .bind(email)
    .bind(&password_hash)
    .bind(common::now_timestamp())
    .execute(pool)
    .await;

    let res = match res {
        Ok(r) => r,
        // lost a race with a concurrent registration
        Err(sqlx::Error::Database(db)) if db.message().contains("UNIQUE") => {
            return Err(AuthError::UserExists)
        }
        Err(e) => return Err(AuthError::Internal(anyhow::Error::new(e).context("failed to insert user"))),
    };

    info!(user_id = res.last_insert_rowid(), username, "user registered");
    get_user(pool, res.last_insert_rowid())
        .await?
        .ok_or_else(|| AuthError::Internal(anyhow!("registered user vanished")))
}

/// `login` may be either the username or the email address.
pub async fn authenticate(pool: &SqlitePool, login: &str, password: &str) -> Result<User, AuthError> {
    let row = sqlx::query_as::<_, CredentialRow>(
        "SELECT id, password_hash, is_active FROM users WHERE username = ? OR email = ?",
    )
    .bind(login)
    .bind(login)
    .fetch_optional(pool)
    .await
    .context("db error on login")?;

    let Some(row) = row else {
        return Err(AuthError::InvalidCredentials);
    };
    if !row.is_active {
        return Err(AuthError::AccountDisabled);
    }
    if !verify_password(password, &row.password_hash) {
        return Err(AuthError::InvalidCredentials);
    }

    sqlx::query("UPDATE users SET last_login = ? WHERE id = ?")
        .bind(common::now_timestamp())
        .bind(row.id)
        .execute(pool)
        .await
        .context("failed to update last login")?;

    get_user(pool, row.id)
        .await?
        .ok_or(AuthError::InvalidCredentials)
}

pub async fn get_user(pool: &SqlitePool, user_id: i64) -> anyhow::Result<Option<User>> {
    let sql = format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS);
    sqlx::query_as::<_, User>(&sql)
        .bind(user_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch user")
}

/// Newest accounts first.
pub async fn list_users(pool: &SqlitePool, limit: i64, offset: i64) -> anyhow::Result<Vec<User>> {
    let sql = format!(
        "SELECT {} FROM users ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
        USER_COLUMNS
    );
    sqlx::query_as::<_, User>(&sql)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
        .context("failed to list users")
}

pub async fn count_users(pool: &SqlitePool) -> anyhow::Result<i64> {
    sqlx::query_scalar("SELECT COUNT(*) FROM users")
        .fetch_one(pool)
        .await
        .context("failed to count users")
}

/// Enable or disable an account. Disabling also ends its sessions.
pub async fn set_user_active(pool: &SqlitePool, user_id: i64, active: bool) -> anyhow::Result<bool> {
    let res = sqlx::query("UPDATE users SET is_active = ? WHERE id = ?")
        .bind(active)
        .bind(user_id)
        .execute(pool)
        .await
        .context("failed to update user status")?;
    if !active {
        crate::sessions::invalidate_all_sessions(pool, user_id).await?;
    }
    Ok(res.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_salt_same_verifier() {
        let salt = SaltString::generate(&mut OsRng);
        let a = hash_password_with_salt("Corr3ct!Horse", salt.as_str()).unwrap();
        let b = hash_password_with_salt("Corr3ct!Horse", salt.as_str()).unwrap();
        assert_eq!(a, b);
        assert!(verify_password("Corr3ct!Horse", &a));
        assert!(!verify_password("corr3ct!horse", &a));
        assert!(!verify_password("Corr3ct!Horse", "not-a-phc-string"));
    }

    #[test]
    fn auth_errors_map_to_statuses() {
        use rocket::http::Status;
        assert_eq!(ApiError::from(AuthError::UserExists).status(), Status::Conflict);
        assert_eq!(ApiError::from(AuthError::InvalidCredentials).status(), Status::Unauthorized);
        assert_eq!(
            ApiError::from(AuthError::WeakPassword(vec!["too short".into()])).to_string(),
            "too short"
        );
    }
}
