use anyhow::{Context, Result};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

pub const ROLE_USER: &str = "user";
pub const ROLE_ADMIN: &str = "admin";

/// JWT claims. For users `sub` is the user id and `sid` the session token;
/// admin tokens carry the admin username and no session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    pub role: String,
    pub iat: usize,
    pub exp: usize,
}

impl Claims {
    pub fn is_admin(&self) -> bool {
        self.role == ROLE_ADMIN
    }

    pub fn user_id(&self) -> Option<i64> {
        self.sub.parse().ok()
    }
}

fn sign(secret: &str, claims: &Claims) -> Result<String> {
    encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .context("failed to create jwt")
}

/// Wrap a session token for `user_id`, expiring at `exp` (epoch seconds).
pub fn issue_session_token(secret: &str, user_id: i64, session_token: &str, exp: i64) -> Result<String> {
    let claims = Claims {
        sub: user_id.to_string(),
        sid: Some(session_token.to_string()),
        role: ROLE_USER.to_string(),
        iat: Utc::now().timestamp() as usize,
        exp: exp.max(0) as usize,
    };
    sign(secret, &claims)
}

pub fn issue_admin_token(secret: &str, username: &str, ttl_hours: i64) -> Result<String> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: username.to_string(),
        sid: None,
        role: ROLE_ADMIN.to_string(),
        iat: now as usize,
        exp: (now + ttl_hours * 3600) as usize,
    };
    sign(secret, &claims)
}

/// Verify signature and expiry.
pub fn decode_token(secret: &str, token: &str) -> Result<Claims> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .context("invalid or expired token")?;
    Ok(data.claims)
}
