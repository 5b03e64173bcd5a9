//! Rate limiting, input validation and security response headers.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::Utc;
use regex::Regex;
use rocket::fairing::{Fairing, Info, Kind};
use rocket::http::{Header, Status};
use rocket::request::{FromRequest, Outcome, Request};
use rocket::{Response, State};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::server::AppState;

/// Longest block applied to a client that keeps hammering an endpoint.
pub const MAX_BLOCK_SECONDS: i64 = 300;

const SECURITY_HEADERS: &[(&str, &str)] = &[
    ("X-Content-Type-Options", "nosniff"),
    ("X-Frame-Options", "DENY"),
    ("X-XSS-Protection", "1; mode=block"),
    ("Strict-Transport-Security", "max-age=31536000; includeSubDomains"),
    (
        "Content-Security-Policy",
        "default-src 'self'; img-src 'self' data: https:; connect-src 'self'",
    ),
    ("Referrer-Policy", "strict-origin-when-cross-origin"),
    ("Permissions-Policy", "geolocation=(), microphone=(), camera=()"),
];

/// Outcome of one rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: i64,
    pub remaining: i64,
    /// Epoch seconds at which the current window ends
    pub reset_at: i64,
    /// Seconds the client must wait; set only when denied
    pub retry_after: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStats {
    pub total_requests: i64,
    pub active_blocks: i64,
    pub recent_events: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SecurityEvent {
    pub id: i64,
    pub event_type: String,
    pub identifier: Option<String>,
    pub details: Option<String>,
    pub recorded_at: String,
}

/// Block length after `count` requests against `limit`: doubles per extra
/// request, capped at [`MAX_BLOCK_SECONDS`].
pub fn block_duration(count: i64, limit: i64) -> i64 {
    let exp = (count - limit + 1).clamp(0, 16) as u32;
    2i64.pow(exp).min(MAX_BLOCK_SECONDS)
}

/// Fixed-window rate limiter persisted in the `rate_limits` table.
#[derive(Clone)]
pub struct RateLimiter {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct RateRow {
    request_count: i64,
    window_start: i64,
}

impl RateLimiter {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Count one request from `identifier` against `endpoint`.
    ///
    /// A client blocked on any endpoint is denied everywhere until the block
    /// lapses. Going over `limit` within `window_secs` blocks the client.
    pub async fn is_allowed(
        &self,
        identifier: &str,
        endpoint: &str,
        limit: i64,
        window_secs: i64,
    ) -> Result<RateDecision> {
        let now = Utc::now().timestamp();

        let blocked_until: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(block_until) FROM rate_limits WHERE identifier = ? AND is_blocked = 1 AND block_until > ?",
        )
        .bind(identifier)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .context("failed to check rate limit blocks")?;

        if let Some(until) = blocked_until {
            return Ok(RateDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_at: until,
                retry_after: Some((until - now).max(1)),
            });
        }

        let row = sqlx::query_as::<_, RateRow>(
            "SELECT request_count, window_start FROM rate_limits WHERE identifier = ? AND endpoint = ?",
        )
        .bind(identifier)
        .bind(endpoint)
        .fetch_optional(&self.pool)
        .await
        .context("failed to read rate limit record")?;

        let Some(row) = row else {
            sqlx::query(
                "INSERT INTO rate_limits (identifier, endpoint, request_count, window_start, last_request) VALUES (?, ?, 1, ?, ?)",
            )
            .bind(identifier)
            .bind(endpoint)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await
            .context("failed to create rate limit record")?;
            return Ok(allowed(limit, limit - 1, now + window_secs));
        };

        if row.window_start <= now - window_secs {
            sqlx::query(
                r#"
                UPDATE rate_limits
                SET request_count = 1, window_start = ?, last_request = ?, is_blocked = 0, block_until = NULL
                WHERE identifier = ? AND endpoint = ?
                "#,
            )
            .bind(now)
            .bind(now)
            .bind(identifier)
            .bind(endpoint)
            .execute(&self.pool)
            .await
            .context("failed to reset rate limit window")?;
            return Ok(allowed(limit, limit - 1, now + window_secs));
        }

        if row.request_count >= limit {
            let duration = block_duration(row.request_count, limit);
            let until = now + duration;
            sqlx::query(
                r#"
                UPDATE rate_limits
                SET is_blocked = 1, block_until = ?, request_count = request_count + 1, last_request = ?
                WHERE identifier = ? AND endpoint = ?
                "#,
            )
            .bind(until)
            .bind(now)
            .bind(identifier)
            .bind(endpoint)
            .execute(&self.pool)
            .await
            .context("failed to block client")?;

            warn!(identifier, endpoint, duration, "rate limit exceeded, client blocked");
            self.log_security_event(
                "rate_limit_exceeded",
                Some(identifier),
                &serde_json::json!({
                    "endpoint": endpoint,
                    "request_count": row.request_count,
                    "limit": limit,
                    "block_duration": duration,
                }),
            )
            .await?;

            return Ok(RateDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_at: until,
                retry_after: Some(duration),
            });
        }

        sqlx::query(
            "UPDATE rate_limits SET request_count = request_count + 1, last_request = ? WHERE identifier = ? AND endpoint = ?",
        )
        .bind(now)
        .bind(identifier)
        .bind(endpoint)
        .execute(&self.pool)
        .await
        .context("failed to count request")?;

        Ok(allowed(
            limit,
            limit - row.request_count - 1,
            row.window_start + window_secs,
        ))
    }

    pub async fn log_security_event(
        &self,
        event_type: &str,
        identifier: Option<&str>,
        details: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO security_events (event_type, identifier, details, recorded_at) VALUES (?, ?, ?, ?)",
        )
        .bind(event_type)
        .bind(identifier)
        .bind(details.to_string())
        .bind(common::now_timestamp())
        .execute(&self.pool)
        .await
        .context("failed to log security event")?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<RateLimitStats> {
        let now = Utc::now().timestamp();
        let total_requests: Option<i64> =
            sqlx::query_scalar("SELECT SUM(request_count) FROM rate_limits")
                .fetch_one(&self.pool)
                .await
                .context("failed to sum requests")?;
        let active_blocks: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM rate_limits WHERE is_blocked = 1 AND block_until > ?",
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .context("failed to count blocks")?;
        let recent_events: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM security_events WHERE recorded_at >= ?")
                .bind(common::days_ago_timestamp(1))
                .fetch_one(&self.pool)
                .await
                .context("failed to count security events")?;

        Ok(RateLimitStats {
            total_requests: total_requests.unwrap_or(0),
            active_blocks,
            recent_events,
        })
    }

    pub async fn recent_events(&self, limit: i64) -> Result<Vec<SecurityEvent>> {
        sqlx::query_as::<_, SecurityEvent>(
            "SELECT id, event_type, identifier, details, recorded_at FROM security_events ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to list security events")
    }
}

fn allowed(limit: i64, remaining: i64, reset_at: i64) -> RateDecision {
    RateDecision {
        allowed: true,
        limit,
        remaining: remaining.max(0),
        reset_at,
        retry_after: None,
    }
}

/// Request guard enforcing `LIMIT` requests per `WINDOW` seconds for the
/// matched route and client address.
pub struct RateLimit<const LIMIT: i64, const WINDOW: i64>;

/// Rate limit outcome kept in request-local state for the response fairing
/// and the 429 catcher.
#[derive(Debug, Clone)]
pub struct RateLimitHeaders(pub RateDecision);

#[rocket::async_trait]
impl<'r, const LIMIT: i64, const WINDOW: i64> FromRequest<'r> for RateLimit<LIMIT, WINDOW> {
    type Error = ApiError;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let state = match req.guard::<&State<AppState>>().await {
            Outcome::Success(s) => s,
            _ => {
                return Outcome::Error((
                    Status::InternalServerError,
                    ApiError::Internal(anyhow::anyhow!("application state missing")),
                ))
            }
        };

        let identifier = req
            .client_ip()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let route = req
            .route()
            .and_then(|r| r.name.as_deref())
            .map(str::to_string)
            .unwrap_or_else(|| req.uri().path().to_string());
        let endpoint = format!("{}:{}", req.method(), route);

        match state
            .rate_limiter
            .is_allowed(&identifier, &endpoint, LIMIT, WINDOW)
            .await
        {
            Ok(decision) => {
                req.local_cache(|| Some(RateLimitHeaders(decision.clone())));
                if decision.allowed {
                    Outcome::Success(RateLimit)
                } else {
                    let retry_after = decision.retry_after.unwrap_or(1);
                    Outcome::Error((Status::TooManyRequests, ApiError::RateLimited { retry_after }))
                }
            }
            Err(e) => {
                // A broken limiter table must not take the API down with it.
                warn!("rate limiter unavailable: {:#}", e);
                Outcome::Success(RateLimit)
            }
        }
    }
}

/// Adds the fixed security headers, a permissive CORS origin and, when a
/// rate limit guard ran, the `X-RateLimit-*` headers.
pub struct SecurityHeaders;

#[rocket::async_trait]
impl Fairing for SecurityHeaders {
    fn info(&self) -> Info {
        Info {
            name: "Security headers",
            kind: Kind::Response,
        }
    }

    async fn on_response<'r>(&self, req: &'r Request<'_>, res: &mut Response<'r>) {
        for (name, value) in SECURITY_HEADERS {
            res.set_raw_header(*name, *value);
        }
        res.set_raw_header("Access-Control-Allow-Origin", "*");

        if let Some(RateLimitHeaders(decision)) = req.local_cache(|| None::<RateLimitHeaders>) {
            res.set_header(Header::new("X-RateLimit-Limit", decision.limit.to_string()));
            res.set_header(Header::new("X-RateLimit-Remaining", decision.remaining.to_string()));
            res.set_header(Header::new("X-RateLimit-Reset", decision.reset_at.to_string()));
            if let Some(retry_after) = decision.retry_after {
                res.set_header(Header::new("Retry-After", retry_after.to_string()));
            }
        }
        debug!(path = %req.uri().path(), status = %res.status(), "response");
    }
}

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("static regex compile")
});

static DANGEROUS_QUERY_RE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)<script.*?>.*?</script>",
        r"(?i)javascript:",
        r"(?i)on\w+\s*=",
        r"(?i)eval\s*\(",
        r"(?i)document\.",
        r"(?i)window\.",
        r"(?i)alert\s*\(",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static regex compile"))
    .collect()
});

const SPECIAL_CHARS: &str = "!@#$%^&*(),.?\":{}|<>";

pub fn validate_email(email: &str) -> bool {
    EMAIL_RE.is_match(email)
}

/// Every rule the password breaks, in a stable order.
pub fn validate_password(password: &str) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();
    if password.chars().count() < 8 {
        errors.push("Password must be at least 8 characters long".to_string());
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        errors.push("Password must contain at least one lowercase letter".to_string());
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        errors.push("Password must contain at least one uppercase letter".to_string());
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        errors.push("Password must contain at least one digit".to_string());
    }
    if !password.chars().any(|c| SPECIAL_CHARS.contains(c)) {
        errors.push("Password must contain at least one special character".to_string());
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Escape the characters that matter for HTML injection.
pub fn sanitize_input(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            '/' => out.push_str("&#x2F;"),
            other => out.push(other),
        }
    }
    out
}

pub fn validate_search_query(query: &str) -> Result<(), String> {
    if query.trim().is_empty() {
        return Err("Search query cannot be empty".to_string());
    }
    if query.chars().count() > 500 {
        return Err("Search query too long (max 500 characters)".to_string());
    }
    if DANGEROUS_QUERY_RE.iter().any(|re| re.is_match(query)) {
        return Err("Invalid characters in search query".to_string());
    }
    Ok(())
}

/// At least 20 characters, alphanumeric apart from `-` and `_`.
pub fn validate_api_key(key: &str) -> bool {
    key.chars().count() >= 20
        && key
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .all(|c| c.is_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_duration_doubles_and_caps() {
        assert_eq!(block_duration(5, 5), 2);
        assert_eq!(block_duration(6, 5), 4);
        assert_eq!(block_duration(12, 5), 256);
        assert_eq!(block_duration(13, 5), MAX_BLOCK_SECONDS);
        assert_eq!(block_duration(500, 5), MAX_BLOCK_SECONDS);
    }

    #[test]
    fn password_rules() {
        assert!(validate_password("Str0ng!Pass").is_ok());
        let errors = validate_password("weak").unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors[0].contains("8 characters"));
    }

    #[test]
    fn email_and_api_key_formats() {
        assert!(validate_email("reader@example.org"));
        assert!(!validate_email("reader@example"));
        assert!(!validate_email("not an email"));
        assert!(validate_api_key("abcd-efgh_ijkl-mnop-qrst"));
        assert!(!validate_api_key("short-key"));
        assert!(!validate_api_key("abcd efgh ijkl mnop qrst"));
    }

    #[test]
    fn search_queries_are_screened() {
        assert!(validate_search_query("climate policy").is_ok());
        assert!(validate_search_query("   ").is_err());
        assert!(validate_search_query(&"x".repeat(501)).is_err());
        assert!(validate_search_query("<script>alert(1)</script>").is_err());
        assert!(validate_search_query("img onerror = x").is_err());
        assert!(validate_search_query("JavaScript:void").is_err());
    }

    #[test]
    fn sanitizer_escapes_markup() {
        assert_eq!(
            sanitize_input("<a href='/x'>&</a>"),
            "&lt;a href=&#x27;&#x2F;x&#x27;&gt;&amp;&lt;&#x2F;a&gt;"
        );
    }

    #[tokio::test]
    async fn limiter_blocks_after_limit() {
        let pool = common::init_memory_pool().await.unwrap();
        crate::storage::ensure_schema(&pool).await.unwrap();
        let limiter = RateLimiter::new(pool);

        for expected_remaining in [2, 1, 0] {
            let d = limiter.is_allowed("10.0.0.1", "GET:news", 3, 3600).await.unwrap();
            assert!(d.allowed);
            assert_eq!(d.remaining, expected_remaining);
        }

        let denied = limiter.is_allowed("10.0.0.1", "GET:news", 3, 3600).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(2));

        // the block applies to every endpoint for that client
        let other = limiter.is_allowed("10.0.0.1", "GET:search", 3, 3600).await.unwrap();
        assert!(!other.allowed);

        let someone_else = limiter.is_allowed("10.0.0.2", "GET:news", 3, 3600).await.unwrap();
        assert!(someone_else.allowed);

        let stats = limiter.stats().await.unwrap();
        assert_eq!(stats.active_blocks, 1);
        assert_eq!(stats.recent_events, 1);
        let events = limiter.recent_events(10).await.unwrap();
        assert_eq!(events[0].event_type, "rate_limit_exceeded");
    }
}
