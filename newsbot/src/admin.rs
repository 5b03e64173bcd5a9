//! Administrator API mounted under `/admin`: login, dashboard metrics,
//! user and content moderation, runtime settings, reports and security views.

use rocket::http::{Cookie, CookieJar, SameSite};
use rocket::serde::json::Json;
use rocket::{get, post, routes, FromForm, Route, State};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use common::Config;

use crate::analytics;
use crate::auth::guards::ADMIN_COOKIE;
use crate::auth::{self, jwt, AdminUser};
use crate::error::{ApiError, ApiResult};
use crate::export;
use crate::security::RateLimit;
use crate::server::{AppState, ClientInfo};
use crate::sessions;
use crate::storage::{self, ArticleQuery};

/// Admin tokens are short-lived; there is no refresh.
const ADMIN_TOKEN_HOURS: i64 = 8;

/// Knobs an administrator can change without a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Articles indexed for search per news fetch
    pub max_articles: usize,
    /// News cache TTL in seconds
    pub cache_duration: u64,
    /// Record article analyses and user interactions
    pub enable_analytics: bool,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            max_articles: 10,
            cache_duration: 300,
            enable_analytics: true,
        }
    }
}

const MAX_ARTICLES: std::ops::RangeInclusive<u64> = 1..=100;
const CACHE_DURATION: std::ops::RangeInclusive<u64> = 1..=86_400;

fn clamp_setting(name: &str, value: u64, range: &std::ops::RangeInclusive<u64>) -> u64 {
    let clamped = value.clamp(*range.start(), *range.end());
    if clamped != value {
        warn!(setting = name, value, clamped, "config value out of range; clamped");
    }
    clamped
}

impl RuntimeSettings {
    /// Startup values from `[news] index_limit` and `[cache] news_ttl_seconds`,
    /// clamped to the ranges [`RuntimeSettings::apply`] accepts.
    pub fn from_config(cfg: &Config) -> Self {
        let d = Self::default();
        let max_articles = cfg
            .news
            .as_ref()
            .and_then(|n| n.index_limit)
            .map_or(d.max_articles as u64, |v| v as u64);
        let cache_duration = cfg
            .cache
            .as_ref()
            .and_then(|c| c.news_ttl_seconds)
            .unwrap_or(d.cache_duration);
        Self {
            max_articles: clamp_setting("max_articles", max_articles, &MAX_ARTICLES) as usize,
            cache_duration: clamp_setting("cache_duration", cache_duration, &CACHE_DURATION),
            enable_analytics: d.enable_analytics,
        }
    }

    /// Apply a partial update. API keys live in the environment and are
    /// rejected here, as are unknown keys and out-of-range values.
    pub fn apply(&mut self, update: &Map<String, Value>) -> Result<(), String> {
        let mut next = self.clone();
        for (key, value) in update {
            match key.as_str() {
                "max_articles" => {
                    next.max_articles = value
                        .as_u64()
                        .filter(|v| MAX_ARTICLES.contains(v))
                        .ok_or("max_articles must be between 1 and 100")?
                        as usize;
                }
                "cache_duration" => {
                    next.cache_duration = value
                        .as_u64()
                        .filter(|v| CACHE_DURATION.contains(v))
                        .ok_or("cache_duration must be between 1 and 86400 seconds")?;
                }
                "enable_analytics" => {
                    next.enable_analytics =
                        value.as_bool().ok_or("enable_analytics must be a boolean")?;
                }
                "news_api_key" | "openai_api_key" | "llm_api_key" => {
                    return Err(format!("{} is read-only; set it in the environment", key));
                }
                other => return Err(format!("Unknown setting: {}", other)),
            }
        }
        *self = next;
        Ok(())
    }
}

/// `****` plus the last four characters, or empty when unset.
pub fn mask_secret(secret: Option<&str>) -> String {
    match secret {
        None => String::new(),
        Some(s) if s.chars().count() <= 8 => "****".to_string(),
        Some(s) => {
            let tail: String = s.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
            format!("****{}", tail)
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AdminLogin {
    pub username: String,
    pub password: String,
}

#[post("/login", data = "<body>")]
async fn login(
    state: &State<AppState>,
    _limit: RateLimit<10, 900>,
    client: ClientInfo,
    cookies: &CookieJar<'_>,
    body: Json<AdminLogin>,
) -> ApiResult<Json<Value>> {
    let admin = state.config.admin.clone().unwrap_or_default();
    let Some(password_hash) = admin.password_hash.as_deref() else {
        return Err(ApiError::NotConfigured(
            "Admin login is not configured".to_string(),
        ));
    };
    let username = admin.username.as_deref().unwrap_or("admin");

    if body.username != username || !auth::verify_password(&body.password, password_hash) {
        warn!(username = %body.username, "admin: failed login");
        if let Err(log_err) = state
            .rate_limiter
            .log_security_event(
                "admin_login_failed",
                client.ip.as_deref(),
                &json!({ "username": body.username }),
            )
            .await
        {
            warn!("failed to log security event: {:#}", log_err);
        }
        return Err(ApiError::Unauthorized("Invalid credentials".to_string()));
    }

    let token = jwt::issue_admin_token(&state.jwt_secret, username, ADMIN_TOKEN_HOURS)?;
    cookies.add_private(
        Cookie::build((ADMIN_COOKIE, token.clone()))
            .http_only(true)
            .same_site(SameSite::Strict)
            .max_age(rocket::time::Duration::hours(ADMIN_TOKEN_HOURS)),
    );
    info!(username, "admin: logged in");
    Ok(Json(json!({ "success": true, "token": token, "username": username })))
}

#[post("/logout")]
async fn logout(cookies: &CookieJar<'_>) -> Json<Value> {
    cookies.remove_private(ADMIN_COOKIE);
    Json(json!({ "success": true }))
}

#[get("/dashboard")]
async fn dashboard(state: &State<AppState>, _admin: AdminUser) -> ApiResult<Json<Value>> {
    let pool = &state.db;
    let trending = analytics::trending_topics(pool, 7).await?;
    Ok(Json(json!({
        "total_articles": storage::count_articles(pool, &ArticleQuery::default()).await?,
        "total_users": auth::count_users(pool).await?,
        "active_sessions": sessions::count_active_sessions(pool).await?,
        "avg_reliability": storage::average_reliability(pool).await?.map(analytics::round2),
        "trending_topics": trending.into_iter().take(5).collect::<Vec<_>>(),
        "sentiment_trends": analytics::sentiment_trends(pool, 30).await?,
        "category_stats": analytics::category_analytics(pool).await?,
        "cache": state.cache.stats().await?,
        "rate_limits": state.rate_limiter.stats().await?,
        "uptime_seconds": state.uptime_seconds(),
    })))
}

#[derive(Debug, FromForm)]
struct AnalyticsParams {
    days: Option<i64>,
    #[field(name = "type")]
    kind: Option<String>,
}

#[get("/api/analytics/data?<params..>")]
async fn analytics_data(
    state: &State<AppState>,
    _admin: AdminUser,
    params: AnalyticsParams,
) -> ApiResult<Json<Value>> {
    let pool = &state.db;
    let days = params.days.unwrap_or(30).clamp(1, 365);
    let data = match params.kind.as_deref().unwrap_or("overview") {
        "overview" => {
            let trending = analytics::trending_topics(pool, days).await?;
            json!({
                "total_articles": storage::count_articles(pool, &ArticleQuery::default()).await?,
                "total_users": auth::count_users(pool).await?,
                "avg_reliability": storage::average_reliability(pool).await?.map(analytics::round2),
                "trending_topics": trending.into_iter().take(10).collect::<Vec<_>>(),
            })
        }
        "sentiment" => serde_json::to_value(analytics::sentiment_trends(pool, days).await?)
            .map_err(anyhow::Error::from)?,
        "categories" => serde_json::to_value(analytics::category_analytics(pool).await?)
            .map_err(anyhow::Error::from)?,
        "activity" => serde_json::to_value(analytics::user_activity_summary(pool, None, days).await?)
            .map_err(anyhow::Error::from)?,
        other => return Err(ApiError::bad_request(format!("Invalid data type: {}", other))),
    };
    Ok(Json(data))
}

#[get("/users?<limit>&<offset>")]
async fn users(
    state: &State<AppState>,
    _admin: AdminUser,
    limit: Option<i64>,
    offset: Option<i64>,
) -> ApiResult<Json<Value>> {
    let limit = limit.unwrap_or(50).clamp(1, 500);
    let offset = offset.unwrap_or(0).max(0);
    Ok(Json(json!({
        "users": auth::list_users(&state.db, limit, offset).await?,
        "total": auth::count_users(&state.db).await?,
        "activity": analytics::user_activity_summary(&state.db, None, 30).await?,
    })))
}

async fn set_user_status(state: &AppState, admin: &AdminUser, user_id: i64, active: bool) -> ApiResult<Json<Value>> {
    if !auth::set_user_active(&state.db, user_id, active).await? {
        return Err(ApiError::NotFound(format!("User {} not found", user_id)));
    }
    info!(admin = %admin.username, user_id, active, "admin: user status changed");
    Ok(Json(json!({ "success": true, "user_id": user_id, "is_active": active })))
}

#[post("/users/<user_id>/activate")]
async fn activate_user(state: &State<AppState>, admin: AdminUser, user_id: i64) -> ApiResult<Json<Value>> {
    set_user_status(state, &admin, user_id, true).await
}

#[post("/users/<user_id>/deactivate")]
async fn deactivate_user(state: &State<AppState>, admin: AdminUser, user_id: i64) -> ApiResult<Json<Value>> {
    set_user_status(state, &admin, user_id, false).await
}

#[get("/content?<category>&<limit>&<offset>")]
async fn content(
    state: &State<AppState>,
    _admin: AdminUser,
    category: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
) -> ApiResult<Json<Value>> {
    let query = ArticleQuery {
        category,
        include_inactive: true,
        limit: limit.unwrap_or(50).clamp(1, 500),
        offset: offset.unwrap_or(0).max(0),
        ..Default::default()
    };
    Ok(Json(json!({
        "articles": storage::list_articles(&state.db, &query).await?,
        "total": storage::count_articles(&state.db, &query).await?,
    })))
}

async fn set_article_status(
    state: &AppState,
    admin: &AdminUser,
    article_id: &str,
    active: bool,
) -> ApiResult<Json<Value>> {
    if !storage::set_article_active(&state.db, article_id, active).await? {
        return Err(ApiError::NotFound(format!("Article {} not found", article_id)));
    }
    info!(admin = %admin.username, article_id, active, "admin: article moderated");
    Ok(Json(json!({ "success": true, "article_id": article_id, "is_active": active })))
}

#[post("/content/<article_id>/restore")]
async fn restore_article(state: &State<AppState>, admin: AdminUser, article_id: &str) -> ApiResult<Json<Value>> {
    set_article_status(state, &admin, article_id, true).await
}

#[post("/content/<article_id>/hide")]
async fn hide_article(state: &State<AppState>, admin: AdminUser, article_id: &str) -> ApiResult<Json<Value>> {
    set_article_status(state, &admin, article_id, false).await
}

fn settings_view(state: &AppState, settings: &RuntimeSettings) -> Value {
    let news_key_env = state
        .config
        .news
        .as_ref()
        .and_then(|n| n.api_key_env.clone())
        .unwrap_or_else(|| "NEWS_API_KEY".to_string());
    let llm_key_env = state
        .config
        .llm
        .as_ref()
        .and_then(|l| l.remote.as_ref())
        .and_then(|r| r.api_key_env.clone());

    json!({
        "news_api_key": mask_secret(Config::secret_from_env(Some(&news_key_env)).as_deref()),
        "llm_api_key": mask_secret(Config::secret_from_env(llm_key_env.as_deref()).as_deref()),
        "max_articles": settings.max_articles,
        "cache_duration": settings.cache_duration,
        "enable_analytics": settings.enable_analytics,
    })
}

#[get("/settings")]
async fn get_settings(state: &State<AppState>, _admin: AdminUser) -> Json<Value> {
    let settings = state.settings.read().await.clone();
    Json(settings_view(state, &settings))
}

#[post("/api/settings/update", data = "<body>")]
async fn update_settings(
    state: &State<AppState>,
    admin: AdminUser,
    body: Json<Value>,
) -> ApiResult<Json<Value>> {
    let Value::Object(update) = body.into_inner() else {
        return Err(ApiError::bad_request("Settings must be a JSON object"));
    };
    let updated = {
        let mut settings = state.settings.write().await;
        settings.apply(&update).map_err(ApiError::BadRequest)?;
        settings.clone()
    };
    info!(admin = %admin.username, ?updated, "admin: settings updated");
    Ok(Json(json!({
        "success": true,
        "message": "Settings updated successfully",
        "settings": settings_view(state, &updated),
    })))
}

#[get("/reports/<kind>?<days>")]
async fn report(
    state: &State<AppState>,
    _admin: AdminUser,
    kind: &str,
    days: Option<i64>,
) -> ApiResult<Json<Value>> {
    let days = days.unwrap_or(30).clamp(1, 365);
    let report = match kind {
        "usage" => export::usage_report(&state.db, days).await?,
        "performance" => {
            export::performance_report(&state.db, &state.cache, &state.rate_limiter, state.uptime_seconds())
                .await?
        }
        "engagement" => export::engagement_report(&state.db, days).await?,
        other => return Err(ApiError::NotFound(format!("Unknown report: {}", other))),
    };
    Ok(Json(report))
}

#[get("/security/stats")]
async fn security_stats(state: &State<AppState>, _admin: AdminUser) -> ApiResult<Json<Value>> {
    Ok(Json(serde_json::to_value(state.rate_limiter.stats().await?).map_err(anyhow::Error::from)?))
}

#[get("/security/events?<limit>")]
async fn security_events(
    state: &State<AppState>,
    _admin: AdminUser,
    limit: Option<i64>,
) -> ApiResult<Json<Value>> {
    let events = state
        .rate_limiter
        .recent_events(limit.unwrap_or(100).clamp(1, 1000))
        .await?;
    Ok(Json(json!({ "events": events })))
}

/// Routes for mounting under `/admin`.
pub fn routes() -> Vec<Route> {
    routes![
        login,
        logout,
        dashboard,
        analytics_data,
        users,
        activate_user,
        deactivate_user,
        content,
        restore_article,
        hide_article,
        get_settings,
        update_settings,
        report,
        security_stats,
        security_events,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_updates_are_validated_atomically() {
        let mut s = RuntimeSettings::default();
        let ok = json!({ "max_articles": 25, "enable_analytics": false });
        s.apply(ok.as_object().unwrap()).unwrap();
        assert_eq!(s.max_articles, 25);
        assert!(!s.enable_analytics);

        let bad = json!({ "cache_duration": 600, "max_articles": 0 });
        assert!(s.apply(bad.as_object().unwrap()).is_err());
        assert_eq!(s.cache_duration, 300);

        let secret = json!({ "news_api_key": "abc" });
        assert!(s.apply(secret.as_object().unwrap()).unwrap_err().contains("read-only"));
    }

    #[test]
    fn config_values_are_clamped_to_settings_ranges() {
        let cfg = Config {
            news: Some(common::NewsConfig {
                index_limit: Some(0),
                ..Default::default()
            }),
            cache: Some(common::CacheConfig {
                news_ttl_seconds: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        };
        let s = RuntimeSettings::from_config(&cfg);
        assert_eq!(s.max_articles, 1);
        assert_eq!(s.cache_duration, 1);

        let cfg = Config {
            news: Some(common::NewsConfig {
                index_limit: Some(5_000),
                ..Default::default()
            }),
            cache: Some(common::CacheConfig {
                news_ttl_seconds: Some(u64::MAX),
                ..Default::default()
            }),
            ..Default::default()
        };
        let s = RuntimeSettings::from_config(&cfg);
        assert_eq!(s.max_articles, 100);
        assert_eq!(s.cache_duration, 86_400);

        assert_eq!(RuntimeSettings::from_config(&Config::default()), RuntimeSettings::default());
    }

    #[test]
    fn secrets_are_masked() {
        assert_eq!(mask_secret(None), "");
        assert_eq!(mask_secret(Some("short")), "****");
        assert_eq!(mask_secret(Some("0123456789abcdef")), "****cdef");
    }
}
