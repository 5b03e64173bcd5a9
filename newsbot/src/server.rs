use std::collections::BTreeMap;
use std::convert::Infallible;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rocket::figment::Figment;
use rocket::http::{ContentType, Cookie, CookieJar, Header, SameSite, Status};
use rocket::request::{FromRequest, Outcome, Request};
use rocket::response::{self, Responder, Response};
use rocket::serde::json::Json;
use rocket::{catch, catchers, get, post, routes, Build, FromForm, Rocket, State};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use common::Config;

use crate::admin::{self, RuntimeSettings};
use crate::analytics::{self, AnalysisRecord, Interaction};
use crate::auth::guards::SESSION_COOKIE;
use crate::auth::{self, jwt, preferences, AdminUser, AuthError, AuthUser, OptionalUser};
use crate::cache::{self, CacheManager, NewsCache, NewsCacheTtls};
use crate::error::{ApiError, ApiResult};
use crate::export::{self, ExportFile, ExportFormat};
use crate::llm::Analyzer;
use crate::news::{NewsClient, NewsFeed, NewsRequest};
use crate::search::{self, SearchFilters, SortBy};
use crate::security::{self, RateLimit, RateLimitHeaders, RateLimiter, SecurityHeaders};
use crate::sessions;
use crate::storage;

/// Longest article or snippet accepted by the analysis endpoints.
const MAX_CONTENT_CHARS: usize = 50_000;

/// Application state stored inside Rocket managed state.
pub struct AppState {
    pub started_at: DateTime<Utc>,
    pub config: Arc<Config>,
    pub db: SqlitePool,
    pub analyzer: Analyzer,
    pub news: NewsClient,
    pub cache: CacheManager,
    pub news_cache: NewsCache,
    pub rate_limiter: RateLimiter,
    pub settings: RwLock<RuntimeSettings>,
    pub jwt_secret: String,
}

impl AppState {
    pub fn new(config: Config, db: SqlitePool, analyzer: Analyzer, news: NewsClient) -> Self {
        let cache_cfg = config.cache_section();
        let cache = CacheManager::new(
            db.clone(),
            cache_cfg
                .default_ttl_seconds
                .map(Duration::from_secs)
                .unwrap_or(cache::DEFAULT_TTL),
        );
        let news_cache = NewsCache::new(cache.clone(), NewsCacheTtls::from_config(&cache_cfg));

        let jwt_secret = Config::secret_from_env(
            config.auth.as_ref().and_then(|a| a.jwt_secret_env.as_deref()),
        )
        .unwrap_or_else(|| {
            warn!("JWT secret not configured; using a random one, sessions will not survive restarts");
            sessions::generate_token()
        });

        Self {
            started_at: Utc::now(),
            settings: RwLock::new(RuntimeSettings::from_config(&config)),
            config: Arc::new(config),
            rate_limiter: RateLimiter::new(db.clone()),
            db,
            analyzer,
            news,
            cache,
            news_cache,
            jwt_secret,
        }
    }

    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }

    pub fn session_days(&self) -> i64 {
        self.config
            .auth
            .as_ref()
            .and_then(|a| a.session_days)
            .unwrap_or(sessions::DEFAULT_SESSION_DAYS)
            .clamp(1, 365)
    }

    async fn analytics_enabled(&self) -> bool {
        self.settings.read().await.enable_analytics
    }

    /// Best effort; analytics failures never fail the request.
    async fn track(&self, interaction: Interaction) {
        if !self.analytics_enabled().await {
            return;
        }
        if let Err(e) = analytics::track_interaction(&self.db, &interaction).await {
            warn!(action = %interaction.action, "failed to track interaction: {:#}", e);
        }
    }
}

/// Caller address and user agent, recorded with sessions and security events.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ClientInfo {
    type Error = Infallible;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        Outcome::Success(ClientInfo {
            ip: req.client_ip().map(|ip| ip.to_string()),
            user_agent: req
                .headers()
                .get_one("User-Agent")
                .map(|ua| ua.chars().take(256).collect()),
        })
    }
}

/// An export sent as a file attachment.
pub struct Download(pub ExportFile);

impl<'r> Responder<'r, 'static> for Download {
    fn respond_to(self, _req: &'r Request<'_>) -> response::Result<'static> {
        let ExportFile {
            filename,
            format,
            body,
        } = self.0;
        let content_type = match format {
            ExportFormat::Json => ContentType::JSON,
            ExportFormat::Csv => ContentType::new("text", "csv"),
            ExportFormat::Xml => ContentType::new("application", "xml"),
        };
        Response::build()
            .header(content_type)
            .header(Header::new(
                "Content-Disposition",
                format!("attachment; filename={}", filename),
            ))
            .sized_body(body.len(), Cursor::new(body))
            .ok()
    }
}

fn parse_format(format: Option<&str>) -> ApiResult<ExportFormat> {
    let format = format.unwrap_or("json");
    ExportFormat::parse(format)
        .ok_or_else(|| ApiError::bad_request(format!("Unsupported export format: {}", format)))
}

fn require_content(content: Option<String>, purpose: &str) -> ApiResult<String> {
    let content = content.map(|c| c.trim().to_string()).unwrap_or_default();
    if content.is_empty() {
        return Err(ApiError::bad_request(format!("No content provided for {}", purpose)));
    }
    if content.chars().count() > MAX_CONTENT_CHARS {
        return Err(ApiError::bad_request(format!(
            "Content too long (max {} characters)",
            MAX_CONTENT_CHARS
        )));
    }
    Ok(content)
}

/// A failing cache read is treated as a miss.
fn cached<T>(lookup: anyhow::Result<Option<T>>) -> Option<T> {
    lookup.unwrap_or_else(|e| {
        warn!("cache read failed: {:#}", e);
        None
    })
}

fn log_cache_write(result: anyhow::Result<()>) {
    if let Err(e) = result {
        warn!("cache write failed: {:#}", e);
    }
}

#[get("/health")]
async fn health() -> &'static str {
    "OK"
}

/// Response structure for `/api/v1/status`.
#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: i64,
    users_count: i64,
    news_api_configured: bool,
    llm_model: Option<String>,
}

#[get("/api/v1/status")]
async fn status(state: &State<AppState>) -> ApiResult<Json<StatusResponse>> {
    Ok(Json(StatusResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.uptime_seconds(),
        users_count: auth::count_users(&state.db).await?,
        news_api_configured: state.news.is_configured(),
        llm_model: state.analyzer.model_name().map(str::to_string),
    }))
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[post("/api/auth/register", data = "<body>")]
async fn register(
    state: &State<AppState>,
    _limit: RateLimit<20, 3600>,
    body: Json<RegisterRequest>,
) -> ApiResult<(Status, Json<Value>)> {
    let user = auth::register(&state.db, body.username.trim(), body.email.trim(), &body.password).await?;
    Ok((Status::Created, Json(json!({ "success": true, "user": user }))))
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    /// Username or email
    #[serde(alias = "username", alias = "email")]
    pub login: String,
    pub password: String,
}

#[post("/api/auth/login", data = "<body>")]
async fn login(
    state: &State<AppState>,
    _limit: RateLimit<20, 900>,
    client: ClientInfo,
    cookies: &CookieJar<'_>,
    body: Json<LoginRequest>,
) -> ApiResult<Json<Value>> {
    let user = match auth::authenticate(&state.db, body.login.trim(), &body.password).await {
        Ok(user) => user,
        Err(e) => {
            if matches!(e, AuthError::InvalidCredentials) {
                let details = json!({ "login": body.login.trim() });
                if let Err(log_err) = state
                    .rate_limiter
                    .log_security_event("login_failed", client.ip.as_deref(), &details)
                    .await
                {
                    warn!("failed to log security event: {:#}", log_err);
                }
            }
            return Err(e.into());
        }
    };

    let days = state.session_days();
    let session = sessions::create_session(
        &state.db,
        user.id,
        client.ip.as_deref(),
        client.user_agent.as_deref(),
        days,
    )
    .await?;
    let exp = Utc::now().timestamp() + days * 86_400;
    let token = jwt::issue_session_token(&state.jwt_secret, user.id, &session.token, exp)?;

    cookies.add_private(
        Cookie::build((SESSION_COOKIE, token.clone()))
            .http_only(true)
            .same_site(SameSite::Lax)
            .max_age(rocket::time::Duration::days(days)),
    );
    Ok(Json(json!({
        "success": true,
        "token": token,
        "user": user,
        "expires_at": session.expires_at,
    })))
}

#[post("/api/auth/logout")]
async fn logout(
    state: &State<AppState>,
    user: OptionalUser,
    cookies: &CookieJar<'_>,
) -> ApiResult<Json<Value>> {
    if let Some(user) = user.0 {
        sessions::invalidate_session(&state.db, &user.session.token).await?;
        info!(user_id = user.id(), "user logged out");
    }
    cookies.remove_private(SESSION_COOKIE);
    Ok(Json(json!({ "success": true })))
}

#[derive(Serialize)]
struct NewsResponse {
    #[serde(flatten)]
    feed: NewsFeed,
    cached: bool,
}

#[get("/api/news?<category>&<q>&<country>")]
async fn news(
    state: &State<AppState>,
    _limit: RateLimit<100, 3600>,
    user: OptionalUser,
    category: Option<String>,
    q: Option<String>,
    country: Option<String>,
) -> ApiResult<Json<NewsResponse>> {
    let category = category.unwrap_or_else(|| "general".to_string()).to_lowercase();
    if !search::CATEGORIES.contains(&category.as_str()) {
        return Err(ApiError::bad_request(format!("Unknown category: {}", category)));
    }
    let query = q.map(|q| q.trim().to_string()).filter(|q| !q.is_empty());
    if let Some(q) = &query {
        security::validate_search_query(q).map_err(ApiError::BadRequest)?;
    }

    let news_cfg = state.config.news.clone().unwrap_or_default();
    let country = match country.map(|c| c.trim().to_lowercase()) {
        Some(c) if c.len() == 2 && c.chars().all(|ch| ch.is_ascii_alphabetic()) => c,
        Some(c) => return Err(ApiError::bad_request(format!("Invalid country code: {}", c))),
        None => news_cfg.default_country.unwrap_or_else(|| "us".to_string()),
    };

    if let Some(feed) = cached(
        state
            .news_cache
            .get_news::<NewsFeed>(&category, query.as_deref(), &country)
            .await,
    ) {
        debug!(%category, %country, "news: cache hit");
        return Ok(Json(NewsResponse { feed, cached: true }));
    }

    let request = NewsRequest {
        category: category.clone(),
        query: query.clone(),
        country: country.clone(),
        page_size: news_cfg.page_size.unwrap_or(20).clamp(1, 100),
    };
    let feed = state.news.fetch(&request).await?;

    let settings = state.settings.read().await.clone();
    log_cache_write(
        state
            .news_cache
            .set_news_with_ttl(
                &category,
                query.as_deref(),
                &country,
                &feed,
                Duration::from_secs(settings.cache_duration),
            )
            .await,
    );

    for article in feed.articles.iter().take(settings.max_articles) {
        if let Err(e) = search::index_article(&state.db, article).await {
            warn!(article_id = %article.article_id, "failed to index article: {:#}", e);
        }
    }

    state
        .track(Interaction {
            user_id: user.id(),
            action: "news".to_string(),
            category: Some(category),
            search_query: query,
            article_id: None,
        })
        .await;

    Ok(Json(NewsResponse {
        feed,
        cached: false,
    }))
}

#[derive(Debug, Deserialize)]
struct SummarizeRequest {
    content: Option<String>,
    language: Option<String>,
}

#[post("/api/summarize", data = "<body>")]
async fn summarize(
    state: &State<AppState>,
    _limit: RateLimit<50, 3600>,
    user: OptionalUser,
    body: Json<SummarizeRequest>,
) -> ApiResult<Json<Value>> {
    let body = body.into_inner();
    let content = require_content(body.content, "summarization")?;
    let language = body.language.unwrap_or_else(|| "English".to_string());
    if !search::LANGUAGES.contains(&language.as_str()) {
        return Err(ApiError::bad_request(format!("Unsupported language: {}", language)));
    }

    let hash = cache::content_hash(&content);
    let interaction = Interaction {
        user_id: user.id(),
        action: "summarize".to_string(),
        ..Default::default()
    };

    if let Some(summary) = cached(state.news_cache.get_summary(&hash, &language).await) {
        state.track(interaction).await;
        return Ok(Json(json!({ "summary": summary, "cached": true, "fallback": false })));
    }

    let outcome = state.analyzer.summarize(&content, &language).await;
    if !outcome.fallback {
        log_cache_write(state.news_cache.set_summary(&hash, &language, &outcome.summary).await);
    }
    state.track(interaction).await;

    Ok(Json(json!({
        "summary": outcome.summary,
        "cached": false,
        "fallback": outcome.fallback,
    })))
}

#[derive(Debug, Deserialize)]
struct ContentRequest {
    content: Option<String>,
    article_id: Option<String>,
}

/// Record the analysis for trend reporting, enriched with the stored article when known.
async fn record_analysis(state: &AppState, content: &str, article_id: Option<&str>, sentiment: &str) {
    if !state.analytics_enabled().await {
        return;
    }
    let article = match article_id {
        Some(id) => storage::get_article(&state.db, id).await.unwrap_or_else(|e| {
            warn!(article_id = id, "failed to load article: {:#}", e);
            None
        }),
        None => None,
    };

    let record = match article {
        Some(a) => AnalysisRecord {
            category: a.category,
            sentiment: Some(sentiment.to_string()),
            reliability_score: a.reliability_score,
            word_count: Some(a.word_count),
            language: a.language,
            keywords: a.keywords,
            source: a.source,
        },
        None => AnalysisRecord {
            sentiment: Some(sentiment.to_string()),
            word_count: Some(content.split_whitespace().count() as i64),
            keywords: analytics::extract_keywords(content, 10),
            ..Default::default()
        },
    };
    if let Err(e) = analytics::record_analysis(&state.db, &record).await {
        warn!("failed to record analysis: {:#}", e);
    }
}

#[post("/api/analyze", data = "<body>")]
async fn analyze(
    state: &State<AppState>,
    _limit: RateLimit<50, 3600>,
    user: OptionalUser,
    body: Json<ContentRequest>,
) -> ApiResult<Json<Value>> {
    let body = body.into_inner();
    let content = require_content(body.content, "analysis")?;
    let hash = cache::content_hash(&content);

    let (sentiment, was_cached) = match cached(state.news_cache.get_sentiment(&hash).await) {
        Some(s) => (s, true),
        None => {
            let s = state.analyzer.sentiment(&content).await.as_str().to_string();
            log_cache_write(state.news_cache.set_sentiment(&hash, &s).await);
            (s, false)
        }
    };

    let mut article_updated = false;
    if let Some(id) = body.article_id.as_deref() {
        article_updated = storage::update_article_sentiment(&state.db, id, &sentiment).await?;
    }
    if !was_cached {
        record_analysis(state, &content, body.article_id.as_deref(), &sentiment).await;
    }
    state
        .track(Interaction {
            user_id: user.id(),
            action: "analyze".to_string(),
            article_id: body.article_id,
            ..Default::default()
        })
        .await;

    Ok(Json(json!({
        "sentiment": sentiment,
        "cached": was_cached,
        "article_updated": article_updated,
    })))
}

#[post("/api/reliability", data = "<body>")]
async fn reliability(
    state: &State<AppState>,
    _limit: RateLimit<50, 3600>,
    body: Json<ContentRequest>,
) -> ApiResult<Json<Value>> {
    let body = body.into_inner();
    let content = require_content(body.content, "reliability analysis")?;
    let score = state.analyzer.reliability(&content).await;

    let mut article_updated = false;
    if let Some(id) = body.article_id.as_deref() {
        article_updated = storage::update_article_reliability(&state.db, id, score).await?;
    }
    Ok(Json(json!({ "score": score, "article_updated": article_updated })))
}

#[post("/api/nlp", data = "<body>")]
async fn nlp(_limit: RateLimit<50, 3600>, body: Json<ContentRequest>) -> ApiResult<Json<Value>> {
    let content = require_content(body.into_inner().content, "text analysis")?;
    Ok(Json(json!({
        "emotion": analytics::detect_emotions(&content),
        "readability": analytics::readability_score(&content),
        "entities": analytics::extract_entities(&content),
        "keywords": analytics::extract_keywords(&content, 10),
    })))
}

#[derive(Debug, Default, FromForm)]
struct SearchParams {
    q: Option<String>,
    category: Option<String>,
    source: Option<String>,
    sentiment: Option<String>,
    language: Option<String>,
    min_reliability: Option<i64>,
    date_from: Option<String>,
    date_to: Option<String>,
    sort: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

#[get("/api/search?<params..>")]
async fn search_articles(
    state: &State<AppState>,
    _limit: RateLimit<200, 3600>,
    user: OptionalUser,
    params: SearchParams,
) -> ApiResult<Json<search::SearchResults>> {
    let query = params.q.as_deref().unwrap_or("").trim().to_string();
    if !query.is_empty() {
        security::validate_search_query(&query).map_err(ApiError::BadRequest)?;
    }

    let filters = SearchFilters {
        category: params.category,
        source: params.source,
        sentiment: params.sentiment,
        language: params.language,
        min_reliability: params.min_reliability,
        date_from: params.date_from,
        date_to: params.date_to,
    }
    .validate();
    let sort = params.sort.as_deref().map(SortBy::parse).unwrap_or_default();

    let results = search::search(
        &state.db,
        &query,
        &filters,
        sort,
        params.limit.unwrap_or(20),
        params.offset.unwrap_or(0),
    )
    .await?;

    if !query.is_empty() {
        if let Err(e) =
            search::track_search(&state.db, user.id(), &query, &filters, results.total_count).await
        {
            warn!("failed to track search: {:#}", e);
        }
        state
            .track(Interaction {
                user_id: user.id(),
                action: "search".to_string(),
                category: filters.category.clone(),
                search_query: Some(query),
                article_id: None,
            })
            .await;
    }
    Ok(Json(results))
}

#[get("/api/search/suggestions?<q>&<limit>")]
async fn search_suggestions(
    state: &State<AppState>,
    _limit: RateLimit<200, 3600>,
    q: Option<String>,
    limit: Option<i64>,
) -> ApiResult<Json<Value>> {
    let suggestions = search::suggestions(
        &state.db,
        q.as_deref().unwrap_or(""),
        limit.unwrap_or(10).clamp(1, 20),
    )
    .await?;
    Ok(Json(json!({ "suggestions": suggestions })))
}

#[get("/api/search/popular?<limit>")]
async fn popular_searches(
    state: &State<AppState>,
    _limit: RateLimit<200, 3600>,
    limit: Option<i64>,
) -> ApiResult<Json<Value>> {
    let popular = search::popular_searches(&state.db, limit.unwrap_or(10).clamp(1, 100)).await?;
    Ok(Json(json!({ "popular": popular })))
}

#[get("/api/user/preferences")]
async fn get_preferences(
    state: &State<AppState>,
    user: AuthUser,
) -> ApiResult<Json<BTreeMap<String, BTreeMap<String, Value>>>> {
    Ok(Json(preferences::get_all_preferences(&state.db, user.id()).await?))
}

/// Body is `{preference_type: value, ...}`; an optional `"category"` string
/// scopes every preference in the request.
#[post("/api/user/preferences", data = "<body>")]
async fn set_preferences(
    state: &State<AppState>,
    user: AuthUser,
    body: Json<Value>,
) -> ApiResult<Json<Value>> {
    let Value::Object(mut prefs) = body.into_inner() else {
        return Err(ApiError::bad_request("Preferences must be a JSON object"));
    };
    let category = match prefs.remove("category") {
        None | Some(Value::Null) => None,
        Some(Value::String(c)) => Some(c),
        Some(_) => return Err(ApiError::bad_request("category must be a string")),
    };
    if prefs.is_empty() {
        return Err(ApiError::bad_request("No preferences provided"));
    }

    for (ptype, value) in &prefs {
        let ptype = security::sanitize_input(ptype);
        preferences::set_preference(&state.db, user.id(), category.as_deref(), &ptype, value).await?;
    }
    Ok(Json(json!({ "success": true, "updated": prefs.len() })))
}

#[get("/api/user/history?<limit>")]
async fn get_history(
    state: &State<AppState>,
    user: AuthUser,
    limit: Option<i64>,
) -> ApiResult<Json<Vec<preferences::ReadingEntry>>> {
    let history =
        preferences::reading_history(&state.db, user.id(), limit.unwrap_or(50).clamp(1, 1000)).await?;
    Ok(Json(history))
}

#[derive(Debug, Deserialize)]
struct ReadRequest {
    article_id: String,
    title: Option<String>,
    category: Option<String>,
    reading_time: Option<i64>,
}

#[post("/api/user/history", data = "<body>")]
async fn add_history(
    state: &State<AppState>,
    user: AuthUser,
    body: Json<ReadRequest>,
) -> ApiResult<Json<Value>> {
    let body = body.into_inner();
    let article_id = body.article_id.trim();
    if article_id.is_empty() {
        return Err(ApiError::bad_request("article_id is required"));
    }
    let title = body.title.as_deref().map(security::sanitize_input);
    preferences::track_reading(
        &state.db,
        user.id(),
        article_id,
        title.as_deref(),
        body.category.as_deref(),
        body.reading_time.unwrap_or(0),
    )
    .await?;
    state
        .track(Interaction {
            user_id: Some(user.id()),
            action: "read".to_string(),
            category: body.category.clone(),
            search_query: None,
            article_id: Some(article_id.to_string()),
        })
        .await;
    Ok(Json(json!({ "success": true })))
}

#[get("/api/user/stats?<days>")]
async fn user_stats(
    state: &State<AppState>,
    user: AuthUser,
    days: Option<i64>,
) -> ApiResult<Json<preferences::ReadingStats>> {
    let days = days.unwrap_or(30).clamp(1, 365);
    Ok(Json(preferences::reading_stats(&state.db, user.id(), days).await?))
}

#[get("/api/trending?<days>")]
async fn trending(state: &State<AppState>, days: Option<i64>) -> ApiResult<Json<Value>> {
    let days = days.unwrap_or(7).clamp(1, 90);
    if let Some(topics) = cached(
        state
            .news_cache
            .get_trending::<Vec<analytics::TrendingTopic>>(days)
            .await,
    ) {
        return Ok(Json(json!({ "trending": topics, "cached": true })));
    }
    let topics = analytics::trending_topics(&state.db, days).await?;
    log_cache_write(state.news_cache.set_trending(days, &topics).await);
    Ok(Json(json!({ "trending": topics, "cached": false })))
}

#[get("/api/analytics/overview?<days>")]
async fn analytics_overview(state: &State<AppState>, days: Option<i64>) -> ApiResult<Json<Value>> {
    let days = days.unwrap_or(30).clamp(1, 365);
    Ok(Json(json!({
        "sentiment_trends": analytics::sentiment_trends(&state.db, days).await?,
        "category_analytics": analytics::category_analytics(&state.db).await?,
        "search_analytics": search::search_analytics(&state.db, days).await?,
    })))
}

#[get("/api/cache/stats")]
async fn cache_stats(state: &State<AppState>) -> ApiResult<Json<cache::CacheStats>> {
    Ok(Json(state.cache.stats().await?))
}

#[post("/api/cache/clear")]
async fn cache_clear(state: &State<AppState>, admin: AdminUser) -> ApiResult<Json<Value>> {
    let removed = state.cache.clear().await?;
    info!(admin = %admin.username, removed, "cache cleared");
    Ok(Json(json!({
        "success": true,
        "message": "Cache cleared successfully",
        "removed": removed,
    })))
}

#[get("/api/export/user-data?<format>")]
async fn export_user_data(
    state: &State<AppState>,
    _limit: RateLimit<10, 3600>,
    user: AuthUser,
    format: Option<String>,
) -> ApiResult<Download> {
    let format = parse_format(format.as_deref())?;
    Ok(Download(export::export_user_data(&state.db, user.id(), format).await?))
}

#[get("/api/export/analytics?<days>&<format>")]
async fn export_analytics(
    state: &State<AppState>,
    _limit: RateLimit<20, 3600>,
    days: Option<i64>,
    format: Option<String>,
) -> ApiResult<Download> {
    let format = parse_format(format.as_deref())?;
    let days = days.unwrap_or(30).clamp(1, 365);
    Ok(Download(export::export_analytics(&state.db, days, format).await?))
}

#[get("/api/export/articles?<category>&<date_from>&<date_to>&<format>")]
async fn export_articles(
    state: &State<AppState>,
    _limit: RateLimit<20, 3600>,
    category: Option<String>,
    date_from: Option<String>,
    date_to: Option<String>,
    format: Option<String>,
) -> ApiResult<Download> {
    let format = parse_format(format.as_deref())?;
    // Same validation rules as search filters.
    let filters = SearchFilters {
        category,
        date_from,
        date_to,
        ..Default::default()
    }
    .validate();
    Ok(Download(
        export::export_articles(&state.db, filters.category, filters.date_from, filters.date_to, format)
            .await?,
    ))
}

#[get("/api/export/backup?<include_users>")]
async fn export_backup(
    state: &State<AppState>,
    _limit: RateLimit<5, 3600>,
    admin: AdminUser,
    include_users: Option<bool>,
) -> ApiResult<Download> {
    let include_users = include_users.unwrap_or(false);
    info!(admin = %admin.username, include_users, "creating backup");
    Ok(Download(
        export::create_backup(&state.db, &state.cache, include_users).await?,
    ))
}

fn error_body(message: &str) -> Json<Value> {
    Json(json!({ "error": message }))
}

#[catch(400)]
fn bad_request() -> Json<Value> {
    error_body("Bad request")
}

#[catch(401)]
fn unauthorized() -> Json<Value> {
    error_body("Authentication required")
}

#[catch(403)]
fn forbidden() -> Json<Value> {
    error_body("Forbidden")
}

#[catch(404)]
fn not_found() -> Json<Value> {
    error_body("Not found")
}

#[catch(422)]
fn unprocessable() -> Json<Value> {
    error_body("Invalid request body")
}

/// The rate limit guard leaves its decision in request-local state; the
/// security headers fairing adds `Retry-After` from the same value.
#[catch(429)]
fn too_many_requests(req: &Request<'_>) -> Json<Value> {
    let retry_after = req
        .local_cache(|| None::<RateLimitHeaders>)
        .as_ref()
        .and_then(|h| h.0.retry_after);
    Json(json!({ "error": "Rate limit exceeded", "retry_after": retry_after }))
}

#[catch(500)]
fn internal_error() -> Json<Value> {
    error_body("Internal server error")
}

/// Rocket figment with `[server]` bind/port and the cookie secret applied.
pub fn figment_from_config(config: &Config) -> Figment {
    let mut fig = rocket::Config::figment();
    if let Some(server) = &config.server {
        if let Some(bind) = &server.bind {
            fig = fig.merge(("address", bind.clone()));
        }
        if let Some(port) = server.port {
            fig = fig.merge(("port", port));
        }
        match Config::secret_from_env(server.secret_key_env.as_deref()) {
            Some(secret) => fig = fig.merge(("secret_key", secret)),
            None => warn!("server.secret_key_env not set; private cookies use a generated key"),
        }
    }
    fig
}

/// Assemble the Rocket instance without launching it (tests drive it with a local client).
pub fn build_rocket(state: AppState, figment: Figment) -> Rocket<Build> {
    rocket::custom(figment)
        .manage(state)
        .attach(SecurityHeaders)
        .mount(
            "/",
            routes![
                health,
                status,
                register,
                login,
                logout,
                news,
                summarize,
                analyze,
                reliability,
                nlp,
                search_articles,
                search_suggestions,
                popular_searches,
                get_preferences,
                set_preferences,
                get_history,
                add_history,
                user_stats,
                trending,
                analytics_overview,
                cache_stats,
                cache_clear,
                export_user_data,
                export_analytics,
                export_articles,
                export_backup,
            ],
        )
        .mount("/admin", admin::routes())
        .register(
            "/",
            catchers![
                bad_request,
                unauthorized,
                forbidden,
                not_found,
                unprocessable,
                too_many_requests,
                internal_error,
            ],
        )
}

/// Build and launch the Rocket server.
///
/// Blocks until Rocket shuts down and returns an error if Rocket fails to start.
/// The pool is expected to be migrated already (`storage::ensure_schema`).
pub async fn launch_rocket(state: AppState) -> Result<()> {
    let fig = figment_from_config(&state.config);

    info!("Starting Rocket HTTP server");
    build_rocket(state, fig)
        .launch()
        .await
        .map_err(|e| anyhow!("Rocket failed: {}", e))?;

    info!("Rocket HTTP server has shut down");
    Ok(())
}
