use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use rocket::State;

use super::jwt::{self, Claims};
use super::User;
use crate::error::ApiError;
use crate::server::AppState;
use crate::sessions::{self, Session};

pub const SESSION_COOKIE: &str = "session";
pub const ADMIN_COOKIE: &str = "admin_session";

/// Candidate tokens in the order they are tried: the private cookie `cookie`,
/// then `Authorization: Bearer`.
fn request_tokens(req: &Request<'_>, cookie: &str) -> Vec<String> {
    let cookie = req.cookies().get_private(cookie).map(|c| c.value().to_string());
    let bearer = req
        .headers()
        .get_one("Authorization")
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());
    cookie.into_iter().chain(bearer).collect()
}

async fn app_state<'r>(req: &'r Request<'_>) -> Option<&'r AppState> {
    req.guard::<&State<AppState>>().await.succeeded().map(|s| s.inner())
}

fn unauthorized<T>(msg: &str) -> Outcome<T, ApiError> {
    Outcome::Error((Status::Unauthorized, ApiError::Unauthorized(msg.to_string())))
}

/// A logged-in, active user with a live session.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user: User,
    pub session: Session,
}

impl AuthUser {
    pub fn id(&self) -> i64 {
        self.user.id
    }
}

/// Resolve one token to an active user, or the rejection message.
async fn session_user(state: &AppState, token: &str) -> anyhow::Result<Result<AuthUser, &'static str>> {
    let claims: Claims = match jwt::decode_token(&state.jwt_secret, token) {
        Ok(c) => c,
        Err(_) => return Ok(Err("Session expired. Please log in again.")),
    };
    let (Some(user_id), Some(sid)) = (claims.user_id(), claims.sid.as_deref()) else {
        return Ok(Err("Login required"));
    };

    let session = match sessions::validate_session(&state.db, sid).await? {
        Some(s) if s.user_id == user_id => s,
        _ => return Ok(Err("Session expired. Please log in again.")),
    };

    Ok(match super::get_user(&state.db, user_id).await? {
        Some(user) if user.is_active => Ok(AuthUser { user, session }),
        _ => Err("Login required"),
    })
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AuthUser {
    type Error = ApiError;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let Some(state) = app_state(req).await else {
            return unauthorized("Login required");
        };

        // a stale cookie must not shadow a valid bearer token
        let mut rejection = "Login required";
        for token in request_tokens(req, SESSION_COOKIE) {
            match session_user(state, &token).await {
                Ok(Ok(user)) => return Outcome::Success(user),
                Ok(Err(msg)) => rejection = msg,
                Err(e) => return Outcome::Error((Status::InternalServerError, ApiError::Internal(e))),
            }
        }
        unauthorized(rejection)
    }
}

/// Like [`AuthUser`] but never rejects the request.
#[derive(Debug, Clone)]
pub struct OptionalUser(pub Option<AuthUser>);

impl OptionalUser {
    pub fn id(&self) -> Option<i64> {
        self.0.as_ref().map(AuthUser::id)
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for OptionalUser {
    type Error = std::convert::Infallible;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        Outcome::Success(OptionalUser(req.guard::<AuthUser>().await.succeeded()))
    }
}

/// The configured administrator, authenticated by an admin-role JWT.
#[derive(Debug, Clone)]
pub struct AdminUser {
    pub username: String,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AdminUser {
    type Error = ApiError;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let Some(state) = app_state(req).await else {
            return unauthorized("Admin access required");
        };
        let mut forbidden = false;
        for token in request_tokens(req, ADMIN_COOKIE) {
            match jwt::decode_token(&state.jwt_secret, &token) {
                Ok(claims) if claims.is_admin() => {
                    return Outcome::Success(AdminUser { username: claims.sub })
                }
                Ok(_) => forbidden = true,
                Err(_) => {}
            }
        }
        if forbidden {
            return Outcome::Error((
                Status::Forbidden,
                ApiError::Forbidden("Admin access required".to_string()),
            ));
        }
        unauthorized("Admin access required")
    }
}
