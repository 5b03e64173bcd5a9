use std::io::Cursor;

use rocket::http::{ContentType, Header, Status};
use rocket::request::Request;
use rocket::response::{self, Responder, Response};
use thiserror::Error;

use crate::news::NewsError;

/// Errors surfaced by HTTP handlers, rendered as `{"error": "..."}` with the matching status.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("Rate limit exceeded")]
    RateLimited { retry_after: i64 },
    #[error("{0}")]
    Upstream(String),
    #[error("{0}")]
    NotConfigured(String),
    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn status(&self) -> Status {
        match self {
            ApiError::BadRequest(_) => Status::BadRequest,
            ApiError::Unauthorized(_) => Status::Unauthorized,
            ApiError::Forbidden(_) => Status::Forbidden,
            ApiError::NotFound(_) => Status::NotFound,
            ApiError::Conflict(_) => Status::Conflict,
            ApiError::RateLimited { .. } => Status::TooManyRequests,
            ApiError::Upstream(_) => Status::BadGateway,
            ApiError::NotConfigured(_) => Status::ServiceUnavailable,
            ApiError::Internal(_) => Status::InternalServerError,
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError::BadRequest(msg.into())
    }
}

impl From<NewsError> for ApiError {
    fn from(e: NewsError) -> Self {
        match e {
            NewsError::NotConfigured => ApiError::NotConfigured(NewsError::NotConfigured.to_string()),
            NewsError::Internal(inner) => ApiError::Internal(inner),
            other => ApiError::Upstream(other.to_string()),
        }
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, _req: &'r Request<'_>) -> response::Result<'static> {
        let status = self.status();
        if let ApiError::Internal(e) = &self {
            tracing::error!("internal error: {:#}", e);
        }
        let body = serde_json::json!({ "error": self.to_string() }).to_string();

        let mut builder = Response::build();
        builder
            .status(status)
            .header(ContentType::JSON)
            .sized_body(body.len(), Cursor::new(body));
        if let ApiError::RateLimited { retry_after } = self {
            builder.header(Header::new("Retry-After", retry_after.to_string()));
        }
        Ok(builder.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn news_errors_map_to_gateway_statuses() {
        assert_eq!(ApiError::from(NewsError::NotConfigured).status(), Status::ServiceUnavailable);
        assert_eq!(
            ApiError::from(NewsError::Upstream("boom".into())).status(),
            Status::BadGateway
        );
        assert_eq!(
            ApiError::Internal(anyhow::anyhow!("db down")).to_string(),
            "Internal server error"
        );
    }
}
