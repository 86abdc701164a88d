//! API error taxonomy.
//!
//! Every handler returns `Result<_, ApiError>`; the `IntoResponse` impl is
//! the single place where error kinds map to status codes and JSON bodies.
//! Messages never carry absolute host paths.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use stackd_utils::cmd::CmdOutput;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Policy(String),
    #[error("{0}")]
    Auth(String),
    #[error("Too many failed attempts. Try again later.")]
    RateLimited,
    #[error("{error}")]
    External {
        error: String,
        stdout: String,
        stderr: String,
        cmd: String,
        args: Vec<String>,
    },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// Build an external-tool error from a finished command.
    pub fn external(error: impl Into<String>, cmd: &str, args: &[&str], out: &CmdOutput) -> Self {
        Self::External {
            error: error.into(),
            stdout: out.stdout.clone(),
            stderr: out.stderr.clone(),
            cmd: cmd.to_string(),
            args: args.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            Self::Validation(msg) | Self::Conflict(msg) | Self::Policy(msg) => {
                (StatusCode::BAD_REQUEST, json!({ "error": msg }))
            }
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, json!({ "error": msg })),
            Self::Auth(msg) => (StatusCode::UNAUTHORIZED, json!({ "error": msg })),
            Self::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({ "error": self.to_string() }),
            ),
            Self::External {
                error,
                stdout,
                stderr,
                cmd,
                args,
            } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({
                    "error": error,
                    "stdout": stdout,
                    "stderr": stderr,
                    "cmd": cmd,
                    "args": args,
                }),
            ),
            Self::Internal(e) => {
                tracing::error!("internal error: {e:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "internal error" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ApiError::Validation("x".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::NotFound("x".into()).into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::Policy("x".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Auth("x".into()).into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::RateLimited.into_response().status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::Internal(anyhow::anyhow!("secret detail"))
                .into_response()
                .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
