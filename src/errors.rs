//! Application error model with HTTP response mapping
//!
//! Defines a typed error hierarchy using `thiserror` for internal error
//! handling, and maps each variant to an HTTP status plus a JSON body for the
//! routing layer. Upstream provider failures are classified into actionable
//! hints by [`crate::gmail::classify_provider_error`].

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::gmail::{ProviderError, ProviderErrorKind, classify_provider_error};
use crate::render::RenderError;

/// Hint attached to every unexpected server-side failure
const LOG_HINT: &str = "Check the backend logs for the full error trace.";
/// Hint attached to a failed OAuth code exchange that has no better diagnosis
const OAUTH_SETUP_HINT: &str =
    "Check the redirect URI, the OAuth test users, and that the Gmail API is enabled.";

/// Application error type
///
/// Covers every failure the HTTP surface may report. Authentication failures
/// deliberately carry no detail about which check rejected the request.
#[derive(Debug, Error)]
pub enum AppError {
    /// Required deployment settings are absent or malformed
    #[error("server configuration missing: {}", missing.join(", "))]
    Configuration {
        /// Names of the missing or invalid settings
        missing: Vec<String>,
    },
    /// No usable bearer token on the request
    #[error("not authenticated")]
    Unauthenticated,
    /// Bearer token present but unknown, expired, or malformed
    #[error("invalid session")]
    InvalidSession,
    /// Invalid user input (validation failed, malformed request)
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The message provider rejected an API call
    #[error("upstream provider error: {0}")]
    Upstream(#[from] ProviderError),
    /// The OAuth authorization code could not be exchanged
    #[error("OAuth code exchange failed: {0}")]
    OAuthExchange(ProviderError),
    /// The rendering engine failed outside the recoverable load timeout
    #[error("render failed: {0}")]
    Render(#[from] RenderError),
    /// Internal error (unexpected failure, external crate error)
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Convenience constructor for `InvalidInput`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Convert to an HTTP error response
    ///
    /// `expose_detail` controls whether the raw error text of unexpected
    /// failures is echoed back; it is off in production.
    ///
    /// # Mappings
    ///
    /// - `Configuration` → 500 with the `missing` list
    /// - `Unauthenticated`, `InvalidSession` → 401
    /// - `InvalidInput` → 400
    /// - `Upstream` → classified provider diagnosis, 401 + reconnect hint for
    ///   revoked credentials
    /// - `OAuthExchange` → classified diagnosis, else 500 with setup hint
    /// - `Render`, `Internal` → 500 with log hint
    pub fn to_error_response(&self, expose_detail: bool) -> ErrorResponse {
        match self {
            Self::Configuration { missing } => ErrorResponse::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "server configuration missing",
            )
            .with_missing(missing.clone()),
            Self::Unauthenticated => {
                ErrorResponse::new(StatusCode::UNAUTHORIZED, "not authenticated")
            }
            Self::InvalidSession => ErrorResponse::new(StatusCode::UNAUTHORIZED, "invalid session"),
            Self::InvalidInput(msg) => ErrorResponse::new(StatusCode::BAD_REQUEST, msg.clone()),
            Self::Upstream(err) => {
                provider_diagnosis(err).unwrap_or_else(|| unexpected(err, expose_detail))
            }
            Self::OAuthExchange(err) => provider_diagnosis(err).unwrap_or_else(|| {
                ErrorResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "OAuth exchange failed")
                    .with_hint(OAUTH_SETUP_HINT)
            }),
            Self::Render(err) => {
                let response =
                    ErrorResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "PDF rendering failed")
                        .with_hint(LOG_HINT);
                if expose_detail {
                    response.with_detail(err.to_string())
                } else {
                    response
                }
            }
            Self::Internal(msg) => {
                let response =
                    ErrorResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
                        .with_hint(LOG_HINT);
                if expose_detail {
                    response.with_detail(msg.clone())
                } else {
                    response
                }
            }
        }
    }
}

/// Map a recognized provider failure to its user-facing diagnosis
fn provider_diagnosis(err: &ProviderError) -> Option<ErrorResponse> {
    let response = match classify_provider_error(err) {
        ProviderErrorKind::Reconnect => {
            ErrorResponse::new(StatusCode::UNAUTHORIZED, "reconnect required")
                .with_hint("Your Google authorization expired or was revoked. Sign in again.")
                .with_reconnect()
        }
        ProviderErrorKind::ApiNotEnabled => {
            ErrorResponse::new(StatusCode::FORBIDDEN, "Gmail API is not enabled for this project")
                .with_hint(
                    "Enable the Gmail API under APIs & Services > Library and wait for it to propagate.",
                )
        }
        ProviderErrorKind::InsufficientPermission => {
            let status = err
                .status
                .and_then(|s| StatusCode::from_u16(s).ok())
                .filter(|s| s.is_client_error() || s.is_server_error())
                .unwrap_or(StatusCode::FORBIDDEN);
            ErrorResponse::new(status, "insufficient permission to access Gmail").with_hint(
                "Check the OAuth test users, the consent screen, and the gmail.readonly scope.",
            )
        }
        ProviderErrorKind::RedirectUriMismatch => {
            ErrorResponse::new(StatusCode::BAD_REQUEST, "invalid OAuth redirect URI").with_hint(
                "The Google Cloud client must list exactly the callback URI configured on the backend.",
            )
        }
        ProviderErrorKind::Unknown => return None,
    };
    Some(response)
}

/// Response for an unrecognized provider failure
fn unexpected(err: &ProviderError, expose_detail: bool) -> ErrorResponse {
    let status = err
        .status
        .and_then(|s| StatusCode::from_u16(s).ok())
        .filter(|s| s.is_client_error() || s.is_server_error())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = ErrorResponse::new(status, err.message.clone());
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        response = response.with_hint(LOG_HINT);
        if expose_detail {
            response = response.with_detail(err.to_string());
        }
    }
    response
}

/// JSON body of every error response
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorBody {
    /// Short human-readable failure description
    pub error: String,
    /// Operator or user guidance
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    /// Missing configuration items
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing: Option<Vec<String>>,
    /// Set when the client must drop its token and restart the OAuth flow
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<bool>,
    /// Raw error text, only outside production
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// HTTP status plus JSON error body
#[derive(Debug, Clone)]
pub struct ErrorResponse {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ErrorResponse {
    fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                error: error.into(),
                hint: None,
                missing: None,
                reconnect: None,
                detail: None,
            },
        }
    }

    fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.body.hint = Some(hint.into());
        self
    }

    fn with_missing(mut self, missing: Vec<String>) -> Self {
        self.body.missing = Some(missing);
        self
    }

    fn with_reconnect(mut self) -> Self {
        self.body.reconnect = Some(true);
        self
    }

    fn with_detail(mut self, detail: String) -> Self {
        self.body.detail = Some(detail);
        self
    }
}

/// Response extension set when the delegated credentials were revoked
///
/// The session gate drops the caller's session when it sees this marker.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectRequired;

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let reconnect = self.body.reconnect == Some(true);
        let mut response = (self.status, Json(self.body)).into_response();
        if reconnect {
            response.extensions_mut().insert(ReconnectRequired);
        }
        response
    }
}

/// Type alias for fallible return values
///
/// Use this for all internal functions that can fail. Provides a consistent
/// error type throughout the codebase.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use super::AppError;
    use crate::gmail::ProviderError;
    use crate::render::RenderError;

    fn provider(status: u16, message: &str) -> ProviderError {
        ProviderError {
            status: Some(status),
            message: message.to_owned(),
        }
    }

    #[test]
    fn authentication_failures_do_not_leak_the_failing_check() {
        let unauth = AppError::Unauthenticated.to_error_response(true);
        let invalid = AppError::InvalidSession.to_error_response(true);
        assert_eq!(unauth.status, StatusCode::UNAUTHORIZED);
        assert_eq!(invalid.status, StatusCode::UNAUTHORIZED);
        assert!(unauth.body.detail.is_none());
        assert!(invalid.body.hint.is_none());
    }

    #[test]
    fn configuration_error_lists_missing_items() {
        let err = AppError::Configuration {
            missing: vec!["GOOGLE_CLIENT_ID".to_owned(), "FRONTEND_ORIGIN".to_owned()],
        };
        let response = err.to_error_response(false);
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.body.missing.as_deref(),
            Some(&["GOOGLE_CLIENT_ID".to_owned(), "FRONTEND_ORIGIN".to_owned()][..])
        );
    }

    #[test]
    fn revoked_credentials_produce_reconnect_signal() {
        let response =
            AppError::Upstream(provider(400, "invalid_grant")).to_error_response(false);
        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(response.body.reconnect, Some(true));
    }

    #[test]
    fn unknown_provider_error_hides_detail_in_production() {
        let err = AppError::Upstream(provider(500, "backend exploded"));
        let prod = err.to_error_response(false);
        let dev = err.to_error_response(true);
        assert_eq!(prod.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(prod.body.detail.is_none());
        assert!(prod.body.hint.is_some());
        assert!(dev.body.detail.is_some());
    }

    #[test]
    fn unknown_provider_client_error_keeps_status() {
        let response = AppError::Upstream(provider(404, "Requested entity was not found."))
            .to_error_response(true);
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert!(response.body.hint.is_none());
    }

    #[test]
    fn oauth_exchange_failure_falls_back_to_setup_hint() {
        let response =
            AppError::OAuthExchange(provider(400, "invalid_request")).to_error_response(false);
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(
            response
                .body
                .hint
                .as_deref()
                .is_some_and(|h| h.contains("redirect URI"))
        );
    }

    #[test]
    fn render_failure_maps_to_server_error() {
        let err = AppError::Render(RenderError::Launch("no chrome".to_owned()));
        let response = err.to_error_response(false);
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.body.detail.is_none());
    }
}
