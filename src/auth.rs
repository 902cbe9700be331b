//! Bearer-token gate for the `/api` routes
//!
//! The gateway resolves the `Authorization: Bearer <token>` header to the
//! session's delegated credentials and hands them to handlers through request
//! extensions. Rejections never say which check failed.

use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult, ErrorResponse, ReconnectRequired};
use crate::gmail::DelegatedCredentials;
use crate::routes::AppState;
use crate::session::{SessionResolver, TOKEN_LEN};

const BEARER_PREFIX: &str = "Bearer ";

/// Token part of a `Bearer` authorization header, trimmed
pub fn bearer_token(header: Option<&HeaderValue>) -> Option<&str> {
    header
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix(BEARER_PREFIX))
        .map(str::trim)
}

/// Resolve an authorization header to session credentials
///
/// Malformed tokens are rejected by length before the store is consulted.
pub fn authorize<S>(sessions: &S, header: Option<&HeaderValue>) -> AppResult<DelegatedCredentials>
where
    S: SessionResolver + ?Sized,
{
    let token = bearer_token(header).ok_or(AppError::Unauthenticated)?;
    if token.len() != TOKEN_LEN {
        return Err(AppError::InvalidSession);
    }
    sessions.resolve(token).ok_or(AppError::InvalidSession)
}

/// Middleware: reject requests without a live session
///
/// A session whose credentials the provider reports as revoked is dropped
/// once the handler responds.
pub async fn require_session(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    match authorize(state.sessions.as_ref(), request.headers().get(AUTHORIZATION)) {
        Ok(credentials) => {
            let token = bearer_token(request.headers().get(AUTHORIZATION)).map(str::to_owned);
            request.extensions_mut().insert(credentials);
            let response = next.run(request).await;
            let revoked = response.extensions().get::<ReconnectRequired>().is_some();
            if let Some(token) = token.filter(|_| revoked) {
                state.sessions.invalidate(&token);
                debug!("session dropped after upstream revocation");
            }
            response
        }
        Err(err) => {
            debug!(path = %request.uri().path(), error = %err, "request rejected by session gate");
            err.to_error_response(!state.config.is_production()).into_response()
        }
    }
}

/// Middleware: reject API requests while required settings are missing
pub async fn require_api_config(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    match state.config.ensure_ready() {
        Ok(()) => next.run(request).await,
        Err(err) => err
            .to_error_response(!state.config.is_production())
            .into_response(),
    }
}

/// Development middleware: log API calls that arrive without a bearer header
pub async fn warn_missing_bearer(request: Request, next: Next) -> Response {
    if request.uri().path().starts_with("/api") {
        let has_bearer = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with(BEARER_PREFIX));
        if !has_bearer {
            warn!(
                method = %request.method(),
                path = %request.uri().path(),
                "API request without Authorization Bearer header"
            );
        }
    }
    next.run(request).await
}

/// Credentials of the authenticated session
///
/// Only available behind [`require_session`]; without it the extractor
/// rejects with 401.
#[derive(Debug, Clone)]
pub struct Authenticated(pub DelegatedCredentials);

impl<S> FromRequestParts<S> for Authenticated
where
    S: Send + Sync,
{
    type Rejection = ErrorResponse;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<DelegatedCredentials>()
            .cloned()
            .map(Self)
            .ok_or_else(|| AppError::Unauthenticated.to_error_response(false))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::http::HeaderValue;
    use secrecy::ExposeSecret;

    use super::{authorize, bearer_token};
    use crate::errors::AppError;
    use crate::gmail::DelegatedCredentials;
    use crate::session::{SessionResolver, SessionStore, TOKEN_LEN};

    /// Resolver that counts lookups and knows a single token
    struct CountingResolver {
        known: String,
        lookups: AtomicUsize,
    }

    impl CountingResolver {
        fn new(known: &str) -> Self {
            Self {
                known: known.to_owned(),
                lookups: AtomicUsize::new(0),
            }
        }
    }

    impl SessionResolver for CountingResolver {
        fn resolve(&self, token: &str) -> Option<DelegatedCredentials> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            (token == self.known).then(|| DelegatedCredentials::from_access_token("access"))
        }
    }

    fn header(value: &str) -> HeaderValue {
        HeaderValue::from_str(value).expect("valid header")
    }

    #[test]
    fn missing_or_non_bearer_header_is_unauthenticated() {
        let resolver = CountingResolver::new("x");
        assert!(matches!(authorize(&resolver, None), Err(AppError::Unauthenticated)));
        assert!(matches!(
            authorize(&resolver, Some(&header("Basic dXNlcjpwYXNz"))),
            Err(AppError::Unauthenticated)
        ));
        assert_eq!(resolver.lookups.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn short_token_is_rejected_without_lookup() {
        let resolver = CountingResolver::new("abc");
        let result = authorize(&resolver, Some(&header("Bearer abc")));
        assert!(matches!(result, Err(AppError::InvalidSession)));
        assert_eq!(resolver.lookups.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unknown_token_of_valid_length_is_invalid_session() {
        let resolver = CountingResolver::new(&"a".repeat(TOKEN_LEN));
        let other = "b".repeat(TOKEN_LEN);
        let result = authorize(&resolver, Some(&header(&format!("Bearer {other}"))));
        assert!(matches!(result, Err(AppError::InvalidSession)));
        assert_eq!(resolver.lookups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn live_session_yields_its_credentials() {
        let store = SessionStore::new(std::time::Duration::from_secs(60));
        let token = store.create(DelegatedCredentials::from_access_token("delegated"));

        let creds = authorize(&store, Some(&header(&format!("Bearer  {token} "))))
            .expect("authorized");
        assert_eq!(creds.access_token.expose_secret(), "delegated");
    }

    #[test]
    fn bearer_token_trims_surrounding_whitespace() {
        let value = header("Bearer   tok  ");
        assert_eq!(bearer_token(Some(&value)), Some("tok"));
        assert_eq!(bearer_token(Some(&header("bearer tok"))), None);
    }
}
