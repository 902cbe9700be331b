//! HTTP surface: OAuth flow, inbox API, PDF export, diagnostics
//!
//! Handlers validate input, call the provider and renderer, and funnel every
//! outcome through [`finalize`] so errors are logged and mapped uniformly.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, Request, State};
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_EXPOSE_HEADERS, AUTHORIZATION, CONTENT_DISPOSITION, CONTENT_TYPE, LOCATION,
    ORIGIN, VARY,
};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{Next, from_fn, from_fn_with_state};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::{debug, error, info, warn};

use crate::auth::{
    Authenticated, bearer_token, require_api_config, require_session, warn_missing_bearer,
};
use crate::config::ServerConfig;
use crate::errors::{AppError, AppResult};
use crate::gmail::{DelegatedCredentials, GmailClient, MessageProvider};
use crate::message_id::MessageId;
use crate::mime::{extract_body_html, parse_headers};
use crate::models::{
    AccountProfile, DebugEnvResponse, DebugEnvValues, EmailList, GeneratePdfInput,
    ListEmailsQuery, LogoutResponse, OAuthCallbackQuery,
};
use crate::render::{DocumentRenderer, RenderRequest};
use crate::session::SessionStore;

/// Maximum length of a download file name, extension excluded
const MAX_FILENAME_CHARS: usize = 120;
const FALLBACK_FILENAME: &str = "email";

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub sessions: Arc<SessionStore>,
    pub provider: Arc<dyn MessageProvider>,
    pub renderer: Arc<DocumentRenderer>,
}

impl AppState {
    /// Wire the Gmail client, Chromium renderer and an empty session store
    ///
    /// A missing OAuth client leaves the provider unusable but still lets the
    /// server start, so configuration errors surface per request.
    pub fn from_config(config: ServerConfig) -> AppResult<Self> {
        let provider = GmailClient::new(config.google_oauth().ok());
        let renderer = DocumentRenderer::chromium(&config.renderer)?;
        Ok(Self {
            sessions: Arc::new(SessionStore::new(config.session.ttl)),
            config: Arc::new(config),
            provider: Arc::new(provider),
            renderer: Arc::new(renderer),
        })
    }
}

/// Build the application router
///
/// `/api` routes check configuration first, then the session. Debug routes
/// and the missing-bearer warning exist only in development.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/me", get(api_me))
        .route("/emails", get(api_emails))
        .route("/generate-pdf", post(api_generate_pdf))
        .layer(from_fn_with_state(state.clone(), require_session))
        .layer(from_fn_with_state(state.clone(), require_api_config));

    let mut router = Router::new()
        .route("/health", get(health))
        .route("/auth/google", get(auth_google))
        .route("/auth/google/callback", get(auth_google_callback))
        .route("/auth/logout", post(auth_logout))
        .nest("/api", api);

    if state.config.is_development() {
        router = router
            .route("/debug/env", get(debug_env))
            .route("/debug/pdf", get(debug_pdf))
            .layer(from_fn(warn_missing_bearer));
    }

    router.layer(from_fn(cors)).with_state(state)
}

/// Log and convert a handler outcome into a response
fn finalize<T>(
    state: &AppState,
    route: &'static str,
    started: Instant,
    result: AppResult<T>,
) -> Response
where
    T: IntoResponse,
{
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(value) => {
            debug!(route, elapsed_ms, "request completed");
            value.into_response()
        }
        Err(err) => {
            let response = err.to_error_response(!state.config.is_production());
            if response.status.is_server_error() {
                error!(
                    route,
                    status = response.status.as_u16(),
                    error = %err,
                    elapsed_ms,
                    "request failed"
                );
            } else {
                warn!(
                    route,
                    status = response.status.as_u16(),
                    error = %err,
                    elapsed_ms,
                    "request rejected"
                );
            }
            response.into_response()
        }
    }
}

/// Permissive CORS: mirror the caller's origin and answer preflights directly
async fn cors(request: Request, next: Next) -> Response {
    let origin = request.headers().get(ORIGIN).cloned();
    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(request).await
    };

    let headers = response.headers_mut();
    if let Some(origin) = origin {
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        headers.insert(VARY, HeaderValue::from_static("Origin"));
    }
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Authorization, Content-Type"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static("Content-Disposition"),
    );
    response
}

/// 302 redirect to `url`
fn found(url: &str) -> AppResult<Response> {
    let location = HeaderValue::from_str(url)
        .map_err(|e| AppError::Internal(format!("invalid redirect target: {e}")))?;
    Ok((StatusCode::FOUND, [(LOCATION, location)]).into_response())
}

async fn health() -> &'static str {
    "ok"
}

async fn auth_google(State(state): State<AppState>) -> Response {
    let started = Instant::now();
    info!(
        has_client_id = state.config.google_client_id.is_some(),
        has_client_secret = state.config.google_client_secret.is_some(),
        redirect_uri = state.config.google_redirect_uri.as_deref().unwrap_or_default(),
        frontend_origin = state.config.frontend_origin.as_deref().unwrap_or_default(),
        "starting OAuth flow"
    );
    let result = state
        .config
        .ensure_ready()
        .and_then(|()| state.provider.authorization_url())
        .and_then(|url| found(&url));
    finalize(&state, "auth_google", started, result)
}

async fn auth_google_callback(
    State(state): State<AppState>,
    Query(query): Query<OAuthCallbackQuery>,
) -> Response {
    let started = Instant::now();
    let result = complete_oauth(&state, query).await;
    finalize(&state, "auth_google_callback", started, result)
}

async fn complete_oauth(state: &AppState, query: OAuthCallbackQuery) -> AppResult<Response> {
    state.config.ensure_ready()?;

    if let Some(consent_error) = query.error.as_deref() {
        warn!(consent_error, "OAuth consent returned an error");
    }
    let code = query
        .code
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| AppError::invalid("missing OAuth code"))?;

    let credentials = state.provider.exchange_code(code).await?;
    let token = state.sessions.create(credentials);
    info!(active_sessions = state.sessions.len(), "session established");
    found(&state.config.frontend_token_url(&token)?)
}

async fn auth_logout(State(state): State<AppState>, headers: HeaderMap) -> Json<LogoutResponse> {
    if let Some(token) = bearer_token(headers.get(AUTHORIZATION)).filter(|t| !t.is_empty()) {
        state.sessions.invalidate(token);
        debug!(active_sessions = state.sessions.len(), "session invalidated");
    }
    Json(LogoutResponse { ok: true })
}

async fn api_me(State(state): State<AppState>, Authenticated(creds): Authenticated) -> Response {
    let started = Instant::now();
    let result = state.provider.profile(&creds).await.map(|profile| {
        Json(AccountProfile {
            email_address: profile.email_address.unwrap_or_default(),
        })
    });
    finalize(&state, "api_me", started, result)
}

async fn api_emails(
    State(state): State<AppState>,
    Authenticated(creds): Authenticated,
    Query(query): Query<ListEmailsQuery>,
) -> Response {
    let started = Instant::now();
    let result = state
        .provider
        .list_messages(&creds, query.clamped_max())
        .await
        .map(|emails| Json(EmailList { emails }));
    finalize(&state, "api_emails", started, result)
}

async fn api_generate_pdf(
    State(state): State<AppState>,
    Authenticated(creds): Authenticated,
    input: Result<Json<GeneratePdfInput>, JsonRejection>,
) -> Response {
    let started = Instant::now();
    let result = match input {
        Ok(Json(input)) => export_message(&state, &creds, input).await,
        Err(rejection) => Err(AppError::invalid(rejection.body_text())),
    };
    finalize(&state, "api_generate_pdf", started, result)
}

async fn export_message(
    state: &AppState,
    creds: &DelegatedCredentials,
    input: GeneratePdfInput,
) -> AppResult<Response> {
    let id = MessageId::parse(input.message_id.as_deref().unwrap_or_default())?;
    let message = state.provider.get_message_full(creds, &id).await?;
    let payload = message.payload.unwrap_or_default();
    let headers = parse_headers(&payload);
    let body_html = extract_body_html(&payload);

    let filename = download_name(input.filename.as_deref(), &headers.subject, &id);
    let pdf = state
        .renderer
        .render(RenderRequest {
            subject: headers.subject,
            from: headers.from,
            to: headers.to,
            date: headers.date,
            body_html,
        })
        .await?;
    pdf_response(pdf, &filename)
}

/// Sanitized download name: requested name, else subject, else `email-<id>`
fn download_name(requested: Option<&str>, subject: &str, id: &MessageId) -> String {
    let chosen = requested
        .filter(|name| !name.trim().is_empty())
        .map(str::to_owned)
        .or_else(|| (!subject.is_empty()).then(|| subject.to_owned()))
        .unwrap_or_else(|| format!("email-{id}"));
    sanitize_filename(&chosen)
}

/// Make a string safe to use as a download file name
///
/// Filesystem-reserved characters and control characters become spaces,
/// whitespace runs collapse to one space, and the result is trimmed and cut
/// to 120 characters. An empty result becomes `email`.
pub fn sanitize_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => ' ',
            c if c.is_control() => ' ',
            c => c,
        })
        .collect();
    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return FALLBACK_FILENAME.to_owned();
    }
    collapsed.chars().take(MAX_FILENAME_CHARS).collect()
}

fn pdf_response(pdf: Vec<u8>, filename: &str) -> AppResult<Response> {
    let disposition =
        HeaderValue::from_bytes(format!("attachment; filename=\"{filename}.pdf\"").as_bytes())
            .map_err(|e| AppError::Internal(format!("invalid Content-Disposition: {e}")))?;
    Ok((
        [
            (CONTENT_TYPE, HeaderValue::from_static("application/pdf")),
            (CONTENT_DISPOSITION, disposition),
        ],
        pdf,
    )
        .into_response())
}

async fn debug_env(State(state): State<AppState>) -> Json<DebugEnvResponse> {
    let missing = state.config.missing_settings();
    Json(DebugEnvResponse {
        ok: missing.is_empty(),
        missing,
        values: DebugEnvValues {
            google_redirect_uri: state.config.google_redirect_uri.clone().unwrap_or_default(),
            frontend_origin: state.config.frontend_origin.clone().unwrap_or_default(),
            app_env: state.config.environment.clone(),
            active_sessions: state.sessions.len(),
        },
    })
}

/// Render a fixed sample through the real renderer, without any provider call
async fn debug_pdf(State(state): State<AppState>) -> Response {
    let started = Instant::now();
    let request = RenderRequest {
        subject: "Debug PDF".to_owned(),
        from: "debug@example.com".to_owned(),
        to: "user@example.com".to_owned(),
        date: chrono::Utc::now().to_rfc3339(),
        body_html: "<p>If this PDF opened, the headless browser works in this environment.</p>"
            .to_owned(),
    };
    let result = match state.renderer.render(request).await {
        Ok(pdf) => pdf_response(pdf, "debug-pdf"),
        Err(err) => Err(err.into()),
    };
    finalize(&state, "debug_pdf", started, result)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::Router;
    use axum::body::{Body, to_bytes};
    use axum::http::header::{
        ACCESS_CONTROL_ALLOW_ORIGIN, AUTHORIZATION, CONTENT_DISPOSITION, CONTENT_TYPE, LOCATION,
        ORIGIN,
    };
    use axum::http::{Method, Request, StatusCode};
    use axum::response::Response;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::{build_router, sanitize_filename};
    use crate::config::ServerConfig;
    use crate::gmail::DelegatedCredentials;
    use crate::session::SessionStore;
    use crate::test_support::{complete_config, config, fake_state};

    fn app_with(settings: ServerConfig) -> (Router, Arc<SessionStore>) {
        let state = fake_state(settings);
        let sessions = state.sessions.clone();
        (build_router(state), sessions)
    }

    fn app() -> (Router, Arc<SessionStore>, String) {
        let (router, sessions) = app_with(complete_config("development"));
        let token = sessions.create(DelegatedCredentials::from_access_token("delegated"));
        (router, sessions, token)
    }

    async fn send(router: &Router, request: Request<Body>) -> Response {
        router.clone().oneshot(request).await.expect("infallible")
    }

    fn get(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::empty()).expect("request")
    }

    fn post_json(uri: &str, token: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (router, _, _) = app();
        let response = send(&router, get("/health", None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn api_rejects_missing_and_malformed_tokens_alike() {
        let (router, _, _) = app();

        let missing = send(&router, get("/api/me", None)).await;
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(missing).await["error"], "not authenticated");

        let short = send(&router, get("/api/me", Some("abc"))).await;
        assert_eq!(short.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(short).await["error"], "invalid session");

        let unknown = send(&router, get("/api/me", Some(&"f".repeat(96)))).await;
        assert_eq!(unknown.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn api_reports_missing_configuration_before_authentication() {
        let (router, _) = app_with(config(&[("GOOGLE_CLIENT_ID", "client")]));
        let response = send(&router, get("/api/me", None)).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        let missing = body["missing"].as_array().expect("missing list");
        assert!(missing.iter().any(|m| m == "GOOGLE_CLIENT_SECRET"));
        assert!(
            missing
                .iter()
                .any(|m| m.as_str().is_some_and(|s| s.starts_with("FRONTEND_ORIGIN")))
        );
    }

    #[tokio::test]
    async fn oauth_start_redirects_to_consent() {
        let (router, _, _) = app();
        let response = send(&router, get("/auth/google", None)).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers()[LOCATION],
            "https://accounts.example.com/consent?client_id=test"
        );
    }

    #[tokio::test]
    async fn callback_creates_session_and_redirects_with_token() {
        let (router, sessions, _) = app();
        let before = sessions.len();

        let response = send(&router, get("/auth/google/callback?code=good", None)).await;

        assert_eq!(response.status(), StatusCode::FOUND);
        let location = response.headers()[LOCATION].to_str().expect("ascii").to_owned();
        let token = location
            .strip_prefix("https://frontend.example.com/Gmail-PDF-tool/?token=")
            .expect("frontend redirect");
        assert_eq!(token.len(), 96);
        assert_eq!(sessions.len(), before + 1);

        let me = send(&router, get("/api/me", Some(token))).await;
        assert_eq!(me.status(), StatusCode::OK);
        assert_eq!(json_body(me).await["emailAddress"], "user@example.com");
    }

    #[tokio::test]
    async fn callback_without_code_is_bad_request() {
        let (router, _, _) = app();
        let response = send(&router, get("/auth/google/callback", None)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn failed_exchange_is_diagnosed() {
        let (router, sessions, _) = app();
        let before = sessions.len();
        let response = send(&router, get("/auth/google/callback?code=bad", None)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(response).await["hint"].is_string());
        assert_eq!(sessions.len(), before);
    }

    #[tokio::test]
    async fn email_listing_clamps_max() {
        let (router, _, token) = app();

        let default =
            json_body(send(&router, get("/api/emails?max=abc", Some(&token))).await).await;
        assert_eq!(default["emails"].as_array().map(Vec::len), Some(10));
        assert_eq!(default["emails"][0]["threadId"], "t0");

        let capped = json_body(send(&router, get("/api/emails?max=500", Some(&token))).await).await;
        assert_eq!(capped["emails"].as_array().map(Vec::len), Some(50));
    }

    #[tokio::test]
    async fn generate_pdf_returns_attachment_with_sanitized_name() {
        let (router, _, token) = app();
        let response = send(
            &router,
            post_json("/api/generate-pdf", &token, json!({"messageId": "abc123"})),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/pdf");
        assert_eq!(
            response.headers()[CONTENT_DISPOSITION],
            "attachment; filename=\"Re Q1 Q2 Report.pdf\""
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        assert!(body.starts_with(b"%PDF"));
    }

    #[tokio::test]
    async fn generate_pdf_prefers_requested_filename() {
        let (router, _, token) = app();
        let response = send(
            &router,
            post_json(
                "/api/generate-pdf",
                &token,
                json!({"messageId": "abc123", "filename": "Re: Q1/Q2 Report?.pdf"}),
            ),
        )
        .await;
        let disposition = response.headers()[CONTENT_DISPOSITION].to_str().expect("ascii");
        assert_eq!(disposition, "attachment; filename=\"Re Q1 Q2 Report .pdf.pdf\"");
    }

    #[tokio::test]
    async fn generate_pdf_requires_message_id() {
        let (router, _, token) = app();
        let response = send(&router, post_json("/api/generate-pdf", &token, json!({}))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(
            json_body(response).await["error"]
                .as_str()
                .is_some_and(|e| e.contains("messageId"))
        );
    }

    #[tokio::test]
    async fn revoked_credentials_signal_reconnect_and_drop_the_session() {
        let (router, _, token) = app();
        let response = send(
            &router,
            post_json("/api/generate-pdf", &token, json!({"messageId": "revoked"})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["reconnect"], true);

        let after = send(&router, get("/api/me", Some(&token))).await;
        assert_eq!(after.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(after).await["error"], "invalid session");
    }

    #[tokio::test]
    async fn logout_invalidates_the_session() {
        let (router, sessions, token) = app();
        let request = Request::builder()
            .method(Method::POST)
            .uri("/auth/logout")
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .expect("request");

        let response = send(&router, request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["ok"], true);
        assert!(sessions.is_empty());

        let after = send(&router, get("/api/me", Some(&token))).await;
        assert_eq!(after.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn preflight_mirrors_origin() {
        let (router, _, _) = app();
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/api/emails")
            .header(ORIGIN, "https://frontend.example.com")
            .body(Body::empty())
            .expect("request");

        let response = send(&router, request).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://frontend.example.com"
        );
    }

    #[tokio::test]
    async fn debug_routes_exist_only_in_development() {
        let (dev, _, _) = app();
        let env = send(&dev, get("/debug/env", None)).await;
        assert_eq!(env.status(), StatusCode::OK);
        let body = json_body(env).await;
        assert_eq!(body["ok"], true);
        assert_eq!(body["values"]["APP_ENV"], "development");

        let pdf = send(&dev, get("/debug/pdf", None)).await;
        assert_eq!(pdf.status(), StatusCode::OK);
        assert_eq!(pdf.headers()[CONTENT_TYPE], "application/pdf");

        let (prod, _) = app_with(complete_config("production"));
        let hidden = send(&prod, get("/debug/env", None)).await;
        assert_eq!(hidden.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn sanitize_filename_strips_reserved_characters() {
        let name = sanitize_filename("Re: Q1/Q2 Report?.pdf");
        assert_eq!(name, "Re Q1 Q2 Report .pdf");
        assert!(!name.contains(['/', '\\', ':', '*', '?', '"', '<', '>', '|']));
    }

    #[test]
    fn sanitize_filename_handles_empty_long_and_control_input() {
        assert_eq!(sanitize_filename(" ?* "), "email");
        assert_eq!(sanitize_filename("a\r\nb\tc"), "a b c");
        assert_eq!(sanitize_filename(&"x".repeat(300)).chars().count(), 120);
    }
}
