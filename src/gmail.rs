//! Gmail REST client and OAuth code exchange
//!
//! Wraps the three provider calls the server needs (profile, inbox listing,
//! full message fetch) plus the OAuth consent URL and authorization-code
//! exchange. Credentials are delegated per session and refreshed on demand
//! when the access token has expired.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{GoogleOAuthConfig, REQUIRED_SETTINGS};
use crate::errors::{AppError, AppResult};
use crate::message_id::MessageId;
use crate::mime::{MimePart, parse_headers};
use crate::models::{DEFAULT_LIST_MAX, EmailSummary, MAX_LIST_MAX};

/// Read-only Gmail scope requested at consent
pub const GMAIL_SCOPE: &str = "https://www.googleapis.com/auth/gmail.readonly";

const AUTH_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

/// Access tokens expiring within this margin are refreshed first
const EXPIRY_MARGIN_SECS: i64 = 60;

/// OAuth credentials delegated by the user for one session
#[derive(Debug, Clone)]
pub struct DelegatedCredentials {
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    /// `None` when the token endpoint gave no lifetime
    pub expires_at: Option<DateTime<Utc>>,
}

impl DelegatedCredentials {
    /// Credentials holding only an access token with unknown expiry
    #[cfg(test)]
    pub fn from_access_token(token: impl Into<String>) -> Self {
        Self {
            access_token: SecretString::new(token.into().into()),
            refresh_token: None,
            expires_at: None,
        }
    }

    /// Whether the access token expires within the next minute
    ///
    /// Unknown expiry counts as valid: the provider's 401 is the fallback
    /// signal in that case.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .is_some_and(|exp| now >= exp - chrono::Duration::seconds(EXPIRY_MARGIN_SECS))
    }
}

/// Failure reported by the provider or the transport to it
#[derive(Debug, Clone, Error)]
#[error("provider request failed: {message}")]
pub struct ProviderError {
    /// HTTP status of the provider response, if one arrived
    pub status: Option<u16>,
    /// Provider error text
    pub message: String,
}

impl ProviderError {
    /// Build from a non-success provider response
    ///
    /// Joins the OAuth `error_description`, the API `error.message`, and a
    /// string `error` code. Falls back to the raw body, then the status text.
    pub async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Self::from_body(status.as_u16(), &body)
    }

    fn from_body(status: u16, body: &str) -> Self {
        let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
        let mut parts: Vec<&str> = Vec::new();
        if let Some(json) = &parsed {
            if let Some(desc) = json.get("error_description").and_then(|v| v.as_str()) {
                parts.push(desc);
            }
            if let Some(msg) = json.pointer("/error/message").and_then(|v| v.as_str()) {
                parts.push(msg);
            }
            if let Some(code) = json.get("error").and_then(|v| v.as_str()) {
                parts.push(code);
            }
        }

        let message = if parts.is_empty() {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                reqwest::StatusCode::from_u16(status)
                    .ok()
                    .and_then(|s| s.canonical_reason())
                    .unwrap_or("unknown provider error")
                    .to_owned()
            } else {
                trimmed.to_owned()
            }
        } else {
            parts.join(" ")
        };

        Self {
            status: Some(status),
            message,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        Self {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

/// Actionable diagnosis of a provider failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// The Gmail API is not enabled for the OAuth project
    ApiNotEnabled,
    /// Consent, test-user, or scope problem
    InsufficientPermission,
    /// Callback URI does not match the OAuth client registration
    RedirectUriMismatch,
    /// Delegated credentials expired or were revoked
    Reconnect,
    Unknown,
}

/// Classify a provider failure by status and message text
///
/// Matching is substring-based on the lowercased message, so it follows the
/// provider's current wording. Setup problems are checked before the
/// reconnect signal.
pub fn classify_provider_error(err: &ProviderError) -> ProviderErrorKind {
    let text = err.message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| text.contains(n));

    if has(&["api has not been used", "access_not_configured", "gmail api"]) {
        ProviderErrorKind::ApiNotEnabled
    } else if has(&[
        "access_denied",
        "insufficient permissions",
        "insufficient authentication scopes",
        "forbidden",
    ]) {
        ProviderErrorKind::InsufficientPermission
    } else if has(&["redirect_uri_mismatch"]) {
        ProviderErrorKind::RedirectUriMismatch
    } else if err.status == Some(401)
        || has(&[
            "invalid_grant",
            "invalid credentials",
            "token has been expired",
            "login required",
            "unauthorized",
        ])
    {
        ProviderErrorKind::Reconnect
    } else {
        ProviderErrorKind::Unknown
    }
}

/// Mailbox profile of the authenticated user
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    #[serde(default)]
    pub email_address: Option<String>,
}

/// Message as returned by the provider's `format=full` or `format=metadata`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub snippet: Option<String>,
    #[serde(default)]
    pub payload: Option<MimePart>,
}

#[derive(Debug, Deserialize)]
struct MessageListResponse {
    #[serde(default)]
    messages: Option<Vec<MessageRef>>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    /// Space-separated scopes actually granted
    #[serde(default)]
    scope: Option<String>,
}

impl TokenResponse {
    fn into_credentials(self, previous_refresh: Option<&SecretString>) -> DelegatedCredentials {
        DelegatedCredentials {
            access_token: SecretString::new(self.access_token.into()),
            refresh_token: self
                .refresh_token
                .map(|t| SecretString::new(t.into()))
                .or_else(|| previous_refresh.cloned()),
            expires_at: self
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
        }
    }
}

/// Whether a granted scope list covers Gmail read access
///
/// An absent list means the provider granted what was requested.
fn grants_gmail_read(scope: Option<&str>) -> bool {
    scope.is_none_or(|granted| granted.split_whitespace().any(|s| s == GMAIL_SCOPE))
}

/// Provider seam used by the HTTP handlers
#[async_trait]
pub trait MessageProvider: Send + Sync {
    /// Consent URL the browser is redirected to
    fn authorization_url(&self) -> AppResult<String>;

    /// Exchange an OAuth authorization code for delegated credentials
    async fn exchange_code(&self, code: &str) -> AppResult<DelegatedCredentials>;

    async fn profile(&self, creds: &DelegatedCredentials) -> AppResult<Profile>;

    /// Newest inbox entries with subject, sender, date, and snippet
    async fn list_messages(
        &self,
        creds: &DelegatedCredentials,
        max: u32,
    ) -> AppResult<Vec<EmailSummary>>;

    /// Complete message including its MIME part tree
    async fn get_message_full(
        &self,
        creds: &DelegatedCredentials,
        id: &MessageId,
    ) -> AppResult<GmailMessage>;
}

/// Google endpoint locations, overridable for tests
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub auth_url: String,
    pub token_url: String,
    pub api_base: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            auth_url: AUTH_ENDPOINT.to_owned(),
            token_url: TOKEN_ENDPOINT.to_owned(),
            api_base: GMAIL_API_BASE.to_owned(),
        }
    }
}

/// Gmail API client backed by `reqwest`
pub struct GmailClient {
    oauth: Option<GoogleOAuthConfig>,
    endpoints: Endpoints,
    client: Client,
}

impl GmailClient {
    /// Client against the public Google endpoints
    ///
    /// `oauth` may be absent while the deployment is incomplete; calls that
    /// need it then fail with a configuration error.
    pub fn new(oauth: Option<GoogleOAuthConfig>) -> Self {
        Self::with_endpoints(oauth, Endpoints::default())
    }

    pub fn with_endpoints(oauth: Option<GoogleOAuthConfig>, endpoints: Endpoints) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            oauth,
            endpoints: Endpoints {
                api_base: endpoints.api_base.trim_end_matches('/').to_owned(),
                ..endpoints
            },
            client,
        }
    }

    fn oauth(&self) -> AppResult<&GoogleOAuthConfig> {
        self.oauth.as_ref().ok_or_else(|| AppError::Configuration {
            missing: REQUIRED_SETTINGS[..3].iter().map(|s| (*s).to_owned()).collect(),
        })
    }

    /// Current access token, refreshed first if it has expired
    ///
    /// The refreshed token is used for this call only; the session keeps the
    /// original credentials and refreshes again next time.
    async fn access_token(&self, creds: &DelegatedCredentials) -> AppResult<String> {
        let refresh_token = match &creds.refresh_token {
            Some(token) if creds.is_expired() => token,
            _ => return Ok(creds.access_token.expose_secret().to_owned()),
        };

        debug!("access token expired, refreshing");
        let oauth = self.oauth()?;
        let response = self
            .client
            .post(&self.endpoints.token_url)
            .form(&[
                ("client_id", oauth.client_id.as_str()),
                ("client_secret", oauth.client_secret.expose_secret()),
                ("refresh_token", refresh_token.expose_secret()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(ProviderError::from)?;

        if !response.status().is_success() {
            let err = ProviderError::from_response(response).await;
            warn!(status = ?err.status, "token refresh failed");
            return Err(err.into());
        }

        let token: TokenResponse = response.json().await.map_err(ProviderError::from)?;
        Ok(token.access_token)
    }

    /// GET a JSON resource under the API base
    async fn get_json<T>(&self, token: &str, path: &str, query: &[(&str, &str)]) -> AppResult<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let url = format!("{}/{}", self.endpoints.api_base, path);
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .query(query)
            .send()
            .await
            .map_err(ProviderError::from)?;

        if !response.status().is_success() {
            return Err(ProviderError::from_response(response).await.into());
        }

        Ok(response.json().await.map_err(ProviderError::from)?)
    }

    async fn message_summary(&self, token: &str, id: &str) -> AppResult<EmailSummary> {
        let message: GmailMessage = self
            .get_json(
                token,
                &format!("messages/{id}"),
                &[
                    ("format", "metadata"),
                    ("metadataHeaders", "Subject"),
                    ("metadataHeaders", "From"),
                    ("metadataHeaders", "Date"),
                ],
            )
            .await?;

        let headers = parse_headers(&message.payload.unwrap_or_default());
        Ok(EmailSummary {
            id: if message.id.is_empty() {
                id.to_owned()
            } else {
                message.id
            },
            thread_id: message.thread_id.unwrap_or_default(),
            subject: headers.subject,
            from: headers.from,
            date: headers.date,
            snippet: message.snippet.unwrap_or_default(),
        })
    }
}

#[async_trait]
impl MessageProvider for GmailClient {
    fn authorization_url(&self) -> AppResult<String> {
        let oauth = self.oauth()?;
        let params = [
            ("access_type", "offline"),
            ("prompt", "consent"),
            ("include_granted_scopes", "true"),
            ("response_type", "code"),
            ("scope", GMAIL_SCOPE),
            ("client_id", oauth.client_id.as_str()),
            ("redirect_uri", oauth.redirect_uri.as_str()),
        ];
        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        Ok(format!("{}?{query}", self.endpoints.auth_url))
    }

    async fn exchange_code(&self, code: &str) -> AppResult<DelegatedCredentials> {
        let oauth = self.oauth()?;
        let response = self
            .client
            .post(&self.endpoints.token_url)
            .form(&[
                ("code", code),
                ("client_id", oauth.client_id.as_str()),
                ("client_secret", oauth.client_secret.expose_secret()),
                ("redirect_uri", oauth.redirect_uri.as_str()),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await
            .map_err(|e| AppError::OAuthExchange(e.into()))?;

        if !response.status().is_success() {
            return Err(AppError::OAuthExchange(
                ProviderError::from_response(response).await,
            ));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AppError::OAuthExchange(e.into()))?;
        debug!(
            has_refresh_token = token.refresh_token.is_some(),
            scope = token.scope.as_deref().unwrap_or_default(),
            "authorization code exchanged"
        );
        if !grants_gmail_read(token.scope.as_deref()) {
            warn!("consent did not include Gmail read access; listing will be refused");
        }
        Ok(token.into_credentials(None))
    }

    async fn profile(&self, creds: &DelegatedCredentials) -> AppResult<Profile> {
        let token = self.access_token(creds).await?;
        self.get_json(&token, "profile", &[]).await
    }

    async fn list_messages(
        &self,
        creds: &DelegatedCredentials,
        max: u32,
    ) -> AppResult<Vec<EmailSummary>> {
        let max = if max == 0 { DEFAULT_LIST_MAX } else { max.min(MAX_LIST_MAX) };
        let token = self.access_token(creds).await?;

        let list: MessageListResponse = self
            .get_json(&token, "messages", &[("maxResults", max.to_string().as_str())])
            .await?;
        let refs = list.messages.unwrap_or_default();
        debug!(count = refs.len(), "listing message metadata");

        try_join_all(
            refs.iter()
                .map(|message| self.message_summary(&token, &message.id)),
        )
        .await
    }

    async fn get_message_full(
        &self,
        creds: &DelegatedCredentials,
        id: &MessageId,
    ) -> AppResult<GmailMessage> {
        let token = self.access_token(creds).await?;
        self.get_json(
            &token,
            &format!("messages/{}", id.as_str()),
            &[("format", "full")],
        )
        .await
    }
}
