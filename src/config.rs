//! Configuration module for OAuth, session, and renderer settings
//!
//! All configuration is loaded from environment variables. The Google OAuth
//! settings and `FRONTEND_ORIGIN` are required for the API to serve requests,
//! but their absence does not abort startup: the server stays up so the
//! health and diagnostic endpoints can report what is missing.

use std::env;
use std::env::VarError;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::errors::{AppError, AppResult};

/// Settings the API surface refuses to run without
pub const REQUIRED_SETTINGS: [&str; 4] = [
    "GOOGLE_CLIENT_ID",
    "GOOGLE_CLIENT_SECRET",
    "GOOGLE_REDIRECT_URI",
    "FRONTEND_ORIGIN",
];

/// Lower bound for both the session TTL and the sweep interval
pub const MIN_SESSION_INTERVAL: Duration = Duration::from_secs(60);

/// Google OAuth client settings
///
/// Only constructed once every field is present; see
/// [`ServerConfig::google_oauth`].
#[derive(Debug, Clone)]
pub struct GoogleOAuthConfig {
    /// OAuth client ID from the Google Cloud console
    pub client_id: String,
    /// OAuth client secret, kept out of logs
    pub client_secret: SecretString,
    /// Callback URI registered with Google
    pub redirect_uri: String,
}

/// Session lifetime settings
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// Maximum age of a session before it is rejected
    pub ttl: Duration,
    /// Period of the background expiry sweep
    pub sweep_interval: Duration,
}

/// Headless browser settings for PDF rendering
#[derive(Debug, Clone)]
pub struct RendererSettings {
    /// Explicit Chrome/Chromium binary, bypassing discovery
    pub executable_path: Option<PathBuf>,
    /// Whether to pass the sandbox-disabling container flags
    pub container_args: bool,
    /// Budget for each content-load wait
    pub load_timeout: Duration,
    /// Fixed delay after fonts are ready, before printing
    pub settle_delay: Duration,
}

/// Server-wide configuration
///
/// Cloned into route handlers via `Arc` for thread-safe shared access.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port to listen on
    pub port: u16,
    /// Deployment environment name (`development`, `production`, ...)
    pub environment: String,
    /// OAuth client ID
    pub google_client_id: Option<String>,
    /// OAuth client secret
    pub google_client_secret: Option<SecretString>,
    /// OAuth redirect URI
    pub google_redirect_uri: Option<String>,
    /// Frontend origin without trailing slash
    pub frontend_origin: Option<String>,
    /// Path on the frontend origin that receives the session token
    pub frontend_path: String,
    /// Session lifetime settings
    pub session: SessionSettings,
    /// PDF renderer settings
    pub renderer: RendererSettings,
}

impl ServerConfig {
    /// Load all configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if an optional variable is set to a malformed
    /// value. Missing required settings are not an error here; they are
    /// reported by [`ServerConfig::missing_settings`].
    ///
    /// # Example Environment
    ///
    /// ```text
    /// GOOGLE_CLIENT_ID=1234.apps.googleusercontent.com
    /// GOOGLE_CLIENT_SECRET=secret
    /// GOOGLE_REDIRECT_URI=http://localhost:3000/auth/google/callback
    /// FRONTEND_ORIGIN=http://localhost:5500
    /// APP_ENV=development
    /// SESSION_TTL_MS=86400000
    /// CHROME_EXECUTABLE_PATH=/usr/bin/chromium
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        Self::load_with(|key| env::var(key))
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn load_with<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Result<String, VarError>,
    {
        let environment = optional_env(&lookup, "APP_ENV")?
            .or(optional_env(&lookup, "NODE_ENV")?)
            .unwrap_or_else(|| "development".to_owned());

        let ttl_ms = parse_u64_env(&lookup, "SESSION_TTL_MS", 24 * 60 * 60 * 1000)?;
        let sweep_ms = parse_u64_env(&lookup, "SESSION_CLEANUP_INTERVAL_MS", 30 * 60 * 1000)?;

        let executable_path = optional_env(&lookup, "CHROME_EXECUTABLE_PATH")?
            .or(optional_env(&lookup, "PUPPETEER_EXECUTABLE_PATH")?)
            .map(PathBuf::from);

        Ok(Self {
            port: parse_u16_env(&lookup, "PORT", 3000)?,
            environment,
            google_client_id: optional_env(&lookup, "GOOGLE_CLIENT_ID")?,
            google_client_secret: optional_env(&lookup, "GOOGLE_CLIENT_SECRET")?
                .map(|s| SecretString::new(s.into())),
            google_redirect_uri: optional_env(&lookup, "GOOGLE_REDIRECT_URI")?,
            frontend_origin: optional_env(&lookup, "FRONTEND_ORIGIN")?
                .map(|o| normalize_origin(&o))
                .filter(|o| !o.is_empty()),
            frontend_path: optional_env(&lookup, "FRONTEND_PATH")?
                .unwrap_or_else(|| "/Gmail-PDF-tool/".to_owned()),
            session: SessionSettings {
                ttl: Duration::from_millis(ttl_ms).max(MIN_SESSION_INTERVAL),
                sweep_interval: Duration::from_millis(sweep_ms).max(MIN_SESSION_INTERVAL),
            },
            renderer: RendererSettings {
                executable_path,
                container_args: parse_bool_env(
                    &lookup,
                    "CHROME_CONTAINER_ARGS",
                    cfg!(target_os = "linux"),
                )?,
                load_timeout: Duration::from_millis(parse_u64_env(
                    &lookup,
                    "PDF_LOAD_TIMEOUT_MS",
                    120_000,
                )?),
                settle_delay: Duration::from_millis(500),
            },
        })
    }

    /// Whether the server runs in production mode
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// Whether development-only routes and warnings are enabled
    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }

    /// List required settings that are absent or unusable
    ///
    /// A present `FRONTEND_ORIGIN` that is not an `http(s)://` URL is
    /// reported as an issue too.
    pub fn missing_settings(&self) -> Vec<String> {
        let mut missing = Vec::new();
        if self.google_client_id.is_none() {
            missing.push(REQUIRED_SETTINGS[0].to_owned());
        }
        if self.google_client_secret.is_none() {
            missing.push(REQUIRED_SETTINGS[1].to_owned());
        }
        if self.google_redirect_uri.is_none() {
            missing.push(REQUIRED_SETTINGS[2].to_owned());
        }
        match &self.frontend_origin {
            None => missing.push(REQUIRED_SETTINGS[3].to_owned()),
            Some(origin) if !has_http_scheme(origin) => missing.push(format!(
                "{} (must start with http:// or https://)",
                REQUIRED_SETTINGS[3]
            )),
            Some(_) => {}
        }
        missing
    }

    /// Fail with a `Configuration` error unless every required setting is usable
    pub fn ensure_ready(&self) -> AppResult<()> {
        let missing = self.missing_settings();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(AppError::Configuration { missing })
        }
    }

    /// Get the Google OAuth client settings
    ///
    /// # Errors
    ///
    /// Returns `Configuration` naming whichever OAuth settings are missing.
    pub fn google_oauth(&self) -> AppResult<GoogleOAuthConfig> {
        match (
            &self.google_client_id,
            &self.google_client_secret,
            &self.google_redirect_uri,
        ) {
            (Some(client_id), Some(client_secret), Some(redirect_uri)) => Ok(GoogleOAuthConfig {
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
                redirect_uri: redirect_uri.clone(),
            }),
            _ => Err(AppError::Configuration {
                missing: self
                    .missing_settings()
                    .into_iter()
                    .filter(|m| m.starts_with("GOOGLE_"))
                    .collect(),
            }),
        }
    }

    /// Build the frontend URL that receives a freshly minted session token
    pub fn frontend_token_url(&self, token: &str) -> AppResult<String> {
        let origin = self
            .frontend_origin
            .as_deref()
            .ok_or_else(|| AppError::Configuration {
                missing: vec![REQUIRED_SETTINGS[3].to_owned()],
            })?;
        Ok(format!(
            "{origin}{}?token={}",
            self.frontend_path,
            urlencoding::encode(token)
        ))
    }
}

/// Trim whitespace and a single trailing slash from an origin
fn normalize_origin(origin: &str) -> String {
    let trimmed = origin.trim();
    trimmed.strip_suffix('/').unwrap_or(trimmed).to_owned()
}

fn has_http_scheme(origin: &str) -> bool {
    let lower = origin.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Read an optional variable, treating empty or blank values as unset
fn optional_env<F>(lookup: &F, key: &str) -> AppResult<Option<String>>
where
    F: Fn(&str) -> Result<String, VarError>,
{
    match lookup(key) {
        Ok(v) if !v.trim().is_empty() => Ok(Some(v.trim().to_owned())),
        Ok(_) | Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Parse a boolean environment variable with flexible values
///
/// Accepts: `1`, `true`, `yes`, `y`, `on` (truthy) or `0`, `false`, `no`,
/// `n`, `off` (falsy). Case-insensitive. Returns `default` if unset.
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set to an unrecognized value.
fn parse_bool_env<F>(lookup: &F, key: &str, default: bool) -> AppResult<bool>
where
    F: Fn(&str) -> Result<String, VarError>,
{
    match optional_env(lookup, key)? {
        Some(v) => parse_bool_value(&v).ok_or_else(|| {
            AppError::InvalidInput(format!("invalid boolean environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

fn parse_bool_value(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a `u16` environment variable with default fallback
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set but not a valid `u16`.
fn parse_u16_env<F>(lookup: &F, key: &str, default: u16) -> AppResult<u16>
where
    F: Fn(&str) -> Result<String, VarError>,
{
    match optional_env(lookup, key)? {
        Some(v) => v.parse::<u16>().map_err(|_| {
            AppError::InvalidInput(format!("invalid u16 environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

/// Parse a `u64` environment variable with default fallback
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set but not a valid `u64`.
fn parse_u64_env<F>(lookup: &F, key: &str, default: u64) -> AppResult<u64>
where
    F: Fn(&str) -> Result<String, VarError>,
{
    match optional_env(lookup, key)? {
        Some(v) => v.parse::<u64>().map_err(|_| {
            AppError::InvalidInput(format!("invalid u64 environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}
