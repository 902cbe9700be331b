//! Fakes shared by the router and self-check tests

use std::collections::HashMap;
use std::env::VarError;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use crate::config::ServerConfig;
use crate::errors::{AppError, AppResult};
use crate::gmail::{DelegatedCredentials, GmailMessage, MessageProvider, Profile, ProviderError};
use crate::message_id::MessageId;
use crate::mime::{MimePart, PartBody, PartHeader};
use crate::models::EmailSummary;
use crate::render::{
    DocumentRenderer, EngineLauncher, PdfOptions, RenderEngine, RenderError, RenderPage, WaitUntil,
};
use crate::routes::AppState;
use crate::session::SessionStore;

/// Provider double: code `good` exchanges, message `revoked` fails with 401
pub struct FakeProvider;

#[async_trait]
impl MessageProvider for FakeProvider {
    fn authorization_url(&self) -> AppResult<String> {
        Ok("https://accounts.example.com/consent?client_id=test".to_owned())
    }

    async fn exchange_code(&self, code: &str) -> AppResult<DelegatedCredentials> {
        if code == "good" {
            Ok(DelegatedCredentials::from_access_token("delegated"))
        } else {
            Err(AppError::OAuthExchange(ProviderError {
                status: Some(400),
                message: "redirect_uri_mismatch".to_owned(),
            }))
        }
    }

    async fn profile(&self, _creds: &DelegatedCredentials) -> AppResult<Profile> {
        Ok(Profile {
            email_address: Some("user@example.com".to_owned()),
        })
    }

    async fn list_messages(
        &self,
        _creds: &DelegatedCredentials,
        max: u32,
    ) -> AppResult<Vec<EmailSummary>> {
        Ok((0..max)
            .map(|i| EmailSummary {
                id: format!("m{i}"),
                thread_id: format!("t{i}"),
                subject: format!("Subject {i}"),
                from: "sender@example.com".to_owned(),
                date: String::new(),
                snippet: String::new(),
            })
            .collect())
    }

    async fn get_message_full(
        &self,
        _creds: &DelegatedCredentials,
        id: &MessageId,
    ) -> AppResult<GmailMessage> {
        if id.as_str() == "revoked" {
            return Err(AppError::Upstream(ProviderError {
                status: Some(401),
                message: "Invalid Credentials".to_owned(),
            }));
        }
        Ok(GmailMessage {
            id: id.to_string(),
            thread_id: None,
            snippet: None,
            payload: Some(MimePart {
                mime_type: Some("text/html".to_owned()),
                headers: Some(vec![PartHeader {
                    name: Some("Subject".to_owned()),
                    value: Some("Re: Q1/Q2 Report?".to_owned()),
                }]),
                body: Some(PartBody {
                    data: Some(URL_SAFE_NO_PAD.encode("<script>alert(1)</script><b>Hi</b>")),
                }),
                parts: None,
            }),
        })
    }
}

/// Engine double that prints a fixed PDF stub and refuses script content
pub struct PdfLauncher;
struct PdfEngine;
struct PdfPage;

#[async_trait]
impl EngineLauncher for PdfLauncher {
    async fn launch(&self) -> Result<Box<dyn RenderEngine>, RenderError> {
        Ok(Box::new(PdfEngine))
    }
}

#[async_trait]
impl RenderEngine for PdfEngine {
    async fn new_page(&mut self) -> Result<Box<dyn RenderPage>, RenderError> {
        Ok(Box::new(PdfPage))
    }

    async fn close(&mut self) -> Result<(), RenderError> {
        Ok(())
    }
}

#[async_trait]
impl RenderPage for PdfPage {
    async fn set_content(
        &mut self,
        html: &str,
        _wait_until: WaitUntil,
        _timeout: Duration,
    ) -> Result<(), RenderError> {
        if html.contains("<script") {
            return Err(RenderError::NavigationFailed {
                reason: "script reached the page".to_owned(),
            });
        }
        Ok(())
    }

    async fn wait_for_fonts(&mut self, _timeout: Duration) -> Result<(), RenderError> {
        Ok(())
    }

    async fn print_pdf(&mut self, _options: &PdfOptions) -> Result<Vec<u8>, RenderError> {
        Ok(b"%PDF-1.7 test".to_vec())
    }
}

/// Configuration from a fixed variable list
pub fn config(vars: &[(&str, &str)]) -> ServerConfig {
    let map: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect();
    ServerConfig::load_with(|key| map.get(key).cloned().ok_or(VarError::NotPresent))
        .expect("config")
}

/// Fully configured settings in the given environment
pub fn complete_config(environment: &str) -> ServerConfig {
    config(&[
        ("GOOGLE_CLIENT_ID", "client"),
        ("GOOGLE_CLIENT_SECRET", "secret"),
        ("GOOGLE_REDIRECT_URI", "http://localhost:3000/auth/google/callback"),
        ("FRONTEND_ORIGIN", "https://frontend.example.com"),
        ("APP_ENV", environment),
        ("PDF_LOAD_TIMEOUT_MS", "1000"),
    ])
}

/// Handler state wired to the fakes above
pub fn fake_state(mut config: ServerConfig) -> AppState {
    config.renderer.settle_delay = Duration::ZERO;
    let renderer =
        DocumentRenderer::new(&config.renderer, Arc::new(PdfLauncher)).expect("renderer");
    AppState {
        sessions: Arc::new(SessionStore::new(config.session.ttl)),
        config: Arc::new(config),
        provider: Arc::new(FakeProvider),
        renderer: Arc::new(renderer),
    }
}
