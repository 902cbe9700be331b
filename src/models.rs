//! Request and response DTOs for the HTTP surface
//!
//! Field names follow the JSON contract the browser frontend already uses
//! (camelCase).

use serde::{Deserialize, Serialize};

/// Default number of inbox entries returned by `/api/emails`
pub const DEFAULT_LIST_MAX: u32 = 10;
/// Upper bound on inbox entries per request
pub const MAX_LIST_MAX: u32 = 50;

/// Inbox entry built from a message's metadata headers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EmailSummary {
    /// Provider message id
    pub id: String,
    /// Provider thread id
    pub thread_id: String,
    /// Subject, or the no-subject placeholder
    pub subject: String,
    /// From header
    pub from: String,
    /// Date header as sent
    pub date: String,
    /// Provider-generated preview text
    pub snippet: String,
}

/// Response of `/api/emails`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailList {
    pub emails: Vec<EmailSummary>,
}

/// Response of `/api/me`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountProfile {
    pub email_address: String,
}

/// Query of `/api/emails`
///
/// `max` is kept as text: anything that is not a positive number falls back
/// to the default instead of failing the request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListEmailsQuery {
    pub max: Option<String>,
}

impl ListEmailsQuery {
    /// Requested page size clamped to `1..=50`, default 10
    pub fn clamped_max(&self) -> u32 {
        self.max
            .as_deref()
            .and_then(|m| m.trim().parse::<f64>().ok())
            .filter(|m| m.is_finite() && *m != 0.0)
            .map_or(DEFAULT_LIST_MAX, |m| {
                m.clamp(1.0, f64::from(MAX_LIST_MAX)) as u32
            })
    }
}

/// Body of `/api/generate-pdf`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratePdfInput {
    /// Provider message id to export
    #[serde(default)]
    pub message_id: Option<String>,
    /// Requested download name, sanitized before use
    #[serde(default)]
    pub filename: Option<String>,
}

/// Query of the OAuth callback
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OAuthCallbackQuery {
    pub code: Option<String>,
    pub error: Option<String>,
}

/// Response of `/auth/logout`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogoutResponse {
    pub ok: bool,
}

/// Response of the development-only `/debug/env`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugEnvResponse {
    pub ok: bool,
    pub missing: Vec<String>,
    pub values: DebugEnvValues,
}

/// Non-secret configuration values echoed by `/debug/env`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct DebugEnvValues {
    pub google_redirect_uri: String,
    pub frontend_origin: String,
    pub app_env: String,
    pub active_sessions: usize,
}

#[cfg(test)]
mod tests {
    use super::{EmailSummary, GeneratePdfInput, ListEmailsQuery};

    fn query(max: Option<&str>) -> ListEmailsQuery {
        ListEmailsQuery {
            max: max.map(str::to_owned),
        }
    }

    #[test]
    fn list_max_is_clamped_and_defaulted() {
        assert_eq!(query(None).clamped_max(), 10);
        assert_eq!(query(Some("abc")).clamped_max(), 10);
        assert_eq!(query(Some("0")).clamped_max(), 10);
        assert_eq!(query(Some("-4")).clamped_max(), 1);
        assert_eq!(query(Some("25")).clamped_max(), 25);
        assert_eq!(query(Some("500")).clamped_max(), 50);
    }

    #[test]
    fn generate_pdf_input_accepts_camel_case() {
        let input: GeneratePdfInput =
            serde_json::from_str(r#"{"messageId":"abc","filename":"Report"}"#).expect("parse");
        assert_eq!(input.message_id.as_deref(), Some("abc"));
        assert_eq!(input.filename.as_deref(), Some("Report"));

        let empty: GeneratePdfInput = serde_json::from_str("{}").expect("parse");
        assert!(empty.message_id.is_none());
    }

    #[test]
    fn email_summary_serializes_thread_id_in_camel_case() {
        let summary = EmailSummary {
            id: "1".to_owned(),
            thread_id: "t1".to_owned(),
            subject: "Hi".to_owned(),
            from: "a@example.com".to_owned(),
            date: "today".to_owned(),
            snippet: String::new(),
        };
        let json = serde_json::to_value(summary).expect("serialize");
        assert_eq!(json["threadId"], "t1");
    }
}
