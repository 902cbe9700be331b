//! Renderer error types

use std::time::Duration;

use thiserror::Error;

/// Errors raised while turning a document into a PDF
#[derive(Debug, Error)]
pub enum RenderError {
    /// The browser process could not be started or never exposed DevTools
    #[error("failed to launch browser: {0}")]
    Launch(String),

    /// WebSocket connection to DevTools failed
    #[error("failed to connect to DevTools at {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    /// A DevTools command returned an error response
    #[error("CDP error {code}: {message}")]
    Cdp {
        code: i64,
        message: String,
        data: Option<String>,
    },

    /// A DevTools command got no response in time
    #[error("CDP command '{method}' timed out after {duration:?}")]
    CommandTimeout { method: String, duration: Duration },

    /// Serialization, closed channel, or unexpected message shape
    #[error("CDP protocol error: {detail}")]
    Protocol { detail: String },

    /// The browser refused to load the document
    #[error("navigation failed: {reason}")]
    NavigationFailed { reason: String },

    /// Content did not settle within the load budget
    #[error("navigation timeout of {duration:?} exceeded")]
    NavigationTimeout { duration: Duration },

    /// Script evaluation in the page threw
    #[error("JavaScript exception: {message}")]
    JsException { message: String },

    /// The printed PDF payload was not valid base64
    #[error("invalid PDF payload: {0}")]
    PdfDecode(#[from] base64::DecodeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid sanitizer pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl RenderError {
    /// Whether this is the content-load timeout that warrants one relaxed retry
    pub fn is_navigation_timeout(&self) -> bool {
        matches!(self, Self::NavigationTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::RenderError;

    #[test]
    fn only_navigation_timeout_is_recoverable() {
        let timeout = RenderError::NavigationTimeout {
            duration: Duration::from_secs(120),
        };
        assert!(timeout.is_navigation_timeout());
        assert!(timeout.to_string().contains("navigation timeout"));

        let command = RenderError::CommandTimeout {
            method: "Page.printToPDF".to_owned(),
            duration: Duration::from_secs(30),
        };
        assert!(!command.is_navigation_timeout());
        assert!(!RenderError::Launch("missing binary".to_owned()).is_navigation_timeout());
    }
}
