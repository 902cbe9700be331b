//! Provider message identifier validation
//!
//! Message ids arrive from the client and end up as a path segment of the
//! provider's REST URL, so they are validated before any request is built.

use std::fmt;

use crate::errors::{AppError, AppResult};

/// Upper bound on accepted message id length
const MAX_MESSAGE_ID_LEN: usize = 256;

/// Validated provider message identifier
///
/// Provider ids are opaque tokens made of ASCII letters, digits, `-` and `_`
/// (e.g. `18c2f7a9d4e1b3a0`). Anything else is rejected, which rules out
/// path traversal and query injection into the request URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageId(String);

impl MessageId {
    /// Parse and validate a message id
    ///
    /// Surrounding whitespace is ignored. Returns error if:
    /// - The id is empty
    /// - The id is longer than 256 characters
    /// - The id contains characters outside `[A-Za-z0-9_-]`
    pub fn parse(raw: &str) -> AppResult<Self> {
        let id = raw.trim();
        if id.is_empty() {
            return Err(AppError::invalid("messageId is required"));
        }
        if id.len() > MAX_MESSAGE_ID_LEN {
            return Err(AppError::invalid("messageId is too long"));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(AppError::invalid("messageId contains invalid characters"));
        }
        Ok(Self(id.to_owned()))
    }

    /// Borrow the id as it is sent to the provider
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
