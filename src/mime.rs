//! Message part tree resolution
//!
//! Reads the provider's JSON representation of a message (a recursive tree of
//! MIME parts with base64url bodies), extracts the display headers, and picks
//! the body to render. Malformed structure is tolerated: missing fields are
//! treated as absent, never as errors.

use std::collections::HashMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;

/// Subject shown when a message has none
pub const NO_SUBJECT: &str = "(No subject)";
/// Body fragment used when no part carries displayable content
pub const NO_DISPLAYABLE_CONTENT: &str = "<p>(No displayable content for this message)</p>";

/// One node of a message's MIME tree
///
/// Mirrors the provider's `payload` object. Every field is optional so that
/// partial or odd payloads still deserialize.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MimePart {
    /// Declared content type, e.g. `text/html`
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Raw headers in wire order
    #[serde(default)]
    pub headers: Option<Vec<PartHeader>>,
    /// Encoded body, absent for multipart containers
    #[serde(default)]
    pub body: Option<PartBody>,
    /// Child parts in order
    #[serde(default)]
    pub parts: Option<Vec<MimePart>>,
}

/// Single raw header of a part
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartHeader {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

/// Body payload of a part
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartBody {
    /// base64url-encoded content
    #[serde(default)]
    pub data: Option<String>,
}

impl MimePart {
    /// Child parts, empty when the part is a leaf
    pub fn children(&self) -> &[MimePart] {
        self.parts.as_deref().unwrap_or_default()
    }

    /// Encoded body data when present and non-empty
    fn body_data(&self) -> Option<&str> {
        self.body
            .as_ref()
            .and_then(|b| b.data.as_deref())
            .filter(|d| !d.is_empty())
    }
}

/// Display headers of a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeaders {
    pub subject: String,
    pub from: String,
    pub to: String,
    pub date: String,
}

/// Extract display headers from a message's root part
///
/// Header names are matched case-insensitively and the last occurrence of
/// each name wins. A missing or empty subject becomes [`NO_SUBJECT`]; other
/// missing headers become empty strings.
pub fn parse_headers(part: &MimePart) -> MessageHeaders {
    let map = header_map(part.headers.as_deref().unwrap_or_default());
    let get = |name: &str| map.get(name).cloned().unwrap_or_default();

    let subject = get("subject");
    MessageHeaders {
        subject: if subject.is_empty() {
            NO_SUBJECT.to_owned()
        } else {
            subject
        },
        from: get("from"),
        to: get("to"),
        date: get("date"),
    }
}

/// Build a lowercase-keyed header map where later duplicates overwrite earlier ones
pub fn header_map(headers: &[PartHeader]) -> HashMap<String, String> {
    let mut map = HashMap::with_capacity(headers.len());
    for header in headers {
        let Some(name) = header.name.as_deref().filter(|n| !n.is_empty()) else {
            continue;
        };
        map.insert(
            name.to_ascii_lowercase(),
            header.value.clone().unwrap_or_default(),
        );
    }
    map
}

/// First HTML and first plain-text body found in pre-order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BodyCandidates {
    pub html: Option<String>,
    pub text: Option<String>,
}

/// Walk the part tree depth-first, pre-order, collecting the first body of each kind
///
/// The accumulator is threaded through by value so the walk has no hidden
/// mutable state.
pub fn collect_bodies(part: &MimePart, found: BodyCandidates) -> BodyCandidates {
    let mut found = found;
    let mime_type = part
        .mime_type
        .as_deref()
        .unwrap_or_default()
        .to_ascii_lowercase();

    if let Some(data) = part.body_data() {
        if mime_type == "text/html" && found.html.as_deref().is_none_or(str::is_empty) {
            found.html = Some(decode_base64url(data));
        } else if mime_type == "text/plain" && found.text.as_deref().is_none_or(str::is_empty) {
            found.text = Some(decode_base64url(data));
        }
    }

    part.children()
        .iter()
        .fold(found, |acc, child| collect_bodies(child, acc))
}

/// Resolve the body HTML to render for a message
///
/// HTML is returned verbatim (sanitization happens at render time). Plain
/// text is escaped and its line breaks become `<br>`. With neither, a fixed
/// placeholder fragment is returned.
pub fn extract_body_html(part: &MimePart) -> String {
    let found = collect_bodies(part, BodyCandidates::default());

    if let Some(html) = found.html.filter(|h| !h.is_empty()) {
        return html;
    }

    if let Some(text) = found.text.filter(|t| !t.is_empty()) {
        return text_to_html(&text);
    }

    NO_DISPLAYABLE_CONTENT.to_owned()
}

/// Escape plain text and convert `\n` / `\r\n` line breaks to `<br>`
pub fn text_to_html(text: &str) -> String {
    escape_html(text).replace("\r\n", "<br>").replace('\n', "<br>")
}

/// Decode the provider's URL-safe base64 variant
///
/// Maps `-`/`_` back to `+`/`/`, restores `=` padding, then decodes with the
/// standard alphabet. Invalid input yields an empty string; invalid UTF-8 is
/// replaced lossily.
pub fn decode_base64url(data: &str) -> String {
    if data.is_empty() {
        return String::new();
    }

    let mut normalized: String = data
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();
    let missing_padding = (4 - normalized.len() % 4) % 4;
    normalized.extend(std::iter::repeat_n('=', missing_padding));

    STANDARD
        .decode(normalized.as_bytes())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

/// Escape the five HTML-reserved characters
pub fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}
