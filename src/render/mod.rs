//! HTML-to-PDF rendering of a single message
//!
//! A message is composed into a fixed printable HTML template and printed by
//! a headless browser. Every render launches its own engine instance and
//! closes it whatever the outcome. The engine sits behind the
//! [`EngineLauncher`] / [`RenderEngine`] / [`RenderPage`] traits.

pub mod cdp;
pub mod chromium;
pub mod error;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Local};
use regex::Regex;
use serde_json::{Value, json};
use tracing::{info, warn};
use uuid::Uuid;

pub use self::chromium::ChromiumLauncher;
pub use self::error::RenderError;
use crate::config::RendererSettings;
use crate::mime::{NO_SUBJECT, escape_html};

/// Body fragment printed when the message body is empty
pub const NO_CONTENT: &str = "<p>(No content)</p>";

/// Lifecycle stage a content load waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitUntil {
    /// No network activity for a short quiet period
    NetworkIdle,
    /// DOM parsed, subresources possibly still loading
    DomContentLoaded,
}

impl WaitUntil {
    /// DevTools `Page.lifecycleEvent` name for this stage
    pub fn lifecycle_event(self) -> &'static str {
        match self {
            Self::NetworkIdle => "networkIdle",
            Self::DomContentLoaded => "DOMContentLoaded",
        }
    }
}

/// Page geometry and print flags
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PdfOptions {
    pub paper_width_in: f64,
    pub paper_height_in: f64,
    /// Same margin on every edge; the document supplies its own padding
    pub margin_in: f64,
    pub print_background: bool,
}

impl PdfOptions {
    /// A4 portrait with background graphics
    pub const A4: Self = Self {
        paper_width_in: 8.27,
        paper_height_in: 11.69,
        margin_in: 0.0,
        print_background: true,
    };

    /// `Page.printToPDF` parameters
    pub fn to_params(&self) -> Value {
        json!({
            "paperWidth": self.paper_width_in,
            "paperHeight": self.paper_height_in,
            "marginTop": self.margin_in,
            "marginBottom": self.margin_in,
            "marginLeft": self.margin_in,
            "marginRight": self.margin_in,
            "printBackground": self.print_background,
            "preferCSSPageSize": false,
        })
    }
}

/// Starts engine instances
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn RenderEngine>, RenderError>;
}

/// One running engine instance
#[async_trait]
pub trait RenderEngine: Send {
    async fn new_page(&mut self) -> Result<Box<dyn RenderPage>, RenderError>;

    /// Shut the instance down; called exactly once per launch
    async fn close(&mut self) -> Result<(), RenderError>;
}

/// One page of an engine
#[async_trait]
pub trait RenderPage: Send {
    /// Load `html` and wait for `wait_until`, failing with
    /// [`RenderError::NavigationTimeout`] after `timeout`
    async fn set_content(
        &mut self,
        html: &str,
        wait_until: WaitUntil,
        timeout: Duration,
    ) -> Result<(), RenderError>;

    /// Resolve once web fonts have loaded
    async fn wait_for_fonts(&mut self, timeout: Duration) -> Result<(), RenderError>;

    async fn print_pdf(&mut self, options: &PdfOptions) -> Result<Vec<u8>, RenderError>;
}

/// Message fields printed on the document
#[derive(Debug, Clone, Default)]
pub struct RenderRequest {
    pub subject: String,
    pub from: String,
    pub to: String,
    pub date: String,
    /// Message body as HTML; untrusted
    pub body_html: String,
}

/// Removes `<script>` blocks from untrusted HTML
///
/// Only script elements are removed. Inline event handlers, `javascript:`
/// URLs and other active content pass through unchanged.
#[derive(Debug, Clone)]
pub struct ScriptStripper(Regex);

impl ScriptStripper {
    pub fn new() -> Result<Self, RenderError> {
        Ok(Self(Regex::new(r"(?is)<script\b.*?</script\s*>")?))
    }

    pub fn strip(&self, html: &str) -> String {
        self.0.replace_all(html, "").into_owned()
    }
}

/// Fill the printable template with escaped headers and the (already stripped) body
pub fn compose_document(request: &RenderRequest, generated_at: DateTime<Local>) -> String {
    let subject = if request.subject.is_empty() {
        NO_SUBJECT
    } else {
        request.subject.as_str()
    };
    let body = if request.body_html.is_empty() {
        NO_CONTENT
    } else {
        request.body_html.as_str()
    };
    let timestamp = generated_at.format("%Y-%m-%d %H:%M:%S").to_string();

    format!(
        r#"<!DOCTYPE html>
<html>
  <head>
    <meta charset="UTF-8">
    <style>
      body {{ margin: 0; font-family: "Segoe UI", Tahoma, sans-serif; color: #1d2a38; background: #f3f6fa; }}
      .page {{ max-width: 820px; margin: 0 auto; background: #ffffff; padding: 24px 28px 30px; border: 1px solid #d7deea; }}
      .title {{ margin: 0; font-size: 24px; color: #0f2d59; line-height: 1.3; word-break: break-word; }}
      .meta {{ margin-top: 14px; display: grid; gap: 6px; font-size: 13px; color: #364a63; }}
      .meta strong {{ color: #112d4e; }}
      hr {{ border: 0; border-top: 1px solid #d7deea; margin: 18px 0 20px; }}
      .content {{ font-size: 14px; line-height: 1.55; color: #1d2a38; word-wrap: break-word; }}
      .content img {{ max-width: 100%; }}
      .footer {{ margin-top: 24px; font-size: 12px; color: #596c84; }}
    </style>
  </head>
  <body>
    <div class="page">
      <h1 class="title">{subject}</h1>
      <div class="meta">
        <div><strong>From:</strong> {from}</div>
        <div><strong>To:</strong> {to}</div>
        <div><strong>Date:</strong> {date}</div>
      </div>
      <hr>
      <div class="content">{body}</div>
      <div class="footer">Generated at {timestamp}</div>
    </div>
  </body>
</html>
"#,
        subject = escape_html(subject),
        from = escape_html(&request.from),
        to = escape_html(&request.to),
        date = escape_html(&request.date),
        body = body,
        timestamp = escape_html(&timestamp),
    )
}

/// Prints messages to PDF, one engine instance per call
pub struct DocumentRenderer {
    launcher: Arc<dyn EngineLauncher>,
    stripper: ScriptStripper,
    load_timeout: Duration,
    settle_delay: Duration,
}

impl DocumentRenderer {
    pub fn new(
        settings: &RendererSettings,
        launcher: Arc<dyn EngineLauncher>,
    ) -> Result<Self, RenderError> {
        Ok(Self {
            launcher,
            stripper: ScriptStripper::new()?,
            load_timeout: settings.load_timeout,
            settle_delay: settings.settle_delay,
        })
    }

    /// Renderer backed by a locally installed Chrome/Chromium
    pub fn chromium(settings: &RendererSettings) -> Result<Self, RenderError> {
        Self::new(settings, Arc::new(ChromiumLauncher::new(settings)))
    }

    /// Render a message to PDF bytes
    ///
    /// The engine is closed after the render body finishes, on success and
    /// on every error.
    pub async fn render(&self, request: RenderRequest) -> Result<Vec<u8>, RenderError> {
        let render_id = Uuid::new_v4();
        let started = Instant::now();

        let request = RenderRequest {
            body_html: self.stripper.strip(&request.body_html),
            ..request
        };
        let html = compose_document(&request, Local::now());

        let mut engine = self.launcher.launch().await?;
        let result = self.print(engine.as_mut(), &html, render_id).await;
        if let Err(err) = engine.close().await {
            warn!(%render_id, error = %err, "failed to close rendering engine");
        }

        match &result {
            Ok(pdf) => info!(
                %render_id,
                bytes = pdf.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "PDF rendered"
            ),
            Err(err) => warn!(%render_id, error = %err, "PDF rendering failed"),
        }
        result
    }

    async fn print(
        &self,
        engine: &mut dyn RenderEngine,
        html: &str,
        render_id: Uuid,
    ) -> Result<Vec<u8>, RenderError> {
        let mut page = engine.new_page().await?;
        self.load(page.as_mut(), html, render_id).await?;
        page.wait_for_fonts(self.load_timeout).await?;
        tokio::time::sleep(self.settle_delay).await;
        page.print_pdf(&PdfOptions::A4).await
    }

    /// Load content waiting for network idle; on a load timeout only, retry once
    /// waiting for DOM readiness
    async fn load(
        &self,
        page: &mut dyn RenderPage,
        html: &str,
        render_id: Uuid,
    ) -> Result<(), RenderError> {
        match page
            .set_content(html, WaitUntil::NetworkIdle, self.load_timeout)
            .await
        {
            Err(err) if err.is_navigation_timeout() => {
                warn!(
                    %render_id,
                    error = %err,
                    "network never went idle, retrying with DOM readiness"
                );
                page.set_content(html, WaitUntil::DomContentLoaded, self.load_timeout)
                    .await
            }
            other => other,
        }
    }
}
