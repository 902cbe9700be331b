//! Headless Chrome/Chromium engine driven over DevTools
//!
//! Each launch starts a fresh browser process with a throwaway profile
//! directory. The process is killed when the engine is dropped, so an
//! aborted render never leaks a browser.
//!
//! Documents never touch the filesystem. The page navigates to a reserved
//! `https://*.invalid` address, and the request is answered through the
//! Fetch domain. While loading, every other request is intercepted too:
//! local and browser-internal schemes are refused, web resources load
//! normally. Afterwards only `file:` requests stay intercepted.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};
use reqwest::Url;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, trace, warn};

use super::cdp::{COMMAND_TIMEOUT, CdpClient, CdpEvent};
use super::error::RenderError;
use super::{EngineLauncher, PdfOptions, RenderEngine, RenderPage, WaitUntil};
use crate::config::RendererSettings;

/// How long to wait for the DevTools endpoint after spawning the browser
const LAUNCH_TIMEOUT: Duration = Duration::from_secs(20);
/// Grace period for the browser to exit after `Browser.close`
const EXIT_TIMEOUT: Duration = Duration::from_secs(5);
/// Budget for `Page.printToPDF` on large documents
const PRINT_TIMEOUT: Duration = Duration::from_secs(120);

const DEVTOOLS_BANNER: &str = "DevTools listening on ";

/// Address the composed document is served under; `.invalid` never resolves
pub const DOCUMENT_URL: &str = "https://mail-pdf.invalid/message.html";

/// Flags needed to start Chromium inside containers without a usable sandbox
pub const CONTAINER_ARGS: [&str; 3] = [
    "--no-sandbox",
    "--disable-setuid-sandbox",
    "--disable-dev-shm-usage",
];

/// Well-known browser install locations for the current platform
pub fn platform_candidate_paths() -> &'static [&'static str] {
    #[cfg(target_os = "macos")]
    {
        &[
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/opt/homebrew/bin/chromium",
        ]
    }

    #[cfg(target_os = "linux")]
    {
        &[
            "/usr/bin/google-chrome-stable",
            "/usr/bin/google-chrome",
            "/usr/bin/chromium-browser",
            "/usr/bin/chromium",
            "/snap/bin/chromium",
            "/usr/lib/chromium/chromium",
        ]
    }

    #[cfg(target_os = "windows")]
    {
        &[
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
        ]
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        &[]
    }
}

/// Pick the browser binary: the configured path if set, else the first installed candidate
pub fn find_executable(
    configured: Option<&Path>,
    candidates: &[&str],
) -> Result<PathBuf, RenderError> {
    if let Some(path) = configured {
        return if path.is_file() {
            Ok(path.to_path_buf())
        } else {
            Err(RenderError::Launch(format!(
                "configured browser executable {} does not exist",
                path.display()
            )))
        };
    }

    candidates
        .iter()
        .map(PathBuf::from)
        .find(|p| p.is_file())
        .ok_or_else(|| {
            RenderError::Launch(
                "no Chrome/Chromium installation found; set CHROME_EXECUTABLE_PATH".to_owned(),
            )
        })
}

/// Command-line flags for a headless browser using `profile_dir`
pub fn launch_args(profile_dir: &Path, container_args: bool) -> Vec<String> {
    let mut args: Vec<String> = [
        "--headless=new",
        "--remote-debugging-port=0",
        "--no-first-run",
        "--no-default-browser-check",
        "--disable-gpu",
        "--hide-scrollbars",
        "--mute-audio",
    ]
    .iter()
    .map(|s| (*s).to_owned())
    .collect();
    args.push(format!("--user-data-dir={}", profile_dir.display()));
    if container_args {
        args.extend(CONTAINER_ARGS.iter().map(|s| (*s).to_owned()));
    }
    args.push("about:blank".to_owned());
    args
}

/// Extract the browser WebSocket URL from a stderr line
fn parse_devtools_url(line: &str) -> Option<&str> {
    line.trim()
        .strip_prefix(DEVTOOLS_BANNER)
        .filter(|url| url.starts_with("ws://"))
}

/// Page-target endpoint on the same DevTools server as `browser_url`
fn page_ws_url(browser_url: &str, target_id: &str) -> Result<String, RenderError> {
    let (base, _) = browser_url
        .split_once("/devtools/")
        .ok_or_else(|| RenderError::Protocol {
            detail: format!("unexpected DevTools URL {browser_url}"),
        })?;
    Ok(format!("{base}/devtools/page/{target_id}"))
}

/// Whether `event` signals that `loader_id` reached the lifecycle stage `name`
fn is_lifecycle_event(event: &CdpEvent, name: &str, loader_id: Option<&str>) -> bool {
    event.method == "Page.lifecycleEvent"
        && event.params.get("name").and_then(Value::as_str) == Some(name)
        && loader_id
            .is_none_or(|id| event.params.get("loaderId").and_then(Value::as_str) == Some(id))
}

/// What to do with a request the page makes while loading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestDisposition {
    /// The composed document itself
    Document,
    /// Remote web resource, loaded as usual
    Allow,
    /// Local file, browser-internal page, or anything else non-web
    Deny,
}

fn classify_request(url: &str) -> RequestDisposition {
    if url == DOCUMENT_URL {
        return RequestDisposition::Document;
    }
    let Ok(parsed) = Url::parse(url) else {
        return RequestDisposition::Deny;
    };
    let web = matches!(parsed.scheme(), "http" | "https");
    let reserved = parsed.host_str().is_none_or(|host| host.ends_with(".invalid"));
    if web && !reserved {
        RequestDisposition::Allow
    } else {
        RequestDisposition::Deny
    }
}

/// Answer one `Fetch.requestPaused` event
///
/// Only a failure to deliver the document is an error; other requests may
/// be cancelled by the page before the answer arrives.
async fn answer_request(
    client: &CdpClient,
    params: &Value,
    html: &str,
) -> Result<(), RenderError> {
    let request_id = params
        .get("requestId")
        .and_then(Value::as_str)
        .ok_or_else(|| RenderError::Protocol {
            detail: "Fetch.requestPaused without requestId".to_owned(),
        })?;
    let url = params
        .pointer("/request/url")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let disposition = classify_request(url);
    let (method, answer) = match disposition {
        RequestDisposition::Document => (
            "Fetch.fulfillRequest",
            json!({
                "requestId": request_id,
                "responseCode": 200,
                "responseHeaders": [
                    { "name": "Content-Type", "value": "text/html; charset=utf-8" },
                ],
                "body": STANDARD.encode(html),
            }),
        ),
        RequestDisposition::Allow => {
            ("Fetch.continueRequest", json!({ "requestId": request_id }))
        }
        RequestDisposition::Deny => (
            "Fetch.failRequest",
            json!({ "requestId": request_id, "errorReason": "AccessDenied" }),
        ),
    };

    if disposition == RequestDisposition::Deny {
        debug!(url, "refused non-web request from rendered message");
    }
    match client.call(method, answer).await {
        Ok(_) => Ok(()),
        Err(err) if disposition == RequestDisposition::Document => Err(err),
        Err(err) => {
            trace!(url, error = %err, "intercepted request already gone");
            Ok(())
        }
    }
}

/// Launches one headless browser per render
#[derive(Debug, Clone)]
pub struct ChromiumLauncher {
    executable: Option<PathBuf>,
    container_args: bool,
}

impl ChromiumLauncher {
    pub fn new(settings: &RendererSettings) -> Self {
        Self {
            executable: settings.executable_path.clone(),
            container_args: settings.container_args,
        }
    }
}

#[async_trait]
impl EngineLauncher for ChromiumLauncher {
    async fn launch(&self) -> Result<Box<dyn RenderEngine>, RenderError> {
        let executable = find_executable(self.executable.as_deref(), platform_candidate_paths())?;
        let profile = tempfile::Builder::new().prefix("mail-pdf-").tempdir()?;

        let mut child = Command::new(&executable)
            .args(launch_args(profile.path(), self.container_args))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RenderError::Launch(format!("{}: {e}", executable.display())))?;
        debug!(executable = %executable.display(), pid = ?child.id(), "browser started");

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RenderError::Launch("browser stderr unavailable".to_owned()))?;
        let mut lines = BufReader::new(stderr).lines();

        let ws_url = tokio::time::timeout(LAUNCH_TIMEOUT, async {
            while let Some(line) = lines.next_line().await? {
                if let Some(url) = parse_devtools_url(&line) {
                    return Ok(url.to_owned());
                }
                trace!(line, "browser stderr");
            }
            Err::<String, RenderError>(RenderError::Launch(
                "browser exited before exposing DevTools".to_owned(),
            ))
        })
        .await
        .map_err(|_| {
            RenderError::Launch(format!(
                "DevTools endpoint not available after {LAUNCH_TIMEOUT:?}"
            ))
        })??;

        // Keep draining stderr so the browser never blocks on a full pipe.
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                trace!(line, "browser stderr");
            }
        });

        let browser = CdpClient::connect(&ws_url).await?;
        Ok(Box::new(ChromiumEngine {
            child,
            browser,
            ws_url,
            _profile: profile,
        }))
    }
}

/// Running browser process plus its browser-level DevTools connection
struct ChromiumEngine {
    child: Child,
    browser: CdpClient,
    ws_url: String,
    /// Removed when the engine is dropped
    _profile: TempDir,
}

#[async_trait]
impl RenderEngine for ChromiumEngine {
    async fn new_page(&mut self) -> Result<Box<dyn RenderPage>, RenderError> {
        let created = self
            .browser
            .call("Target.createTarget", json!({ "url": "about:blank" }))
            .await?;
        let target_id = created
            .get("targetId")
            .and_then(Value::as_str)
            .ok_or_else(|| RenderError::Protocol {
                detail: "Target.createTarget returned no targetId".to_owned(),
            })?;

        let client = CdpClient::connect(&page_ws_url(&self.ws_url, target_id)?).await?;
        client.call("Page.enable", json!({})).await?;
        client.call("Runtime.enable", json!({})).await?;
        client
            .call("Page.setLifecycleEventsEnabled", json!({ "enabled": true }))
            .await?;

        Ok(Box::new(ChromiumPage { client }))
    }

    async fn close(&mut self) -> Result<(), RenderError> {
        if let Err(err) = self
            .browser
            .call_with_timeout("Browser.close", json!({}), EXIT_TIMEOUT)
            .await
        {
            debug!(error = %err, "Browser.close not acknowledged");
        }

        match tokio::time::timeout(EXIT_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(%status, "browser exited");
                Ok(())
            }
            Ok(Err(err)) => Err(err.into()),
            Err(_) => {
                warn!("browser did not exit in time, killing it");
                self.child.kill().await?;
                Ok(())
            }
        }
    }
}

/// One page target with its own DevTools connection
struct ChromiumPage {
    client: CdpClient,
}

impl ChromiumPage {
    /// Pause matching requests until answered through [`answer_request`]
    async fn intercept(&self, pattern: &str) -> Result<(), RenderError> {
        self.client
            .call("Fetch.enable", json!({ "patterns": [{ "urlPattern": pattern }] }))
            .await?;
        Ok(())
    }

    /// Navigate to the document address and serve `html` until `wait_until`
    async fn load_document(
        &mut self,
        html: &str,
        wait_until: WaitUntil,
        timeout: Duration,
    ) -> Result<(), RenderError> {
        let navigation = self
            .client
            .dispatch("Page.navigate", json!({ "url": DOCUMENT_URL }))
            .await?
            .wait(timeout.max(COMMAND_TIMEOUT));
        tokio::pin!(navigation);

        let stage = wait_until.lifecycle_event();
        let client = &mut self.client;
        tokio::time::timeout(timeout, async {
            let mut loader_id: Option<String> = None;
            // Lifecycle events can overtake the navigation response.
            let mut early: Vec<CdpEvent> = Vec::new();
            loop {
                tokio::select! {
                    result = &mut navigation, if loader_id.is_none() => {
                        let navigated = result?;
                        let failure = navigated.get("errorText").and_then(Value::as_str);
                        if let Some(reason) = failure {
                            return Err(RenderError::NavigationFailed {
                                reason: reason.to_owned(),
                            });
                        }
                        let id = navigated
                            .get("loaderId")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_owned();
                        if early.iter().any(|e| is_lifecycle_event(e, stage, Some(&id))) {
                            return Ok(());
                        }
                        loader_id = Some(id);
                    }
                    event = client.recv_event() => match event {
                        Some(event) if event.method == "Fetch.requestPaused" => {
                            answer_request(client, &event.params, html).await?;
                        }
                        Some(event) => match &loader_id {
                            Some(id) if is_lifecycle_event(&event, stage, Some(id)) => {
                                return Ok(());
                            }
                            Some(_) => {}
                            None => early.push(event),
                        },
                        None => {
                            return Err(RenderError::Protocol {
                                detail: "page connection closed while loading".to_owned(),
                            });
                        }
                    },
                }
            }
        })
        .await
        .map_err(|_| RenderError::NavigationTimeout { duration: timeout })?
    }
}

#[async_trait]
impl RenderPage for ChromiumPage {
    async fn set_content(
        &mut self,
        html: &str,
        wait_until: WaitUntil,
        timeout: Duration,
    ) -> Result<(), RenderError> {
        self.client.drain_events();
        self.intercept("*").await?;
        self.load_document(html, wait_until, timeout).await?;

        // Late web requests (fonts, lazy images) must not stay paused.
        self.intercept("file://*").await?;
        while let Some(event) = self.client.try_recv_event() {
            if event.method == "Fetch.requestPaused" {
                answer_request(&self.client, &event.params, html).await?;
            }
        }
        Ok(())
    }

    async fn wait_for_fonts(&mut self, timeout: Duration) -> Result<(), RenderError> {
        let result = self
            .client
            .call_with_timeout(
                "Runtime.evaluate",
                json!({
                    "expression": "document.fonts.ready.then(() => true)",
                    "awaitPromise": true,
                    "returnByValue": true,
                }),
                timeout,
            )
            .await?;

        if let Some(exception) = result.get("exceptionDetails") {
            let message = exception
                .pointer("/exception/description")
                .or_else(|| exception.get("text"))
                .and_then(Value::as_str)
                .unwrap_or("unknown exception")
                .to_owned();
            return Err(RenderError::JsException { message });
        }
        Ok(())
    }

    async fn print_pdf(&mut self, options: &PdfOptions) -> Result<Vec<u8>, RenderError> {
        let result = self
            .client
            .call_with_timeout("Page.printToPDF", options.to_params(), PRINT_TIMEOUT)
            .await?;
        let data = result
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| RenderError::Protocol {
                detail: "Page.printToPDF returned no data".to_owned(),
            })?;
        Ok(STANDARD.decode(data)?)
    }
}
