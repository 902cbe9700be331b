//! Local smoke test: boot the server on a loopback port and check it
//!
//! Missing configuration is reported but not fatal. In development the
//! diagnostics routes are exercised too, including a real PDF render.

use std::process::ExitCode;
use std::time::{Duration, Instant};

use reqwest::header::CONTENT_TYPE;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::ServerConfig;
use crate::routes::{AppState, build_router};

/// Port used when none is given on the command line
pub const DEFAULT_PORT: u16 = 3010;

const HEALTH_WAIT: Duration = Duration::from_secs(15);
const HEALTH_POLL: Duration = Duration::from_millis(250);
/// Generous enough to cover a cold browser start plus the load fallback
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
enum CheckFailure {
    #[error("timed out waiting for /health")]
    HealthTimeout,
    #[error("{path} returned status {status}")]
    Status { path: &'static str, status: u16 },
    #[error("/health returned body {0:?}")]
    HealthBody(String),
    #[error("unexpected Content-Type on /debug/pdf: {0}")]
    ContentType(String),
    #[error("empty PDF from /debug/pdf")]
    EmptyPdf,
    #[error("failed to bind check port: {0}")]
    Bind(#[from] std::io::Error),
    #[error("startup failed: {0}")]
    Startup(String),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Run every check against an in-process server built from `config`
pub async fn run(config: ServerConfig, port: u16) -> ExitCode {
    let missing = config.missing_settings();
    if missing.is_empty() {
        println!("[check] configuration ok");
    } else {
        println!("[check] configuration missing (not blocking): {}", missing.join(", "));
    }

    let outcome = match AppState::from_config(config) {
        Ok(state) => check_state(state, port).await,
        Err(err) => Err(CheckFailure::Startup(err.to_string())),
    };
    match outcome {
        Ok(()) => {
            println!("[check] completed successfully");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("[check] failed: {err}");
            ExitCode::FAILURE
        }
    }
}

/// Serve `state` on `127.0.0.1:port` for the duration of the checks
async fn check_state(state: AppState, port: u16) -> Result<(), CheckFailure> {
    let development = state.config.is_development();
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    let base = format!("http://{}", listener.local_addr()?);

    let shutdown = CancellationToken::new();
    let router = build_router(state);
    let stop = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(stop.cancelled_owned())
            .await
    });

    let result = run_checks(&base, development).await;

    shutdown.cancel();
    match server.await {
        Ok(Err(err)) => warn!(error = %err, "check server exited with an error"),
        Err(err) => warn!(error = %err, "check server task failed"),
        Ok(Ok(())) => {}
    }
    result
}

async fn run_checks(base: &str, development: bool) -> Result<(), CheckFailure> {
    let client = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new());

    wait_for_health(&client, base).await?;
    let health = client.get(format!("{base}/health")).send().await?;
    let status = health.status();
    let body = health.text().await?;
    if !status.is_success() {
        return Err(CheckFailure::Status {
            path: "/health",
            status: status.as_u16(),
        });
    }
    if body.trim() != "ok" {
        return Err(CheckFailure::HealthBody(body));
    }
    println!("[check] /health ok");

    if !development {
        println!("[check] /debug/env and /debug/pdf skipped (not in development)");
        return Ok(());
    }

    let env = client.get(format!("{base}/debug/env")).send().await?;
    if !env.status().is_success() {
        return Err(CheckFailure::Status {
            path: "/debug/env",
            status: env.status().as_u16(),
        });
    }
    let report: serde_json::Value = env.json().await?;
    let reported = report["missing"].as_array().map_or(0, Vec::len);
    println!("[check] /debug/env ok (missing reported: {reported})");

    let pdf = client.get(format!("{base}/debug/pdf")).send().await?;
    if !pdf.status().is_success() {
        return Err(CheckFailure::Status {
            path: "/debug/pdf",
            status: pdf.status().as_u16(),
        });
    }
    let content_type = pdf
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    if !content_type.contains("application/pdf") {
        return Err(CheckFailure::ContentType(content_type));
    }
    let bytes = pdf.bytes().await?;
    if bytes.is_empty() {
        return Err(CheckFailure::EmptyPdf);
    }
    println!("[check] /debug/pdf ok ({} bytes)", bytes.len());
    Ok(())
}

async fn wait_for_health(client: &reqwest::Client, base: &str) -> Result<(), CheckFailure> {
    let started = Instant::now();
    while started.elapsed() < HEALTH_WAIT {
        let ready = client
            .get(format!("{base}/health"))
            .send()
            .await
            .is_ok_and(|r| r.status().is_success());
        if ready {
            return Ok(());
        }
        tokio::time::sleep(HEALTH_POLL).await;
    }
    Err(CheckFailure::HealthTimeout)
}

#[cfg(test)]
mod tests {
    use super::{CheckFailure, check_state};
    use crate::test_support::{complete_config, fake_state};

    #[tokio::test]
    async fn development_checks_cover_debug_routes() {
        let state = fake_state(complete_config("development"));
        check_state(state, 0).await.expect("checks pass");
    }

    #[tokio::test]
    async fn production_checks_only_health() {
        let state = fake_state(complete_config("production"));
        check_state(state, 0).await.expect("checks pass");
    }

    #[tokio::test]
    async fn occupied_port_is_reported() {
        let holder = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = holder.local_addr().expect("addr").port();
        let state = fake_state(complete_config("production"));
        let err = check_state(state, port).await.expect_err("port in use");
        assert!(matches!(err, CheckFailure::Bind(_)));
    }
}
