//! mail-pdf-rs: Gmail inbox browser backend with PDF export
//!
//! Users connect a Gmail account through Google OAuth, browse recent messages,
//! and download any message as a styled PDF printed by headless Chromium.
//! Sessions are opaque bearer tokens held in memory.
//!
//! # Architecture
//!
//! - [`main`]: Process entry point with env loading, CLI, and HTTP serving
//! - [`config`]: Environment-driven server, OAuth, session, and renderer settings
//! - [`errors`]: Application error model with HTTP response mapping
//! - [`gmail`]: OAuth code exchange, token refresh, and Gmail REST calls
//! - [`session`]: In-memory bearer-token store with TTL and background sweep
//! - [`auth`]: Bearer-token gate and configuration gate for `/api`
//! - [`routes`]: HTTP handlers, CORS, filename sanitization, diagnostics
//! - [`models`]: Request/response DTOs
//! - [`mime`]: MIME tree walking, header extraction, and body selection
//! - [`message_id`]: Message id validation
//! - [`render`]: HTML document composition and PDF printing over DevTools
//! - [`selfcheck`]: Local smoke test of a freshly started server

mod auth;
mod config;
mod errors;
mod gmail;
mod message_id;
mod mime;
mod models;
mod render;
mod routes;
mod selfcheck;
mod session;
#[cfg(test)]
mod test_support;

use std::net::SocketAddr;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::ServerConfig;
use routes::{AppState, build_router};

#[derive(Debug, Parser)]
#[command(name = "mail-pdf-rs", version, about = "Gmail inbox browser backend with PDF export")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP server (default)
    Serve {
        /// Listen port, overrides PORT
        #[arg(long)]
        port: Option<u16>,
    },
    /// Start the server on a loopback port and check its health and diagnostics
    Selfcheck {
        /// Loopback port for the temporary server, overrides SELFCHECK_PORT
        #[arg(long, env = "SELFCHECK_PORT", default_value_t = selfcheck::DEFAULT_PORT)]
        port: u16,
    },
}

/// Application entry point
///
/// Loads `.env`, initializes tracing from `RUST_LOG`, and either serves HTTP
/// or runs the self-check.
///
/// # Environment Variables
///
/// See [`ServerConfig::load_from_env`] for full configuration options.
///
/// # Example
///
/// ```no_run
/// GOOGLE_CLIENT_ID=1234.apps.googleusercontent.com \
/// GOOGLE_CLIENT_SECRET=secret \
/// GOOGLE_REDIRECT_URI=http://localhost:3000/auth/google/callback \
/// FRONTEND_ORIGIN=http://localhost:5500 \
/// cargo run -- serve
/// ```
#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ServerConfig::load_from_env()?;

    match cli.command.unwrap_or(Command::Serve { port: None }) {
        Command::Serve { port } => {
            serve(config, port).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Selfcheck { port } => Ok(selfcheck::run(config, port).await),
    }
}

async fn serve(
    mut config: ServerConfig,
    port: Option<u16>,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(port) = port {
        config.port = port;
    }

    let missing = config.missing_settings();
    if !missing.is_empty() {
        error!(missing = ?missing, "required settings missing; OAuth and /api will answer 500");
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let sweep_interval = config.session.sweep_interval;
    let state = AppState::from_config(config)?;
    info!(
        environment = %state.config.environment,
        session_ttl_secs = state.config.session.ttl.as_secs(),
        "server configured"
    );

    let shutdown = CancellationToken::new();
    let sweeper =
        session::spawn_sweeper(state.sessions.clone(), sweep_interval, shutdown.clone());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("failed to bind {addr}: {e}"))?;
    info!(addr = %addr, "starting HTTP server");

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown requested");
                signal.cancel();
            }
            Err(e) => warn!(error = %e, "failed to listen for shutdown signal"),
        }
    });

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .map_err(|e| format!("HTTP server error: {e}"))?;

    shutdown.cancel();
    let _ = sweeper.await;
    Ok(())
}
