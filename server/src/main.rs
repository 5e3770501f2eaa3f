//! MemForge server binary: HTTP surface, MCP surface, schema bootstrap.

mod bolt;
mod http;
mod mcp;
mod state;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use memforge_core::config::Settings;

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "memforge-server")]
#[command(about = "MemForge - agentic long-term memory service")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/JSON API.
    ServeHttp {
        /// Listen address.
        #[arg(long, env = "MEMFORGE_HTTP_ADDR", default_value = "0.0.0.0:8765")]
        addr: String,
    },

    /// Run the MCP server on stdio for one client connection.
    ServeMcp {
        /// Namespace owner for this connection.
        #[arg(long, env = "MEMFORGE_USER_ID")]
        user_id: String,

        /// Client name, credited as the App on writes.
        #[arg(long, env = "MEMFORGE_CLIENT_NAME", default_value = "mcp")]
        client_name: String,
    },

    /// Apply the idempotent schema DDL and verify vector indexes.
    InitSchema,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional; the environment wins.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // On stdio transports the protocol owns stdout; log to stderr always.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings = Settings::from_env().context("loading settings")?;
    let state = AppState::initialize(settings).await?;

    match cli.command {
        Commands::ServeHttp { addr } => {
            state.init_schema().await?;
            let router = http::router(state.clone());
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("binding {addr}"))?;
            tracing::info!(%addr, "HTTP surface listening");
            axum::serve(listener, router).await?;
        }

        Commands::ServeMcp {
            user_id,
            client_name,
        } => {
            state.init_schema().await?;
            tracing::info!(%user_id, %client_name, "MCP server on stdio");
            mcp::serve(state.clone(), user_id, client_name).await?;
        }

        Commands::InitSchema => {
            state.init_schema().await?;
            tracing::info!("schema applied");
        }
    }

    state.shutdown().await;
    Ok(())
}
