use std::path::PathBuf;

use clap::Parser;
use clap::builder::Styles;
use clap::builder::styling::{AnsiColor, Effects};
use openapi_mcp_server::runtime::{self, Config};
use openapi_mcp_server::server::Server;
use tracing::info;

/// Clap styling
const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default());

/// Arguments to the MCP gateway
#[derive(Debug, Parser)]
#[command(
    version,
    styles = STYLES,
    about = "OpenAPI MCP Gateway - expose an OpenAPI-described HTTP API as MCP tools",
)]
struct Args {
    /// Path to an optional YAML config file; environment variables override it
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;
    runtime::init_logging(&config);

    info!(
        "OpenAPI MCP Gateway v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    Server::builder().config(config).build().start().await?;
    Ok(())
}
