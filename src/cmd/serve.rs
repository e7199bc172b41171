//! Marketplace server command for `homebid serve`.

use anyhow::Result;
use std::path::PathBuf;

use homebid::market::server::start_server;

use crate::Cli;

/// Flags that override the file and environment settings.
#[derive(Debug, Default)]
pub struct ServeOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub db_path: Option<PathBuf>,
    pub dev: bool,
}

pub async fn cmd_serve(cli: &Cli, overrides: ServeOverrides) -> Result<()> {
    let config = super::load_config(cli)?;
    let _guard = homebid::logging::init(&config.logging, cli.verbose)?;

    for warning in config.validate() {
        tracing::warn!("config: {}", warning);
    }

    let mut server = config.server_config();
    if let Some(host) = overrides.host {
        server.host = host;
    }
    if let Some(port) = overrides.port {
        server.port = port;
    }
    if let Some(db_path) = overrides.db_path {
        server.db_path = db_path;
    }
    server.dev_mode |= overrides.dev;

    start_server(server).await
}
