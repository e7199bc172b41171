//! CLI command implementations.
//!
//! | Module    | Commands handled |
//! |-----------|------------------|
//! | `serve`   | `Serve`          |
//! | `init_db` | `InitDb`         |
//! | `quote`   | `Quote`          |
//! | `config`  | `Config`         |

use anyhow::Result;

use homebid::config::HomebidConfig;

use crate::Cli;

pub mod config;
pub mod init_db;
pub mod quote;
pub mod serve;

pub use config::cmd_config;
pub use init_db::cmd_init_db;
pub use quote::cmd_quote;
pub use serve::{ServeOverrides, cmd_serve};

/// File settings with environment overrides applied.
pub fn load_config(cli: &Cli) -> Result<HomebidConfig> {
    let mut config = HomebidConfig::load_or_default(&cli.config)?;
    config.apply_env()?;
    Ok(config)
}
