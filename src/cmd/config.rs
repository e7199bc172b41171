//! Configuration view and validation commands for `homebid config`.

use anyhow::{Context, Result};

use homebid::config::HomebidConfig;

use super::super::{Cli, ConfigCommands};

pub fn cmd_config(cli: &Cli, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = &cli.config;

    match command {
        None | Some(ConfigCommands::Show) => {
            if config_path.exists() {
                println!("# Config file: {}", config_path.display());
            } else {
                println!("# No config file at {}; using defaults", config_path.display());
            }
            println!("# Effective values (with environment overrides):");
            println!();
            let config = super::load_config(cli)?;
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            print!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            if !config_path.exists() {
                println!("No config file at {}. Using defaults (valid).", config_path.display());
                return Ok(());
            }

            let config = HomebidConfig::load(config_path)?;
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
        }
        Some(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "{} already exists. Use --force to overwrite.",
                    config_path.display()
                );
            }
            if let Some(parent) = config_path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent).context("Failed to create config directory")?;
            }
            HomebidConfig::default().save(config_path)?;
            println!("Wrote default configuration to {}", config_path.display());
        }
    }

    Ok(())
}
