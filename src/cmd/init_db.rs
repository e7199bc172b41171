//! Database bootstrap command for `homebid init-db`.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::info;

use homebid::market::db::MarketDb;
use homebid::market::models::Role;

use crate::Cli;

pub fn cmd_init_db(cli: &Cli, db_path: Option<PathBuf>, admin: Option<(&str, &str)>) -> Result<()> {
    let config = super::load_config(cli)?;
    let _guard = homebid::logging::init(&config.logging, cli.verbose)?;

    let db_path = db_path.unwrap_or(config.server.db_path);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = MarketDb::new(&db_path)?;
    info!(db = %db_path.display(), "database initialized");
    println!("Database initialized at {}", db_path.display());

    if let Some((email, name)) = admin {
        let normalized = email.trim().to_lowercase();
        let existing = db.list_users()?.into_iter().find(|u| u.email == normalized);
        match existing {
            Some(user) => println!("User {} already exists (id {})", user.email, user.id),
            None => {
                let user = db.create_user(name, email, Role::Admin)?;
                println!("Created admin {} (id {})", user.email, user.id);
            }
        }
    }

    Ok(())
}
