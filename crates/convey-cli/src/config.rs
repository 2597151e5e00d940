//! Configuration file management for convey.
//!
//! Provides a TOML-based config file at `~/.config/convey/config.toml`
//! and a resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use convey_db::config::DbConfig;

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
    /// Warehouse URL; the catalog URL doubles as the warehouse when
    /// absent.
    pub warehouse_url: Option<String>,
}

/// Return the convey config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/convey` or
/// `~/.config/convey`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("convey");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("convey")
}

/// Return the path to the convey config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Write the config file. Refuses to overwrite unless `force` is set.
pub fn write_config(db_url: &str, warehouse_url: Option<&str>, force: bool) -> Result<PathBuf> {
    let path = config_path();
    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {} (use --force to overwrite)",
            path.display()
        );
    }

    let config = ConfigFile {
        database: DatabaseSection {
            url: db_url.to_owned(),
            warehouse_url: warehouse_url.map(str::to_owned),
        },
    };

    std::fs::create_dir_all(config_dir())
        .with_context(|| format!("failed to create {}", config_dir().display()))?;
    std::fs::write(&path, toml::to_string_pretty(&config)?)
        .with_context(|| format!("failed to write {}", path.display()))?;

    Ok(path)
}

fn read_config() -> Result<Option<ConfigFile>> {
    let path = config_path();
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: ConfigFile =
        toml::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(config))
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct ConveyConfig {
    pub db_config: DbConfig,
}

impl ConveyConfig {
    /// Resolve: CLI flag > `CONVEY_DATABASE_URL` > config file > default.
    pub fn resolve(cli_url: Option<&str>) -> Result<Self> {
        if let Some(url) = cli_url {
            return Ok(Self {
                db_config: DbConfig::new(url),
            });
        }
        if std::env::var("CONVEY_DATABASE_URL").is_ok() {
            return Ok(Self {
                db_config: DbConfig::from_env(),
            });
        }
        if let Some(file) = read_config()? {
            let mut db_config = DbConfig::new(&file.database.url);
            if let Some(warehouse) = file.database.warehouse_url {
                db_config.warehouse_url = warehouse;
            }
            return Ok(Self { db_config });
        }
        Ok(Self {
            db_config: DbConfig::from_env(),
        })
    }
}
