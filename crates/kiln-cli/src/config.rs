//! Operator configuration for the kiln CLI.
//!
//! A small TOML file holds the two service URLs; resolution layers CLI
//! flags over environment variables over the file over compiled defaults.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use kiln_core::broker::BrokerConfig;
use kiln_db::config::DbConfig;

/// On-disk configuration: one `[section]` with a `url` per service.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: Endpoint,
    pub broker: Endpoint,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Endpoint {
    pub url: String,
}

impl ConfigFile {
    /// Location of the config file: `<config dir>/kiln/config.toml`.
    pub fn path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kiln")
            .join("config.toml")
    }

    /// Read the config file if one exists. A missing file is `Ok(None)`;
    /// an unreadable or unparseable one is an error worth surfacing.
    pub fn load() -> Result<Option<Self>> {
        let path = Self::path();
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };

        let parsed = toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Some(parsed))
    }

    /// Write the config file, creating its directory as needed. On Unix the
    /// file is created with 0600 permissions, since the URLs may embed
    /// credentials. Returns the path written.
    pub fn write(&self) -> Result<PathBuf> {
        let path = Self::path();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        file.write_all(contents.as_bytes())
            .with_context(|| format!("failed to write {}", path.display()))?;

        Ok(path)
    }
}

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct KilnCliConfig {
    pub db_config: DbConfig,
    pub broker_config: BrokerConfig,
}

impl KilnCliConfig {
    /// Resolve each URL through the chain: CLI flag > env var > config file
    /// > compiled default.
    ///
    /// An unreadable config file is logged and skipped rather than blocking
    /// commands that never needed it.
    pub fn resolve(cli_db_url: Option<&str>, cli_redis_url: Option<&str>) -> Result<Self> {
        let file = ConfigFile::load().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "ignoring unreadable config file");
            None
        });

        let pick = |cli: Option<&str>, env_key: &str, from_file: Option<&str>, default: &str| {
            if let Some(url) = cli {
                return url.to_owned();
            }
            if let Ok(url) = std::env::var(env_key) {
                return url;
            }
            if let Some(url) = from_file {
                return url.to_owned();
            }
            default.to_owned()
        };

        let db_url = pick(
            cli_db_url,
            "KILN_DATABASE_URL",
            file.as_ref().map(|f| f.database.url.as_str()),
            DbConfig::DEFAULT_URL,
        );
        let broker_url = pick(
            cli_redis_url,
            "KILN_REDIS_URL",
            file.as_ref().map(|f| f.broker.url.as_str()),
            BrokerConfig::DEFAULT_URL,
        );

        Ok(Self {
            db_config: DbConfig::new(db_url),
            broker_config: BrokerConfig::new(broker_url),
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
