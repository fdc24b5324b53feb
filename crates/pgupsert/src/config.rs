//! Configuration file handling.
//!
//! Looks for `.config/pgupsert.styx` in the current directory or any parent directory.

pub use pgupsert_config::{ColumnPolicy, Config};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

const CONFIG_FILE: &str = ".config/pgupsert.styx";

/// Load configuration from `.config/pgupsert.styx`, searching up the directory tree.
pub fn load() -> Result<(Config, Utf8PathBuf), ConfigError> {
    let cwd = std::env::current_dir().map_err(|e| ConfigError::Io(e.to_string()))?;
    let cwd = Utf8PathBuf::try_from(cwd).map_err(|e| ConfigError::Io(e.to_string()))?;
    load_from(&cwd)
}

/// Load configuration starting from a specific directory.
pub fn load_from(start: &Utf8Path) -> Result<(Config, Utf8PathBuf), ConfigError> {
    let config_path = find_config_file(start)?;
    let content =
        std::fs::read_to_string(&config_path).map_err(|e| ConfigError::Io(e.to_string()))?;

    let config = parse(&content)?;
    tracing::debug!(path = %config_path, "loaded config");

    Ok((config, config_path))
}

/// Parse configuration from Styx source.
pub fn parse(content: &str) -> Result<Config, ConfigError> {
    facet_styx::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Find `.config/pgupsert.styx` by searching up the directory tree.
fn find_config_file(start: &Utf8Path) -> Result<Utf8PathBuf, ConfigError> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_FILE);
        if config_path.exists() {
            return Ok(config_path);
        }

        if !current.pop() {
            return Err(ConfigError::NotFound);
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No `.config/pgupsert.styx` found in any parent directory
    #[error("no .config/pgupsert.styx found in current directory or any parent")]
    NotFound,
    /// I/O error reading the file
    #[error("failed to read .config/pgupsert.styx: {0}")]
    Io(String),
    /// Parse error in the Styx file
    #[error("failed to parse .config/pgupsert.styx: {0}")]
    Parse(String),
}
