use std::path::PathBuf;

const HOME_VAR: &str = "SD_ADMIN_HOME";

/// Admin tool configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory holding the index, the instance id and backups
    pub home: PathBuf,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional environment variables:
    /// - `SD_ADMIN_HOME`: data directory (supports ~ for home directory).
    ///   Defaults to `<platform data dir>/sd-admin`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_home_var(std::env::var(HOME_VAR).ok().as_deref())
    }

    /// Build from the raw value of `SD_ADMIN_HOME`, if set.
    pub fn from_home_var(value: Option<&str>) -> Result<Self, ConfigError> {
        let home = match value.map(str::trim).filter(|v| !v.is_empty()) {
            Some(path) => expand_tilde(path),
            None => dirs::data_dir()
                .ok_or(ConfigError::NoDataDir)?
                .join("sd-admin"),
        };
        Ok(Self { home })
    }

    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    /// Index file, relative to `home`.
    pub fn index_file(&self) -> &'static str {
        "index.json"
    }

    pub fn instance_id_file(&self) -> &'static str {
        "instance-id"
    }

    pub fn backups_dir(&self) -> &'static str {
        "backups"
    }
}

/// Expand ~ or ~/ prefix to the user's home directory.
fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"))
    } else if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path))
    } else {
        PathBuf::from(path)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("SD_ADMIN_HOME is not set and no platform data directory is available")]
    NoDataDir,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_home() {
        let config = Config::from_home_var(Some("/var/lib/sd")).unwrap();
        assert_eq!(config.home, PathBuf::from("/var/lib/sd"));
    }

    #[test]
    fn test_tilde_expansion() {
        let Some(user_home) = dirs::home_dir() else {
            return;
        };
        let config = Config::from_home_var(Some("~/notes-admin")).unwrap();
        assert_eq!(config.home, user_home.join("notes-admin"));
    }

    #[test]
    fn test_blank_value_uses_default() {
        if let Some(data) = dirs::data_dir() {
            let config = Config::from_home_var(Some("  ")).unwrap();
            assert_eq!(config.home, data.join("sd-admin"));
        }
    }
}
