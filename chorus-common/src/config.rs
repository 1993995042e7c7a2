//! Configuration file resolution and TOML loading
//!
//! Config file lookup follows a fixed priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. `<user config dir>/chorus/config.toml`, if it exists
//! 4. None (callers fall back to built-in defaults)

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Environment variable consulted for the config file path
pub const CONFIG_ENV_VAR: &str = "CHORUS_CONFIG";

/// Resolve which config file to read, if any
///
/// An explicit path (CLI or environment) is returned even if it does not
/// exist, so that the caller reports the missing file instead of silently
/// running on defaults.
pub fn resolve_config_path(cli_arg: Option<&Path>, env_var_name: &str) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    // Priority 3: Per-user config file
    let user_config = default_config_path()?;
    if user_config.exists() {
        Some(user_config)
    } else {
        debug!("No config file at {}", user_config.display());
        None
    }
}

/// Per-user default config file location for the platform
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("chorus").join("config.toml"))
}

/// Parse a TOML document into `T`
pub fn parse_toml<T: DeserializeOwned>(content: &str) -> Result<T> {
    Ok(toml::from_str(content)?)
}

/// Read and parse a TOML file into `T`
pub fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        warn!("Failed to read config file {}: {}", path.display(), e);
        Error::Config(format!("Cannot read {}: {}", path.display(), e))
    })?;
    parse_toml(&content)
}

/// Load `T` from the resolved config file, or return `T::default()`
///
/// A missing optional config is not an error; an unreadable or malformed
/// explicit one is.
pub fn load_or_default<T: DeserializeOwned + Default>(
    cli_arg: Option<&Path>,
    env_var_name: &str,
) -> Result<T> {
    match resolve_config_path(cli_arg, env_var_name) {
        Some(path) => load_toml(&path),
        None => Ok(T::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serial_test::serial;
    use std::io::Write;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    struct Sample {
        #[serde(default)]
        volume: f32,
        #[serde(default)]
        name: String,
    }

    #[test]
    #[serial]
    fn test_cli_arg_wins_over_env() {
        std::env::set_var("CHORUS_TEST_CFG", "/tmp/from-env.toml");
        let resolved = resolve_config_path(Some(Path::new("/tmp/from-cli.toml")), "CHORUS_TEST_CFG");
        assert_eq!(resolved, Some(PathBuf::from("/tmp/from-cli.toml")));
        std::env::remove_var("CHORUS_TEST_CFG");
    }

    #[test]
    #[serial]
    fn test_env_var_used_without_cli_arg() {
        std::env::set_var("CHORUS_TEST_CFG", "/tmp/from-env.toml");
        let resolved = resolve_config_path(None, "CHORUS_TEST_CFG");
        assert_eq!(resolved, Some(PathBuf::from("/tmp/from-env.toml")));
        std::env::remove_var("CHORUS_TEST_CFG");
    }

    #[test]
    fn test_parse_toml() {
        let sample: Sample = parse_toml("volume = 0.5\nname = \"bark\"").unwrap();
        assert_eq!(sample.volume, 0.5);
        assert_eq!(sample.name, "bark");
    }

    #[test]
    fn test_parse_toml_rejects_malformed() {
        let result: Result<Sample> = parse_toml("volume = = 0.5");
        assert!(matches!(result, Err(Error::Toml(_))));
    }

    #[test]
    fn test_load_toml_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "volume = 0.25").unwrap();

        let sample: Sample = load_toml(file.path()).unwrap();
        assert_eq!(sample.volume, 0.25);
        assert!(sample.name.is_empty());
    }

    #[test]
    fn test_load_toml_missing_file_is_config_error() {
        let result: Result<Sample> = load_toml(Path::new("/definitely/not/here.toml"));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    #[serial]
    fn test_load_or_default_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "name = \"explicit\"").unwrap();

        let sample: Sample = load_or_default(Some(file.path()), "CHORUS_TEST_UNSET").unwrap();
        assert_eq!(sample.name, "explicit");
    }
}
