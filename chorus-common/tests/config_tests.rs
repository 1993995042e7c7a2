//! Config file resolution tests
//!
//! Tests that touch CHORUS_CONFIG are marked #[serial] so they never race on
//! the process environment.

use chorus_common::config::{
    default_config_path, load_or_default, resolve_config_path, CONFIG_ENV_VAR,
};
use chorus_common::Error;
use serde::Deserialize;
use serial_test::serial;
use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Deserialize, PartialEq)]
struct PlayerSettings {
    #[serde(default)]
    volume: f32,
    #[serde(default)]
    muted: bool,
}

#[test]
fn test_default_config_path_is_under_chorus_dir() {
    if let Some(path) = default_config_path() {
        assert!(path.ends_with("chorus/config.toml"));
    }
}

#[test]
#[serial]
fn test_empty_env_var_is_ignored() {
    env::set_var(CONFIG_ENV_VAR, "");
    let resolved = resolve_config_path(None, CONFIG_ENV_VAR);
    assert_ne!(resolved, Some(PathBuf::from("")));
    env::remove_var(CONFIG_ENV_VAR);
}

#[test]
#[serial]
fn test_env_var_points_at_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "volume = 0.75\nmuted = true").unwrap();
    env::set_var(CONFIG_ENV_VAR, file.path());

    let settings: PlayerSettings = load_or_default(None, CONFIG_ENV_VAR).unwrap();
    assert_eq!(
        settings,
        PlayerSettings {
            volume: 0.75,
            muted: true
        }
    );
    env::remove_var(CONFIG_ENV_VAR);
}

#[test]
#[serial]
fn test_missing_explicit_file_is_an_error() {
    env::remove_var(CONFIG_ENV_VAR);
    let result: chorus_common::Result<PlayerSettings> =
        load_or_default(Some(Path::new("/no/such/chorus.toml")), CONFIG_ENV_VAR);
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
#[serial]
fn test_malformed_file_reports_toml_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "volume = [").unwrap();

    let result: chorus_common::Result<PlayerSettings> =
        load_or_default(Some(file.path()), CONFIG_ENV_VAR);
    assert!(matches!(result, Err(Error::Toml(_))));
}
