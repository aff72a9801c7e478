use std::path::PathBuf;

/// Returns the config/data directory path for tentacle tools.
pub fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("tentacle")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("tentacle")
    } else {
        PathBuf::from("/tmp/tentacle")
    }
}

/// Returns the client options file path.
pub fn config_path() -> PathBuf {
    dirs_path().join("client.toml")
}

/// Returns the default location for a persisted command context.
pub fn default_state_path() -> PathBuf {
    dirs_path().join("last-script.json")
}
