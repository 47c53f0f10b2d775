// ABOUTME: XDG Base Directory paths for cross-platform config and data storage
// ABOUTME: Provides standardized paths for the session database, pointer registry, logs, and config

use directories::ProjectDirs;
use std::path::PathBuf;

/// Application identifier for XDG directories
const QUALIFIER: &str = "com";
const ORGANIZATION: &str = "parley";
const APPLICATION: &str = "parley";

/// Get XDG-compliant directories for the application
pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
}

/// Get the data directory path (e.g., ~/.local/share/parley/)
/// Falls back to ./data if XDG directories unavailable
pub fn data_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./data"))
}

/// Get the config directory path (e.g., ~/.config/parley/)
/// Falls back to current directory if XDG directories unavailable
pub fn config_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Get the default config file path
/// e.g., ~/.config/parley/config.toml
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Session database inside a data directory
pub fn sessions_db(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("sessions.db")
}

/// Active-pointer registry inside a data directory
pub fn pointer_registry(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("preferences").join("session-pointers.json")
}
