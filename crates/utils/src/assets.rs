use std::{env, path::PathBuf};

use directories::ProjectDirs;

const PROJECT_ROOT: &str = env!("CARGO_MANIFEST_DIR");
const ASSET_DIR_ENV: &str = "A2A_ASSET_DIR";

/// Directory holding the SQLite database and `config.json`.
///
/// Resolution order: `A2A_ASSET_DIR`, then `dev_assets/` at the workspace
/// root for debug builds, then the platform data directory.
pub fn asset_dir() -> PathBuf {
    if let Ok(custom_dir) = env::var(ASSET_DIR_ENV) {
        PathBuf::from(custom_dir)
    } else if cfg!(debug_assertions) {
        PathBuf::from(PROJECT_ROOT).join("../../dev_assets")
    } else {
        ProjectDirs::from("dev", "a2a", "bookmark-orchestrator")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".a2a"))
    }
    // ✔ macOS → ~/Library/Application Support/bookmark-orchestrator
    // ✔ Linux → ~/.local/share/bookmark-orchestrator (respects XDG_DATA_HOME)
    // ✔ Windows → %APPDATA%\a2a\bookmark-orchestrator
}

/// Creates the asset directory if needed and returns it.
pub fn ensure_asset_dir() -> std::io::Result<PathBuf> {
    let path = asset_dir();
    if !path.exists() {
        std::fs::create_dir_all(&path)?;
        tracing::info!("Created asset directory: {}", path.display());
    }
    Ok(path)
}

pub fn config_path() -> PathBuf {
    asset_dir().join("config.json")
}

pub fn database_path() -> PathBuf {
    asset_dir().join("db.sqlite")
}
