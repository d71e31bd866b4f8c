//! Root folder resolution and config file loading

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::info;

/// Environment variable naming the root folder
pub const ROOT_FOLDER_ENV: &str = "ICCID_ROOT_FOLDER";

/// Database file name inside the root folder
pub const DATABASE_FILE: &str = "iccid.db";

/// Root folder resolution, highest priority first:
/// 1. Command-line argument
/// 2. Environment variable
/// 3. OS-dependent compiled default
pub fn resolve_root_folder(cli_arg: Option<&str>, env_var_name: &str) -> PathBuf {
    if let Some(path) = cli_arg {
        return PathBuf::from(path);
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    get_default_root_folder()
}

/// Get OS-dependent default root folder path
fn get_default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/iccid-verifier (or /var/lib/iccid-verifier system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("iccid-verifier"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/iccid-verifier"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("iccid-verifier"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/iccid-verifier"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("iccid-verifier"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\iccid-verifier"))
    } else {
        PathBuf::from("./iccid_data")
    }
}

/// Create the root folder if missing
pub fn ensure_root_folder(root: &Path) -> Result<()> {
    if !root.exists() {
        std::fs::create_dir_all(root)?;
        info!("Created root folder: {}", root.display());
    }
    if !root.is_dir() {
        return Err(Error::Config(format!(
            "Root folder is not a directory: {}",
            root.display()
        )));
    }
    Ok(())
}

/// Path of the shared database inside `root`
pub fn database_path(root: &Path) -> PathBuf {
    root.join(DATABASE_FILE)
}

/// Load a TOML file into `T`.
///
/// A missing file yields `T::default()`; a malformed one is a config error.
pub fn load_toml_or_default<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        info!("Config file not found, using defaults: {}", path.display());
        return Ok(T::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))
}
