//! XDG directory helpers for config/data locations.

use std::path::PathBuf;

/// Base directory for persistent data (recovery records, logs).
///
/// Uses `NFSD_DATA_DIR` if set, otherwise `$XDG_DATA_HOME/nfsd-rs` or
/// `~/.local/share/nfsd-rs`.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("NFSD_DATA_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    std::env::var("XDG_DATA_HOME")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local")
                .join("share")
        })
        .join("nfsd-rs")
}

/// Default root for the FS and KV recovery backends.
pub fn recovery_dir() -> PathBuf {
    data_dir().join("recovery")
}

/// Default clustered grace database directory.
pub fn grace_db_dir() -> PathBuf {
    data_dir().join("grace")
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Base directory for configuration files.
///
/// Uses `NFSD_CONFIG_DIR` if set, otherwise `$XDG_CONFIG_HOME/nfsd-rs` or
/// `~/.config/nfsd-rs`.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("NFSD_CONFIG_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    dirs::config_dir()
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".config")
        })
        .join("nfsd-rs")
}
