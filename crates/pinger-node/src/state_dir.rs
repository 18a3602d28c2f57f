use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

const STATE_DIR_ENV: &str = "PINGER_STATE_DIR";
const DEFAULT_STATE_DIR: &str = ".local/state/pinger";
const DB_FILE: &str = "pinger.db";

/// `$PINGER_STATE_DIR`, else `~/.local/state/pinger`.
pub fn default_state_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(STATE_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }
    let home = std::env::var("HOME").context("HOME env var not set")?;
    Ok(PathBuf::from(home).join(DEFAULT_STATE_DIR))
}

/// SQLite database used when `--db` is not given.
pub fn default_db_path(state_dir: &Path) -> PathBuf {
    state_dir.join(DB_FILE)
}

/// Create the state directory if needed and restrict it to the owner.
/// It holds the host id and the device database.
pub fn ensure_state_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("failed to create state dir {}", path.display()))?;
    #[cfg(unix)]
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .with_context(|| format!("failed to restrict state dir {}", path.display()))?;
    Ok(())
}
