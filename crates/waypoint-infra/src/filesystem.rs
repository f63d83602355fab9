//! Data directory layout.
//!
//! Everything Waypoint persists lives under one directory: `config.toml`
//! and the `waypoint.db` checkpoint database.

use std::path::PathBuf;

/// Environment variable that overrides the data directory.
pub const DATA_DIR_ENV: &str = "WAYPOINT_DATA_DIR";

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `WAYPOINT_DATA_DIR` environment variable
/// 2. `~/.waypoint`
/// 3. `.waypoint` in the current directory
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".waypoint");
    }

    PathBuf::from(".waypoint")
}

/// Create the data directory if needed and return it.
pub async fn ensure_data_dir(dir: PathBuf) -> Result<PathBuf, std::io::Error> {
    tokio::fs::create_dir_all(&dir).await?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_data_dir_is_not_empty() {
        let dir = resolve_data_dir();
        assert!(!dir.as_os_str().is_empty());
    }

    #[tokio::test]
    async fn test_ensure_data_dir_creates_nested() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a").join("b");
        let dir = ensure_data_dir(nested.clone()).await.unwrap();
        assert_eq!(dir, nested);
        assert!(nested.is_dir());
    }
}
