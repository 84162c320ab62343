// tunnelkeep - Last Error File
// One-line state file recording the most recent classified connection
// failure, so a later doctor sweep can surface it after the daemon has
// exited. Written best-effort by the supervisor; a write failure is a
// warning, never a control-flow change.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

use tunnelkeep_common::ErrorClass;

/// Default location: `<config_dir>/tunnelkeep/last_error`
pub fn default_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
    Ok(config_dir.join("tunnelkeep").join("last_error"))
}

/// Record a classified failure, replacing any previous record.
pub fn record(path: &Path, class: ErrorClass) {
    if let Err(e) = write_class(path, class) {
        warn!("Failed to record last error class: {}", e);
    }
}

/// Forget the recorded failure. Called when a connection succeeds.
pub fn clear(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to clear last error file: {}", e);
        }
    }
}

/// The recorded class, if any. Unreadable or unrecognized content counts
/// as absent.
pub fn load(path: &Path) -> Option<ErrorClass> {
    let text = fs::read_to_string(path).ok()?;
    text.trim().parse().ok()
}

fn write_class(path: &Path, class: ErrorClass) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    fs::write(path, format!("{class}\n"))
        .context(format!("Failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_record_load_clear() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("last_error");

        assert_eq!(load(&path), None);

        record(&path, ErrorClass::Timeout);
        assert_eq!(load(&path), Some(ErrorClass::Timeout));

        // a newer failure replaces the old record
        record(&path, ErrorClass::Refused);
        assert_eq!(load(&path), Some(ErrorClass::Refused));

        clear(&path);
        assert_eq!(load(&path), None);
        // clearing twice is fine
        clear(&path);
    }

    #[test]
    fn test_garbage_content_counts_as_absent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("last_error");
        fs::write(&path, "not a class\n").unwrap();
        assert_eq!(load(&path), None);
    }
}
