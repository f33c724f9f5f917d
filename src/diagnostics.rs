//! Diagnostics helpers for the dispatch panel.
//!
//! Provides:
//! - **About info**: version, build timestamp, git SHA, platform
//! - **Log rotation helpers**: used by `lib.rs` to configure rolling log files

use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// File name prefix handed to the rolling appender.
pub const LOG_FILE_PREFIX: &str = "panel";

/// Returns version, build timestamp, git SHA, and platform info.
pub fn about_info() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
    })
}

pub fn get_log_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join("dispatch-panel").join("logs")
}

/// Prune old log files, keeping only the most recent `MAX_LOG_FILES`.
pub fn prune_old_logs() {
    prune_logs_in(&get_log_dir(), MAX_LOG_FILES);
}

fn prune_logs_in(log_dir: &Path, keep: usize) {
    if !log_dir.exists() {
        return;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_panel_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name.starts_with(&format!("{LOG_FILE_PREFIX}.")));
            if is_panel_log {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, _) in log_files.iter().skip(keep) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to prune log file {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_about_info_has_version() {
        let info = about_info();
        assert_eq!(info["version"], env!("CARGO_PKG_VERSION"));
        assert!(info["gitSha"].is_string());
    }

    #[test]
    fn test_log_dir_is_app_scoped() {
        let dir = get_log_dir();
        assert!(dir.ends_with(Path::new("dispatch-panel").join("logs")));
    }

    #[test]
    fn test_prune_keeps_newest_and_ignores_foreign_files() {
        let dir = std::env::temp_dir().join(format!("dispatch-panel-logs-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        for day in 1..=5 {
            let path = dir.join(format!("{LOG_FILE_PREFIX}.2024-03-0{day}"));
            fs::write(&path, b"log").unwrap();
            // Spread modification times so ordering is deterministic.
            let mtime = std::time::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000 + day);
            fs::File::options()
                .write(true)
                .open(&path)
                .unwrap()
                .set_modified(mtime)
                .unwrap();
        }
        fs::write(dir.join("notes.txt"), b"keep me").unwrap();

        prune_logs_in(&dir, 2);

        let mut remaining: Vec<String> = fs::read_dir(&dir)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        remaining.sort();
        let _ = fs::remove_dir_all(&dir);

        assert_eq!(
            remaining,
            vec![
                "notes.txt".to_string(),
                format!("{LOG_FILE_PREFIX}.2024-03-04"),
                format!("{LOG_FILE_PREFIX}.2024-03-05"),
            ]
        );
    }
}
