//! Best-effort audible alert for newly arrived orders.
//!
//! Key design goals:
//! - **Fire-and-forget**: `ring` returns immediately; callers never learn
//!   whether anything was heard.
//! - **Never fatal**: a missing asset, a missing player binary or a player that
//!   exits non-zero is logged at debug level and otherwise ignored.
//! - **Fresh per ring**: the asset is handed to the player on every trigger,
//!   with no preloading; rings are not queued or coalesced.

use std::io::Write as _;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tracing::debug;

/// Capability to play the new-order cue.
pub trait Chime: Send + Sync {
    fn ring(&self);
}

// ---------------------------------------------------------------------------
// Terminal bell
// ---------------------------------------------------------------------------

/// ASCII BEL on stderr. Used when no player is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalBell;

impl Chime for TerminalBell {
    fn ring(&self) {
        let mut err = std::io::stderr();
        if let Err(e) = err.write_all(b"\x07").and_then(|_| err.flush()) {
            debug!(error = %e, "Terminal bell failed");
        }
    }
}

// ---------------------------------------------------------------------------
// External player
// ---------------------------------------------------------------------------

/// Plays the notification asset through an external command at full volume.
#[derive(Debug, Clone)]
pub struct SoundCommandChime {
    program: String,
    args: Vec<String>,
    asset: PathBuf,
}

impl SoundCommandChime {
    /// `command` is a whitespace-separated program + arguments; the asset path
    /// is appended as the final argument.
    pub fn new(command: &str, asset: PathBuf) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
            asset,
        })
    }

    fn spawn_player(&self) -> std::io::Result<tokio::process::Child> {
        tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(&self.asset)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
    }

    /// Start one playback. Returns whether a player process was launched.
    fn play(&self) -> bool {
        if !self.asset.is_file() {
            debug!(asset = %self.asset.display(), "Notification asset missing; skipping chime");
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No async runtime; skipping chime");
            return false;
        };

        match self.spawn_player() {
            Ok(mut child) => {
                let program = self.program.clone();
                runtime.spawn(async move {
                    match child.wait().await {
                        Ok(status) if !status.success() => {
                            debug!(%program, %status, "Notification player exited with failure");
                        }
                        Ok(_) => {}
                        Err(e) => debug!(%program, error = %e, "Notification player wait failed"),
                    }
                });
                true
            }
            Err(e) => {
                debug!(program = %self.program, error = %e, "Notification player failed to start");
                false
            }
        }
    }
}

impl Chime for SoundCommandChime {
    fn ring(&self) {
        self.play();
    }
}

/// Platform player command used when the config does not name one.
pub fn default_player_command() -> &'static str {
    #[cfg(target_os = "macos")]
    {
        "afplay -v 1"
    }
    #[cfg(not(target_os = "macos"))]
    {
        "ffplay -nodisp -autoexit -loglevel quiet -volume 100"
    }
}

/// Build the chime for a player command. An empty command means terminal bell.
pub fn build_chime(player: &str, asset: PathBuf) -> Arc<dyn Chime> {
    match SoundCommandChime::new(player, asset) {
        Some(chime) => Arc::new(chime),
        None => Arc::new(TerminalBell),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_split() {
        let chime = SoundCommandChime::new("ffplay -nodisp -autoexit", "a.mp3".into()).unwrap();
        assert_eq!(chime.program, "ffplay");
        assert_eq!(chime.args, vec!["-nodisp", "-autoexit"]);
    }

    #[test]
    fn test_empty_command_is_none() {
        assert!(SoundCommandChime::new("   ", "a.mp3".into()).is_none());
    }

    fn temp_asset(name: &str) -> PathBuf {
        let asset = std::env::temp_dir().join(format!(
            "dispatch-chime-{}-{name}.mp3",
            std::process::id()
        ));
        std::fs::write(&asset, b"not really audio").unwrap();
        asset
    }

    #[tokio::test]
    async fn test_missing_asset_skips_player() {
        let chime = SoundCommandChime::new("afplay", "/nonexistent/notification.mp3".into()).unwrap();
        assert!(!chime.play());
        chime.ring();
    }

    #[tokio::test]
    async fn test_missing_player_is_not_spawned() {
        let asset = temp_asset("no-player");
        let chime = SoundCommandChime::new("dispatch-panel-no-such-player", asset.clone()).unwrap();
        assert!(!chime.play());
        chime.ring();
        let _ = std::fs::remove_file(asset);
    }

    #[test]
    fn test_no_runtime_skips_player() {
        let asset = temp_asset("no-runtime");
        let chime = SoundCommandChime::new("true", asset.clone()).unwrap();
        assert!(!chime.play());
        let _ = std::fs::remove_file(asset);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_player_is_spawned_for_existing_asset() {
        let asset = temp_asset("spawned");
        let chime = SoundCommandChime::new("true", asset.clone()).unwrap();
        assert!(chime.play());
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let _ = std::fs::remove_file(asset);
    }
}
