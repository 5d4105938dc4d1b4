//! Alert sound playback.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};

use crate::PipelineError;

/// Plays and stops the alert sound. Both calls must return promptly.
pub trait AlertSound: Send + Sync {
    fn play(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
}

/// Does nothing. Used when no asset is configured or the asset is missing.
#[derive(Clone, Copy, Debug, Default)]
pub struct SilentSound;

impl AlertSound for SilentSound {
    fn play(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        Ok(())
    }
}

/// Plays an audio file by spawning an external player, e.g. `mpg123 -q`.
///
/// The asset path is appended as the last argument. `stop` kills the player.
pub struct CommandSound {
    asset: PathBuf,
    player: Vec<String>,
    child: Mutex<Option<Child>>,
}

impl CommandSound {
    pub const DEFAULT_PLAYER: &'static [&'static str] = &["mpg123", "-q"];

    /// Fails with `AssetMissing` when the file does not exist.
    pub fn open(asset: impl AsRef<Path>, player: Vec<String>) -> Result<Self> {
        let asset = asset.as_ref().to_path_buf();
        if !asset.is_file() {
            return Err(PipelineError::AssetMissing(asset.display().to_string()).into());
        }
        if player.is_empty() {
            return Err(anyhow!("alert player command is empty"));
        }
        Ok(Self {
            asset,
            player,
            child: Mutex::new(None),
        })
    }

    pub fn asset(&self) -> &Path {
        &self.asset
    }

    /// True while a spawned player process is still running.
    pub fn is_playing(&self) -> bool {
        let mut guard = self.child.lock().unwrap_or_else(|p| p.into_inner());
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

impl AlertSound for CommandSound {
    fn play(&self) -> Result<()> {
        let mut guard = self.child.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(child) = guard.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                return Ok(());
            }
        }
        let mut cmd = Command::new(&self.player[0]);
        cmd.args(&self.player[1..])
            .arg(&self.asset)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let child = cmd
            .spawn()
            .with_context(|| format!("spawn alert player '{}'", self.player[0]))?;
        *guard = Some(child);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let mut guard = self.child.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(mut child) = guard.take() {
            if matches!(child.try_wait(), Ok(None)) {
                let _ = child.kill();
            }
            let _ = child.wait();
        }
        Ok(())
    }
}

impl Drop for CommandSound {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
