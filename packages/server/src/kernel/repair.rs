//! Corrupt-audio repair via the external decoder.
//!
//! A re-encode to 16 kHz mono MP3 fixes the common corruption the engine
//! reports as an empty tensor. The repaired artifact replaces the job's
//! file path on the next attempt.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

#[async_trait]
pub trait AudioRepairer: Send + Sync {
    /// Produce a repaired copy of `source`, returning its path.
    async fn repair(&self, source: &Path) -> Result<PathBuf>;
}

pub struct FfmpegRepairer {
    work_folder: PathBuf,
    timeout: Duration,
}

impl FfmpegRepairer {
    pub fn new(work_folder: PathBuf) -> Self {
        Self {
            work_folder,
            timeout: Duration::from_secs(60),
        }
    }
}

#[async_trait]
impl AudioRepairer for FfmpegRepairer {
    async fn repair(&self, source: &Path) -> Result<PathBuf> {
        let stem = source
            .file_stem()
            .and_then(|s| s.to_str())
            .context("source path has no file stem")?;
        let repaired = self.work_folder.join(format!("{}_repaired.mp3", stem));

        if tokio::fs::try_exists(&repaired).await.unwrap_or(false) {
            info!(path = %repaired.display(), "repaired file already exists");
            return Ok(repaired);
        }

        tokio::fs::create_dir_all(&self.work_folder)
            .await
            .context("create work folder")?;

        info!(source = %source.display(), "repairing audio file");

        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-y")
            .arg("-i")
            .arg(source)
            .args(["-acodec", "libmp3lame", "-ar", "16000", "-ac", "1", "-ab", "64k"])
            .arg(&repaired)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let status = tokio::time::timeout(self.timeout, cmd.status())
            .await
            .context("audio repair timed out")?
            .context("failed to run ffmpeg")?;

        if !status.success() {
            bail!("ffmpeg exited with {}", status);
        }

        let size = tokio::fs::metadata(&repaired)
            .await
            .context("repaired file missing")?
            .len();
        if size == 0 {
            bail!("repair produced an empty file");
        }

        info!(path = %repaired.display(), "audio repaired");
        Ok(repaired)
    }
}
