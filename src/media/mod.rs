//! Local media handling: probing, validation and aspect normalization, all
//! backed by the ffmpeg/ffprobe binaries.

pub mod normalize;
pub mod probe;

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tracing::{error, info};

use crate::error::{TranscodeError, ValidationError};
use crate::utils::{run_with_timeout, stderr_tail};
use normalize::CropPlan;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);
pub const TRANSCODE_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MediaInfo {
    pub duration_secs: f64,
    pub width: u32,
    pub height: u32,
    pub has_audio: bool,
}

/// A downloaded (and possibly normalized) video on local disk.
#[derive(Debug, Clone)]
pub struct VideoAsset {
    pub id: String,
    pub path: PathBuf,
    pub info: Option<MediaInfo>,
}

impl VideoAsset {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            info: None,
        }
    }
}

/// The external media toolkit the pipeline depends on.
pub trait MediaTools {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, ValidationError>;

    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        plan: &CropPlan,
    ) -> Result<(), TranscodeError>;
}

/// ffprobe/ffmpeg from `$PATH`.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    pub probe_timeout: Duration,
    pub transcode_timeout: Duration,
}

impl Default for Ffmpeg {
    fn default() -> Self {
        Self {
            probe_timeout: PROBE_TIMEOUT,
            transcode_timeout: TRANSCODE_TIMEOUT,
        }
    }
}

impl MediaTools for Ffmpeg {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, ValidationError> {
        probe::run_ffprobe(path, self.probe_timeout).await
    }

    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        plan: &CropPlan,
    ) -> Result<(), TranscodeError> {
        let Some(filter) = plan.filter() else {
            return Ok(());
        };
        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-y")
            .arg("-i")
            .arg(input)
            .args(["-map", "0:v:0", "-map", "0:a?"])
            .args(["-vf", &filter])
            .args(["-c:v", "libx264", "-pix_fmt", "yuv420p", "-b:v", "5M"])
            // audio passes through untouched
            .args(["-c:a", "copy"])
            .args(["-movflags", "+faststart"])
            .args(["-f", "mp4"])
            .arg(output);

        let out = run_with_timeout(cmd, self.transcode_timeout)
            .await?
            .ok_or_else(|| TranscodeError::Timeout {
                path: input.to_path_buf(),
                secs: self.transcode_timeout.as_secs(),
            })?;
        if !out.status.success() {
            return Err(TranscodeError::Failed {
                path: input.to_path_buf(),
                message: stderr_tail(&out),
            });
        }
        Ok(())
    }
}

/// Check that `path` holds a playable video longer than `min_duration_secs`.
pub async fn validate<M: MediaTools>(
    tools: &M,
    path: &Path,
    min_duration_secs: f64,
) -> Result<MediaInfo, ValidationError> {
    let size = tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
    if size == 0 {
        return Err(ValidationError::Empty(path.to_path_buf()));
    }

    let info = tools.probe(path).await?;
    if !(info.duration_secs > 0.0 && info.duration_secs > min_duration_secs) {
        return Err(ValidationError::Duration {
            path: path.to_path_buf(),
            duration: info.duration_secs,
        });
    }
    info!(
        "{} is valid: {:.1}s, {}x{}{}",
        path.display(),
        info.duration_secs,
        info.width,
        info.height,
        if info.has_audio { "" } else { ", no audio" }
    );
    Ok(info)
}

/// Grab a single JPEG frame at `at_secs`, used as a cover image.
pub async fn extract_frame(input: &Path, at_secs: f64, output: &Path) -> Result<(), TranscodeError> {
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-y")
        .args(["-ss", &format!("{at_secs:.2}")])
        .arg("-i")
        .arg(input)
        .args(["-frames:v", "1", "-q:v", "2"])
        .arg(output);
    let out = run_with_timeout(cmd, PROBE_TIMEOUT)
        .await?
        .ok_or_else(|| TranscodeError::Timeout {
            path: input.to_path_buf(),
            secs: PROBE_TIMEOUT.as_secs(),
        })?;
    if !out.status.success() {
        error!("ffmpeg failed to extract a frame from {}", input.display());
        return Err(TranscodeError::Failed {
            path: input.to_path_buf(),
            message: stderr_tail(&out),
        });
    }
    Ok(())
}
