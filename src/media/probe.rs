use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;

use super::MediaInfo;
use crate::error::ValidationError;
use crate::utils::{run_with_timeout, stderr_tail};

/// Subset of `ffprobe -print_format json -show_format -show_streams`.
#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    duration: Option<String>,
    #[serde(default)]
    side_data_list: Vec<SideData>,
}

#[derive(Debug, Deserialize)]
struct SideData {
    rotation: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

pub async fn run_ffprobe(path: &Path, timeout: Duration) -> Result<MediaInfo, ValidationError> {
    let unreadable = |message: String| ValidationError::Unreadable {
        path: path.to_path_buf(),
        message,
    };

    let mut cmd = Command::new("ffprobe");
    cmd.args(["-v", "error", "-print_format", "json", "-show_format", "-show_streams"])
        .arg(path);
    let output = run_with_timeout(cmd, timeout)
        .await
        .map_err(|e| unreadable(format!("failed to spawn ffprobe: {e}")))?
        .ok_or_else(|| unreadable(format!("ffprobe timed out after {}s", timeout.as_secs())))?;

    if !output.status.success() {
        return Err(unreadable(stderr_tail(&output)));
    }
    parse_probe_output(&String::from_utf8_lossy(&output.stdout), path)
}

/// Turn ffprobe JSON into `MediaInfo`. Rotated phone footage reports its coded
/// size, so width and height are swapped for 90/270 degree rotations.
pub fn parse_probe_output(json: &str, path: &Path) -> Result<MediaInfo, ValidationError> {
    let parsed: ProbeOutput =
        serde_json::from_str(json).map_err(|e| ValidationError::Unreadable {
            path: path.to_path_buf(),
            message: format!("unexpected ffprobe output: {e}"),
        })?;

    let video = parsed
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| ValidationError::NoVideoStream(path.to_path_buf()))?;
    let has_audio = parsed
        .streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("audio"));

    let duration_secs = parsed
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .or(video.duration.as_deref())
        .and_then(|d| d.trim().parse::<f64>().ok())
        .unwrap_or(0.0);

    let (mut width, mut height) = (video.width.unwrap_or(0), video.height.unwrap_or(0));
    let rotated = video
        .side_data_list
        .iter()
        .filter_map(|s| s.rotation)
        .any(|r| r.rem_euclid(180) == 90);
    if rotated {
        std::mem::swap(&mut width, &mut height);
    }

    Ok(MediaInfo {
        duration_secs,
        width,
        height,
        has_audio,
    })
}
