use std::path::Path;
use std::time::Duration;

use tokio::process::Command;
use tracing::{info, warn};

use super::search::BROWSER_USER_AGENT;
use crate::error::DownloadError;
use crate::media::VideoAsset;
use crate::pipeline::Candidate;
use crate::utils::{run_with_timeout, stderr_tail};

/// Tried in order: a single stream that already carries audio and video, then
/// a separate-stream merge for Shorts that only ship split formats.
const FORMATS: &[&str] = &[
    "best[ext=mp4][vcodec!=none][acodec!=none]/best[vcodec!=none][acodec!=none]",
    "bestvideo[ext=mp4]+bestaudio/bv*+ba/best",
];

pub const YTDLP_TIMEOUT: Duration = Duration::from_secs(900);

/// yt-dlp messages for videos no format can rescue.
fn is_gone(stderr: &str) -> bool {
    const GONE: &[&str] = &[
        "Video unavailable",
        "Private video",
        "This video has been removed",
        "Sign in to confirm your age",
    ];
    GONE.iter().any(|needle| stderr.contains(needle))
}

/// Download a Short with yt-dlp into `<dest_dir>/<id>.mp4`.
pub async fn download_short(
    candidate: &Candidate,
    dest_dir: &Path,
    timeout: Duration,
) -> Result<VideoAsset, DownloadError> {
    let output = dest_dir.join(format!("{}.mp4", candidate.id));
    if tokio::fs::metadata(&output).await.map(|m| m.len() > 0).unwrap_or(false) {
        info!("Video {} has already been downloaded; reusing it", candidate.id);
        return Ok(VideoAsset::new(candidate.id.clone(), output));
    }

    let mut last_error = String::from("no format attempted");
    for format in FORMATS {
        let mut cmd = Command::new("yt-dlp");
        cmd.args(["--no-playlist", "--quiet", "--no-warnings"])
            .args(["--retries", "3", "--concurrent-fragments", "4"])
            .args(["--user-agent", BROWSER_USER_AGENT])
            .args(["--merge-output-format", "mp4"])
            .args(["-f", format])
            .arg("-o")
            .arg(&output)
            .arg(&candidate.url);

        let result = run_with_timeout(cmd, timeout).await.map_err(|e| DownloadError::Tool {
            tool: "yt-dlp",
            id: candidate.id.clone(),
            message: format!("failed to spawn yt-dlp (is it installed and on $PATH?): {e}"),
        })?;

        match result {
            Some(out) if out.status.success() && output.exists() => {
                info!("Downloaded {} to {} (format: {})", candidate.id, output.display(), format);
                return Ok(VideoAsset::new(candidate.id.clone(), output));
            }
            Some(out) => {
                last_error = stderr_tail(&out);
                if is_gone(&last_error) {
                    return Err(DownloadError::Unavailable(format!(
                        "{}: {}",
                        candidate.id, last_error
                    )));
                }
            }
            None => last_error = format!("timed out after {}s", timeout.as_secs()),
        }
        warn!("Failed to download {} with format '{}': {}", candidate.id, format, last_error);
        let _ = tokio::fs::remove_file(&output).await;
    }

    Err(DownloadError::Tool {
        tool: "yt-dlp",
        id: candidate.id.clone(),
        message: last_error,
    })
}
