use std::io;
use std::process::Output;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::process::Command;
use tracing::error;

const CAPTION_EMOJIS: &[&str] = &["🚀", "🔥", "✨", "💥", "🎯", "⭐️", "💫", "⚡️", "😎", "🙌"];
const SHORTS_TAGS: &str = "#shorts #reels #viral #subscribe";

/// Run `cmd` to completion, capturing output. Returns `Ok(None)` when the process
/// outlives `timeout`; the child is killed in that case.
pub async fn run_with_timeout(mut cmd: Command, timeout: Duration) -> io::Result<Option<Output>> {
    cmd.kill_on_drop(true);
    let child = cmd
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()?;
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => output.map(Some),
        Err(_) => {
            error!("Process timed out after {}s", timeout.as_secs());
            Ok(None)
        }
    }
}

/// Last non-empty stderr line, which is where ffmpeg and yt-dlp put the reason.
pub fn stderr_tail(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("exit status {}", output.status))
}

/// Title and description used for reposted Shorts.
pub fn shorts_title_and_description() -> (String, String) {
    let emoji = CAPTION_EMOJIS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or("✨");
    (
        format!("Subscribe {emoji}"),
        format!("Subscribe for more {emoji}\n\n{SHORTS_TAGS}"),
    )
}
