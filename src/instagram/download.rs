use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::USER_AGENT;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::DownloadError;
use crate::youtube::search::BROWSER_USER_AGENT;

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Stream `url` to `path` through a `.part` file, renamed into place once
/// the body is complete. A non-empty file already at `path` is kept as is.
pub async fn download_to(
    client: &Client,
    url: &str,
    path: &Path,
    id: &str,
) -> Result<(), DownloadError> {
    if fs::metadata(path).await.map(|m| m.len() > 0).unwrap_or(false) {
        info!("Video {} has already been downloaded; reusing it", id);
        return Ok(());
    }

    let part = part_path(path);
    let _ = fs::remove_file(&part).await;

    let response = client
        .get(url)
        .header(USER_AGENT, BROWSER_USER_AGENT)
        .send()
        .await
        .map_err(|e| DownloadError::Http {
            source: e,
            id: id.to_string(),
        })?;
    if !response.status().is_success() {
        return Err(DownloadError::HttpStatus {
            status: response.status().as_u16(),
            id: id.to_string(),
        });
    }

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&part)
        .await?;
    let mut written: u64 = 0;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("Download of {} broke off after {} bytes: {}", id, written, e);
                drop(file);
                let _ = fs::remove_file(&part).await;
                return Err(DownloadError::Http {
                    source: e,
                    id: id.to_string(),
                });
            }
        };
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    drop(file);

    fs::rename(&part, path).await?;
    debug!("Wrote {} bytes to {}", written, path.display());
    info!("Downloaded reel {}", id);
    Ok(())
}
