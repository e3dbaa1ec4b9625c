use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use super::{ApiFailure, InstagramClient, WEB_ORIGIN};
use crate::error::UploadError;
use crate::media::{self, MediaInfo, VideoAsset};
use crate::pipeline::{Destination, PostDetails};
use crate::retry::{self, Backoff, RetryAction, RetryConfig};
use crate::types::Privacy;

/// Polling policy while Instagram transcodes an uploaded clip.
pub fn configure_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 6,
        base_delay_secs: 5,
        max_delay_secs: 5,
        backoff: Backoff::Fixed,
    }
}

fn rupload_video_params(upload_id: &str, info: &MediaInfo) -> String {
    json!({
        "is_clips_video": "1",
        "media_type": "2",
        "upload_id": upload_id,
        "video_format": "video/mp4",
        "upload_media_width": info.width,
        "upload_media_height": info.height,
        "upload_media_duration_ms": (info.duration_secs * 1000.0).round() as u64,
    })
    .to_string()
}

fn rupload_photo_params(upload_id: &str) -> String {
    json!({
        "media_type": "2",
        "upload_id": upload_id,
        "image_compression": r#"{"lib_name":"moz","lib_version":"3.1.m","quality":"80"}"#,
    })
    .to_string()
}

/// Shortcode of the published reel, or its pk when no code is returned.
fn published_id(response: &Value) -> Option<String> {
    let media = response.get("media")?;
    media
        .get("code")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| media.get("pk").map(|pk| pk.to_string().trim_matches('"').to_string()))
}

/// A successful configure without a media object may still have posted the
/// reel, so it fails the item without another attempt.
fn published_reel(response: &Value) -> Result<String, UploadError> {
    published_id(response).ok_or_else(|| {
        error!("Instagram accepted configure_to_clips but returned no media: {}", response);
        UploadError::Unconfirmed("configure returned no media".into())
    })
}

/// Publishes videos as Reels.
pub struct ReelsUploader {
    client: Arc<InstagramClient>,
    configure_retry: RetryConfig,
}

impl ReelsUploader {
    pub fn new(client: Arc<InstagramClient>) -> Self {
        Self {
            client,
            configure_retry: configure_retry(),
        }
    }

    async fn rupload(
        &self,
        kind: &str,
        name: &str,
        params: String,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<(), ApiFailure> {
        let url = format!("{WEB_ORIGIN}/{kind}/{name}");
        let headers = [
            ("X-Instagram-Rupload-Params", params),
            ("X-Entity-Name", name.to_string()),
            ("X-Entity-Length", body.len().to_string()),
            ("X-Entity-Type", content_type.to_string()),
            ("Offset", "0".to_string()),
            ("Content-Type", "application/octet-stream".to_string()),
        ];
        self.client.post_bytes(&url, &headers, body).await?;
        Ok(())
    }

    async fn upload_cover(
        &self,
        video: &Path,
        info: &MediaInfo,
        upload_id: &str,
        name: &str,
    ) -> Result<(), UploadError> {
        let cover = video.with_extension("jpg");
        let result = async {
            media::extract_frame(video, info.duration_secs / 2.0, &cover)
                .await
                .map_err(|e| UploadError::Rejected(format!("cover frame: {e}")))?;
            let bytes = tokio::fs::read(&cover).await?;
            self.rupload(
                "rupload_igphoto",
                name,
                rupload_photo_params(upload_id),
                "image/jpeg",
                bytes,
            )
            .await
            .map_err(UploadError::from)
        }
        .await;
        if let Err(e) = tokio::fs::remove_file(&cover).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Could not delete {}: {}", cover.display(), e);
            }
        }
        result
    }
}

impl Destination for ReelsUploader {
    async fn upload(&self, asset: &VideoAsset, post: &PostDetails) -> Result<String, UploadError> {
        if post.privacy != Privacy::Public {
            debug!("Reels are always public; ignoring privacy {}", post.privacy.as_str());
        }
        let info = asset.info.unwrap_or(MediaInfo {
            duration_secs: 0.0,
            width: 1080,
            height: 1920,
            has_audio: true,
        });
        let upload_id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis().to_string())
            .unwrap_or_else(|_| "0".to_string());
        let name = format!("fb_uploader_{upload_id}");

        let bytes = tokio::fs::read(&asset.path).await?;
        info!("Uploading {} ({} bytes) to Instagram", asset.id, bytes.len());
        self.rupload(
            "rupload_igvideo",
            &name,
            rupload_video_params(&upload_id, &info),
            "video/mp4",
            bytes,
        )
        .await?;
        self.upload_cover(&asset.path, &info, &upload_id, &name).await?;

        let form = [
            ("upload_id", upload_id.as_str()),
            ("caption", post.caption.as_str()),
            ("source_type", "library"),
            ("clips_share_preview_to_feed", "1"),
            ("disable_comments", "0"),
            ("like_and_view_counts_disabled", "0"),
        ];
        let response = retry::retry_with_backoff(
            &self.configure_retry,
            |e: &ApiFailure| match e {
                ApiFailure::NotReady => RetryAction::Retry,
                _ => RetryAction::Abort,
            },
            || self.client.post_form("media/configure_to_clips/", &form),
        )
        .await?;

        let id = published_reel(&response)?;
        info!("Reel published: {}/reel/{}/", WEB_ORIGIN, id);
        Ok(id)
    }
}
