use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, LOCATION};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info};

use super::oauth::{OAuthSession, UPLOAD_SCOPE};
use crate::error::{AuthError, UploadError};
use crate::media::VideoAsset;
use crate::pipeline::{Destination, PostDetails};

const UPLOAD_URL: &str = "https://www.googleapis.com/upload/youtube/v3/videos";
/// "People & Blogs".
pub const DEFAULT_CATEGORY_ID: &str = "22";
const MAX_TITLE_CHARS: usize = 100;

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ApiErrorItem>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorItem {
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct VideoResource {
    id: String,
}

/// Map a failed Data API response to an upload error.
pub fn classify_api_error(status: u16, body: &str) -> UploadError {
    let (reason, message) = match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(parsed) => (
            parsed
                .error
                .errors
                .first()
                .map(|e| e.reason.clone())
                .unwrap_or_default(),
            parsed.error.message,
        ),
        Err(_) => (String::new(), body.chars().take(200).collect()),
    };
    let detail = if reason.is_empty() {
        format!("HTTP {status}: {message}")
    } else {
        format!("HTTP {status} {reason}: {message}")
    };

    match (status, reason.as_str()) {
        (_, "uploadLimitExceeded" | "quotaExceeded" | "dailyLimitExceeded") => {
            UploadError::LimitExceeded(detail)
        }
        (_, "insufficientPermissions") => {
            UploadError::Auth(AuthError::MissingScope(UPLOAD_SCOPE.to_string()))
        }
        (_, "youtubeSignupRequired") => UploadError::Auth(AuthError::Rejected(
            "the authorized account has no YouTube channel".to_string(),
        )),
        (401, _) | (_, "authError" | "unauthorized") => {
            UploadError::Auth(AuthError::Rejected(detail))
        }
        (429, _) | (500..=599, _) | (_, "rateLimitExceeded" | "backendError") => {
            UploadError::Transient(detail)
        }
        _ => UploadError::Rejected(detail),
    }
}

fn truncate_title(title: &str) -> String {
    title.chars().take(MAX_TITLE_CHARS).collect()
}

/// Publishes Shorts through the Data API's resumable upload protocol.
pub struct YouTubeUploader {
    client: Client,
    auth: OAuthSession,
    category_id: String,
}

impl YouTubeUploader {
    pub fn new(client: Client, auth: OAuthSession) -> Self {
        Self {
            client,
            auth,
            category_id: DEFAULT_CATEGORY_ID.to_string(),
        }
    }
}

impl Destination for YouTubeUploader {
    async fn upload(&self, asset: &VideoAsset, post: &PostDetails) -> Result<String, UploadError> {
        let access_token = self.auth.access_token().await?;
        let bytes = tokio::fs::read(&asset.path).await?;

        let metadata = json!({
            "snippet": {
                "title": truncate_title(&post.title),
                "description": post.caption,
                "categoryId": self.category_id,
            },
            "status": {
                "privacyStatus": post.privacy.as_str(),
                "selfDeclaredMadeForKids": false,
            }
        });

        let initiate = self
            .client
            .post(UPLOAD_URL)
            .query(&[("uploadType", "resumable"), ("part", "snippet,status")])
            .header(AUTHORIZATION, format!("Bearer {access_token}"))
            .header("X-Upload-Content-Type", "video/mp4")
            .header("X-Upload-Content-Length", bytes.len().to_string())
            .json(&metadata)
            .send()
            .await?;
        let status = initiate.status();
        if !status.is_success() {
            let body = initiate.text().await.unwrap_or_default();
            return Err(classify_api_error(status.as_u16(), &body));
        }
        let session_uri = initiate
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                UploadError::Transient("no Location header in upload initiation".into())
            })?;
        debug!("Resumable upload session opened for {}", asset.id);

        let response = self
            .client
            .put(&session_uri)
            .header(AUTHORIZATION, format!("Bearer {access_token}"))
            .header(CONTENT_TYPE, "video/mp4")
            .body(bytes)
            .send()
            .await?;
        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) if is_created(status) => {
                error!("Upload of {} finished but its response was lost: {}", asset.id, e);
                return Err(UploadError::Unconfirmed(format!(
                    "HTTP {status} response body unreadable: {e}"
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let id = uploaded_video_id(status, &body)?;
        info!("Short uploaded: https://youtube.com/shorts/{}", id);
        Ok(id)
    }
}

fn is_created(status: StatusCode) -> bool {
    status == StatusCode::OK || status == StatusCode::CREATED
}

/// Id of the video created by the final resumable PUT.
fn uploaded_video_id(status: StatusCode, body: &str) -> Result<String, UploadError> {
    if !is_created(status) {
        return Err(classify_api_error(status.as_u16(), body));
    }
    match serde_json::from_str::<VideoResource>(body) {
        Ok(video) if !video.id.is_empty() => Ok(video.id),
        Ok(_) => {
            error!("YouTube accepted the upload but returned an empty video id");
            Err(UploadError::Unconfirmed("empty video id".into()))
        }
        Err(e) => {
            error!("YouTube accepted the upload but the response had no video id: {}", e);
            Err(UploadError::Unconfirmed(format!("unexpected upload response: {e}")))
        }
    }
}
