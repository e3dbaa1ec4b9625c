use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use super::{ApiFailure, InstagramClient, download};
use crate::cache::ProcessedSet;
use crate::error::{DownloadError, PipelineError};
use crate::media::VideoAsset;
use crate::pipeline::{Candidate, Source};

pub const DEFAULT_BATCH_SIZE: usize = 50;

/// One page of `clips/user/`.
#[derive(Debug, Default, PartialEq)]
pub struct ClipsPage {
    /// `(media pk, best video url)` in feed order.
    pub reels: Vec<(String, Option<String>)>,
    pub next_max_id: Option<String>,
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn best_video_url(media: &Value) -> Option<String> {
    media
        .get("video_versions")?
        .as_array()?
        .first()?
        .get("url")?
        .as_str()
        .map(str::to_string)
}

pub fn parse_clips_page(page: &Value) -> ClipsPage {
    let reels = page
        .get("items")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let media = item.get("media").unwrap_or(item);
                    let pk = media.get("pk").and_then(id_string)?;
                    Some((pk, best_video_url(media)))
                })
                .collect()
        })
        .unwrap_or_default();

    let paging = page.get("paging_info");
    let more = paging
        .and_then(|p| p.get("more_available"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let next_max_id = paging
        .and_then(|p| p.get("max_id"))
        .and_then(id_string)
        .filter(|_| more);

    ClipsPage { reels, next_max_id }
}

/// Reels published by one account, newest first.
pub struct ReelsSource {
    client: Arc<InstagramClient>,
    source_username: Option<String>,
    batch_size: usize,
}

impl ReelsSource {
    pub fn new(
        client: Arc<InstagramClient>,
        source_username: Option<String>,
        batch_size: usize,
    ) -> Self {
        Self {
            client,
            source_username,
            batch_size: batch_size.max(1),
        }
    }

    /// Numeric id of the account to read from: the configured source account,
    /// else the logged-in account.
    async fn resolve_user(&self) -> Result<String, PipelineError> {
        let username = self
            .source_username
            .clone()
            .or_else(|| self.client.username());
        if let Some(name) = &username {
            match self
                .client
                .get_json("users/web_profile_info/", &[("username", name.as_str())])
                .await
            {
                Ok(profile) => {
                    if let Some(id) = profile.pointer("/data/user/id").and_then(id_string) {
                        info!("Fetching reels for @{}", name);
                        return Ok(id);
                    }
                    warn!("Profile lookup for @{} returned no user id", name);
                }
                Err(e @ ApiFailure::LoginRequired(_)) => return Err(e.into()),
                Err(e) => warn!(
                    "Failed to resolve user id for @{}: {}. Falling back to the logged-in account.",
                    name, e
                ),
            }
        }
        self.client.user_id().ok_or_else(|| {
            PipelineError::Listing("cannot tell which account to read reels from".to_string())
        })
    }

    async fn media_video_url(&self, pk: &str) -> Result<Option<String>, ApiFailure> {
        let info = self.client.get_json(&format!("media/{pk}/info/"), &[]).await?;
        Ok(info
            .get("items")
            .and_then(Value::as_array)
            .and_then(|items| items.first())
            .and_then(best_video_url))
    }
}

impl Source for ReelsSource {
    async fn list(
        &self,
        limit: usize,
        processed: &ProcessedSet,
    ) -> Result<Vec<Candidate>, PipelineError> {
        let user_id = self.resolve_user().await?;
        let page_size = self.batch_size.to_string();
        let mut candidates: Vec<Candidate> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut max_id: Option<String> = None;
        let mut batch = 0;

        while candidates.len() < limit {
            let mut form = vec![
                ("target_user_id", user_id.as_str()),
                ("page_size", page_size.as_str()),
                ("include_feed_video", "true"),
            ];
            if let Some(cursor) = &max_id {
                form.push(("max_id", cursor.as_str()));
            }
            let page = match self.client.post_form("clips/user/", &form).await {
                Ok(page) => parse_clips_page(&page),
                Err(e @ ApiFailure::LoginRequired(_)) => return Err(e.into()),
                Err(e) if batch == 0 => return Err(e.into()),
                Err(e) => {
                    warn!("Error fetching reels (batch {}): {}", batch + 1, e);
                    break;
                }
            };
            batch += 1;
            info!("Fetched {} reels (batch {})", page.reels.len(), batch);

            let mut added = 0;
            for (pk, url) in page.reels {
                if !seen.insert(pk.clone()) {
                    continue;
                }
                added += 1;
                if !processed.is_new(&pk) || candidates.len() >= limit {
                    continue;
                }
                let url = match url {
                    Some(url) => url,
                    None => match self.media_video_url(&pk).await {
                        Ok(Some(url)) => url,
                        Ok(None) => {
                            warn!("No video URL found for media {}", pk);
                            continue;
                        }
                        Err(e) => {
                            warn!("Failed to fetch video URL for media {}: {}", pk, e);
                            continue;
                        }
                    },
                };
                candidates.push(Candidate { id: pk, url });
            }

            if added == 0 {
                info!("No new reels in batch {}; stopping", batch);
                break;
            }
            match page.next_max_id {
                Some(next) => max_id = Some(next),
                None => {
                    info!("No more reels returned by Instagram; stopping");
                    break;
                }
            }
        }

        if candidates.is_empty() && batch > 0 {
            warn!("No new reels found");
        }
        Ok(candidates)
    }

    async fn fetch(
        &self,
        candidate: &Candidate,
        dest_dir: &Path,
    ) -> Result<VideoAsset, DownloadError> {
        let path = dest_dir.join(format!("{}.mp4", candidate.id));
        download::download_to(self.client.http(), &candidate.url, &path, &candidate.id).await?;
        Ok(VideoAsset::new(candidate.id.clone(), path))
    }
}
