//! YouTube Shorts: search scraping and yt-dlp downloads on the source side,
//! Data API uploads on the destination side.

pub mod download;
pub mod oauth;
pub mod search;
pub mod upload;

use std::path::Path;
use std::time::Duration;

use reqwest::Client;
use tracing::info;

use crate::cache::ProcessedSet;
use crate::error::{DownloadError, PipelineError};
use crate::media::VideoAsset;
use crate::pipeline::{Candidate, Source};

pub use oauth::OAuthSession;
pub use upload::YouTubeUploader;

/// Shorts matching a search query.
pub struct ShortsSearch {
    client: Client,
    query: String,
    download_timeout: Duration,
}

impl ShortsSearch {
    pub fn new(client: Client, query: impl Into<String>) -> Self {
        Self {
            client,
            query: query.into(),
            download_timeout: download::YTDLP_TIMEOUT,
        }
    }
}

impl Source for ShortsSearch {
    async fn list(
        &self,
        limit: usize,
        processed: &ProcessedSet,
    ) -> Result<Vec<Candidate>, PipelineError> {
        let page = search::fetch_search_page(&self.client, &self.query).await?;
        let ids = search::extract_short_ids(&page, limit, |id| processed.is_new(id));
        info!("Found {} new Short(s) for '{}'", ids.len(), self.query);
        Ok(ids
            .into_iter()
            .map(|id| Candidate {
                url: search::short_url(&id),
                id,
            })
            .collect())
    }

    async fn fetch(
        &self,
        candidate: &Candidate,
        dest_dir: &Path,
    ) -> Result<VideoAsset, DownloadError> {
        download::download_short(candidate, dest_dir, self.download_timeout).await
    }
}
