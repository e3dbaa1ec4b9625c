//! The per-direction pipeline: list -> dedup -> download (bounded pool) ->
//! validate -> normalize -> upload -> record.
//!
//! Downloads run concurrently but come back in listing order, and every later
//! stage is sequential, so uploads and cache writes follow the listing.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use tracing::{error, info, warn};

use crate::cache::ProcessedSet;
use crate::error::{
    DownloadError, ItemError, PipelineError, Stage, StageError, UploadError,
};
use crate::media::normalize::{self, TargetAspect};
use crate::media::{self, MediaTools, VideoAsset};
use crate::retry::{self, RetryAction, RetryConfig};
use crate::types::Privacy;
use crate::utils::shorts_title_and_description;

/// A listed source video not yet downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: String,
    /// Where to fetch it from: a page URL for yt-dlp or a direct media URL.
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct PostDetails {
    pub title: String,
    pub caption: String,
    pub privacy: Privacy,
}

pub trait Source {
    /// Up to `limit` candidates whose ids are not in `processed`, in listing order.
    async fn list(
        &self,
        limit: usize,
        processed: &ProcessedSet,
    ) -> Result<Vec<Candidate>, PipelineError>;

    async fn fetch(&self, candidate: &Candidate, dest_dir: &Path)
    -> Result<VideoAsset, DownloadError>;
}

pub trait Destination {
    /// Publish `asset`, returning the platform's id for the new post.
    async fn upload(&self, asset: &VideoAsset, post: &PostDetails) -> Result<String, UploadError>;
}

#[derive(Debug, Clone)]
pub enum CaptionStyle {
    /// "Subscribe <emoji>" title with the Shorts hashtags.
    Subscribe,
    Fixed(String),
}

impl CaptionStyle {
    fn post_details(&self, privacy: Privacy) -> PostDetails {
        match self {
            CaptionStyle::Subscribe => {
                let (title, caption) = shorts_title_and_description();
                PostDetails {
                    title,
                    caption,
                    privacy,
                }
            }
            CaptionStyle::Fixed(text) => PostDetails {
                title: text.clone(),
                caption: text.clone(),
                privacy,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_videos: usize,
    pub download_dir: PathBuf,
    pub download_workers: usize,
    pub min_duration_secs: f64,
    /// `Some` crops to the target before upload.
    pub normalize: Option<TargetAspect>,
    pub retry: RetryConfig,
    /// Pause after each successful upload.
    pub post_upload_delay: Duration,
    pub privacy: Privacy,
    pub caption: CaptionStyle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoOutcome {
    Uploaded { remote_id: String },
    /// Recorded by an earlier item of the same run.
    AlreadyProcessed,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub listed: usize,
    pub uploaded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub remote_ids: Vec<String>,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} listed, {} uploaded, {} skipped, {} failed",
            self.listed, self.uploaded, self.skipped, self.failed
        )
    }
}

pub struct Pipeline<'a, S, D, M> {
    pub source: &'a S,
    pub destination: &'a D,
    pub tools: &'a M,
    pub processed: &'a ProcessedSet,
    pub settings: &'a PipelineSettings,
}

impl<S: Source, D: Destination, M: MediaTools> Pipeline<'_, S, D, M> {
    /// Process up to `max_videos` new items. Per-item failures are logged and
    /// counted; only an authentication failure ends the run with `Err`.
    pub async fn run(&self) -> Result<RunSummary, PipelineError> {
        let mut summary = RunSummary::default();
        let max = self.settings.max_videos;

        let listed = match self.source.list(max, self.processed).await {
            Ok(listed) => listed,
            Err(PipelineError::Auth(e)) => return Err(PipelineError::Auth(e)),
            Err(e) => {
                error!("{}", e);
                return Ok(summary);
            }
        };

        let mut candidates: Vec<Candidate> = Vec::with_capacity(max.min(listed.len()));
        for c in listed {
            if candidates.len() >= max {
                break;
            }
            if self.processed.is_new(&c.id) && !candidates.iter().any(|seen| seen.id == c.id) {
                candidates.push(c);
            }
        }
        summary.listed = candidates.len();
        if candidates.is_empty() {
            warn!("No new videos this run; nothing to upload");
            return Ok(summary);
        }

        if let Err(e) = tokio::fs::create_dir_all(&self.settings.download_dir).await {
            error!(
                "Cannot create download directory {}: {}",
                self.settings.download_dir.display(),
                e
            );
        }

        let workers = self.settings.download_workers.max(1);
        info!("Downloading {} video(s) with {} worker(s)", candidates.len(), workers);
        let downloads: Vec<Result<VideoAsset, DownloadError>> = stream::iter(&candidates)
            .map(|c| self.source.fetch(c, &self.settings.download_dir))
            .buffered(workers)
            .collect()
            .await;

        let mut uploads_stopped = false;
        for (candidate, fetched) in candidates.iter().zip(downloads) {
            if uploads_stopped {
                info!("Skipping {}: uploads stopped for this run", candidate.id);
                summary.skipped += 1;
                continue;
            }

            match self.process(candidate, fetched).await {
                Ok(VideoOutcome::Uploaded { remote_id }) => {
                    summary.uploaded += 1;
                    summary.remote_ids.push(remote_id);
                }
                Ok(VideoOutcome::AlreadyProcessed) => summary.skipped += 1,
                Err(ItemError {
                    id,
                    source: StageError::Upload(UploadError::Auth(e)),
                    ..
                }) => {
                    error!("Authentication failed while uploading {}: {}", id, e);
                    return Err(PipelineError::Auth(e));
                }
                Err(e) => {
                    if matches!(e.source, StageError::Upload(UploadError::LimitExceeded(_))) {
                        error!("Upload limit exceeded; stopping remaining uploads");
                        uploads_stopped = true;
                    }
                    error!(id = %e.id, stage = %e.stage, "{}", e);
                    summary.failed += 1;
                }
            }
        }

        info!("Run complete: {}", summary);
        Ok(summary)
    }

    async fn process(
        &self,
        candidate: &Candidate,
        fetched: Result<VideoAsset, DownloadError>,
    ) -> Result<VideoOutcome, ItemError> {
        let id = candidate.id.as_str();
        if !self.processed.is_new(id) {
            return Ok(VideoOutcome::AlreadyProcessed);
        }

        let asset = self.validated(candidate, fetched).await?;

        let to_upload = match &self.settings.normalize {
            Some(target) => normalize::normalize(self.tools, &asset, target)
                .await
                .map_err(|e| ItemError::new(id, Stage::Normalize, e))?,
            None => asset.clone(),
        };

        let post = self.settings.caption.post_details(self.settings.privacy);
        info!("Uploading {} ({})", id, to_upload.path.display());
        let remote_id = retry::retry_with_backoff(
            &self.settings.retry,
            |e: &UploadError| {
                if e.is_retryable() {
                    RetryAction::Retry
                } else {
                    RetryAction::Abort
                }
            },
            || self.destination.upload(&to_upload, &post),
        )
        .await
        .map_err(|e| ItemError::new(id, Stage::Upload, e))?;
        info!("Uploaded {} as {}", id, remote_id);

        self.processed
            .mark_done(id)
            .map_err(|e| ItemError::new(id, Stage::Record, StageError::Record(e)))?;

        remove_local(&asset.path).await;
        if to_upload.path != asset.path {
            remove_local(&to_upload.path).await;
        }

        if !self.settings.post_upload_delay.is_zero() {
            tokio::time::sleep(self.settings.post_upload_delay).await;
        }
        Ok(VideoOutcome::Uploaded { remote_id })
    }

    /// Validate a download; an invalid file is deleted and fetched exactly once more.
    async fn validated(
        &self,
        candidate: &Candidate,
        fetched: Result<VideoAsset, DownloadError>,
    ) -> Result<VideoAsset, ItemError> {
        let id = candidate.id.as_str();
        let min = self.settings.min_duration_secs;
        let mut asset = fetched.map_err(|e| ItemError::new(id, Stage::Download, e))?;

        let info = match media::validate(self.tools, &asset.path, min).await {
            Ok(info) => info,
            Err(e) => {
                warn!("{} is invalid ({}); downloading again", asset.path.display(), e);
                remove_local(&asset.path).await;
                asset = self
                    .source
                    .fetch(candidate, &self.settings.download_dir)
                    .await
                    .map_err(|e| ItemError::new(id, Stage::Download, e))?;
                match media::validate(self.tools, &asset.path, min).await {
                    Ok(info) => info,
                    Err(e) => {
                        remove_local(&asset.path).await;
                        return Err(ItemError::new(id, Stage::Validate, e));
                    }
                }
            }
        };
        asset.info = Some(info);
        Ok(asset)
    }
}

async fn remove_local(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => info!("Deleted {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not delete {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthError;
    use crate::media::tests::{FakeTools, info};
    use crate::retry::Backoff;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Lists a fixed set of ids and writes a small file for each fetch.
    struct FakeSource {
        ids: Vec<String>,
        fetches: Mutex<HashMap<String, u32>>,
        unavailable: Vec<String>,
        delays: HashMap<String, Duration>,
        finished: Mutex<Vec<String>>,
    }

    impl FakeSource {
        fn new(ids: &[&str]) -> Self {
            Self {
                ids: ids.iter().map(|s| s.to_string()).collect(),
                fetches: Mutex::new(HashMap::new()),
                unavailable: Vec::new(),
                delays: HashMap::new(),
                finished: Mutex::new(Vec::new()),
            }
        }

        fn fetch_count(&self, id: &str) -> u32 {
            self.fetches.lock().get(id).copied().unwrap_or(0)
        }
    }

    impl Source for FakeSource {
        async fn list(
            &self,
            limit: usize,
            processed: &ProcessedSet,
        ) -> Result<Vec<Candidate>, PipelineError> {
            Ok(self
                .ids
                .iter()
                .filter(|id| processed.is_new(id))
                .take(limit)
                .map(|id| Candidate {
                    id: id.clone(),
                    url: format!("https://example.invalid/{id}"),
                })
                .collect())
        }

        async fn fetch(
            &self,
            candidate: &Candidate,
            dest_dir: &Path,
        ) -> Result<VideoAsset, DownloadError> {
            *self.fetches.lock().entry(candidate.id.clone()).or_default() += 1;
            if let Some(delay) = self.delays.get(&candidate.id) {
                tokio::time::sleep(*delay).await;
            }
            if self.unavailable.contains(&candidate.id) {
                return Err(DownloadError::HttpStatus {
                    status: 404,
                    id: candidate.id.clone(),
                });
            }
            let path = dest_dir.join(format!("{}.mp4", candidate.id));
            tokio::fs::write(&path, b"not really a video").await?;
            self.finished.lock().push(candidate.id.clone());
            Ok(VideoAsset::new(candidate.id.clone(), path))
        }
    }

    #[derive(Default)]
    struct FakeDestination {
        /// Errors returned, in order, before uploads start succeeding.
        failures: Mutex<Vec<UploadError>>,
        uploaded: Mutex<Vec<String>>,
        calls: Mutex<u32>,
        /// When set, the processed file as seen by each upload.
        cache_path: Option<PathBuf>,
        cache_seen: Mutex<Vec<Vec<String>>>,
    }

    impl FakeDestination {
        fn failing_with(errors: Vec<UploadError>) -> Self {
            Self {
                failures: Mutex::new(errors),
                ..Default::default()
            }
        }
    }

    impl Destination for FakeDestination {
        async fn upload(
            &self,
            asset: &VideoAsset,
            _post: &PostDetails,
        ) -> Result<String, UploadError> {
            *self.calls.lock() += 1;
            if let Some(path) = &self.cache_path {
                let seen: Vec<String> = std::fs::read_to_string(path)
                    .map(|data| serde_json::from_str(&data).unwrap())
                    .unwrap_or_default();
                self.cache_seen.lock().push(seen);
            }
            {
                let mut failures = self.failures.lock();
                if !failures.is_empty() {
                    return Err(failures.remove(0));
                }
            }
            self.uploaded.lock().push(asset.id.clone());
            Ok(format!("remote-{}", asset.id))
        }
    }

    fn settings(dir: &Path, max_videos: usize) -> PipelineSettings {
        PipelineSettings {
            max_videos,
            download_dir: dir.join("downloads"),
            download_workers: 4,
            min_duration_secs: 0.5,
            normalize: None,
            retry: RetryConfig {
                max_retries: 1,
                base_delay_secs: 0,
                max_delay_secs: 0,
                backoff: Backoff::Fixed,
            },
            post_upload_delay: Duration::ZERO,
            privacy: Privacy::Public,
            caption: CaptionStyle::Subscribe,
        }
    }

    #[tokio::test]
    async fn test_cap_processes_exactly_max_videos() {
        let dir = tempfile::tempdir().unwrap();
        let processed = ProcessedSet::load(dir.path().join("processed.json"));
        let source = FakeSource::new(&["a", "b", "c", "d", "e"]);
        let destination = FakeDestination::default();
        let settings = settings(dir.path(), 3);
        let pipeline = Pipeline {
            source: &source,
            destination: &destination,
            tools: &FakeTools::default(),
            processed: &processed,
            settings: &settings,
        };

        let summary = pipeline.run().await.unwrap();
        assert_eq!(summary.listed, 3);
        assert_eq!(summary.uploaded, 3);
        assert_eq!(processed.len(), 3);
        assert_eq!(*destination.uploaded.lock(), vec!["a", "b", "c"]);
        assert!(processed.is_new("d") && processed.is_new("e"));
        assert_eq!(source.fetch_count("d"), 0);
        assert!(!settings.download_dir.join("a.mp4").exists());
    }

    #[tokio::test]
    async fn test_already_processed_never_downloaded_or_uploaded() {
        let dir = tempfile::tempdir().unwrap();
        let processed = ProcessedSet::load(dir.path().join("processed.json"));
        processed.mark_done("a").unwrap();
        let source = FakeSource::new(&["a", "b"]);
        let destination = FakeDestination::default();
        let settings = settings(dir.path(), 5);
        let pipeline = Pipeline {
            source: &source,
            destination: &destination,
            tools: &FakeTools::default(),
            processed: &processed,
            settings: &settings,
        };

        let summary = pipeline.run().await.unwrap();
        assert_eq!(summary.uploaded, 1);
        assert_eq!(source.fetch_count("a"), 0);
        assert_eq!(*destination.uploaded.lock(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_transient_failure_then_success_records_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("processed.json");
        let processed = ProcessedSet::load(&cache_path);
        let source = FakeSource::new(&["a"]);
        let destination =
            FakeDestination::failing_with(vec![UploadError::Transient("HTTP 503".into())]);
        let settings = settings(dir.path(), 5);
        let pipeline = Pipeline {
            source: &source,
            destination: &destination,
            tools: &FakeTools::default(),
            processed: &processed,
            settings: &settings,
        };

        let summary = pipeline.run().await.unwrap();
        assert_eq!(summary.remote_ids, vec!["remote-a"]);
        assert_eq!(*destination.calls.lock(), 2);
        let on_disk: Vec<String> =
            serde_json::from_str(&std::fs::read_to_string(&cache_path).unwrap()).unwrap();
        assert_eq!(on_disk, vec!["a"]);
    }

    #[tokio::test]
    async fn test_restart_after_success_does_not_repost() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("processed.json");
        let source = FakeSource::new(&["a", "b"]);
        let destination = FakeDestination::default();
        let settings = settings(dir.path(), 5);

        {
            let processed = ProcessedSet::load(&cache_path);
            let pipeline = Pipeline {
                source: &source,
                destination: &destination,
                tools: &FakeTools::default(),
                processed: &processed,
                settings: &settings,
            };
            pipeline.run().await.unwrap();
        }

        // Fresh process: state comes only from disk.
        let processed = ProcessedSet::load(&cache_path);
        let pipeline = Pipeline {
            source: &source,
            destination: &destination,
            tools: &FakeTools::default(),
            processed: &processed,
            settings: &settings,
        };
        let summary = pipeline.run().await.unwrap();
        assert_eq!(summary.uploaded, 0);
        assert_eq!(*destination.uploaded.lock(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_per_item_failures_do_not_stop_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let processed = ProcessedSet::load(dir.path().join("processed.json"));
        let mut source = FakeSource::new(&["gone", "broken", "ok"]);
        source.unavailable.push("gone".into());
        let tools = FakeTools::default().with("broken.mp4", Err("moov atom not found".into()));
        let destination = FakeDestination::default();
        let settings = settings(dir.path(), 5);
        let pipeline = Pipeline {
            source: &source,
            destination: &destination,
            tools: &tools,
            processed: &processed,
            settings: &settings,
        };

        let summary = pipeline.run().await.unwrap();
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.uploaded, 1);
        // invalid download is fetched once more, then deleted
        assert_eq!(source.fetch_count("broken"), 2);
        assert!(!settings.download_dir.join("broken.mp4").exists());
        assert!(processed.is_new("broken"));
        assert!(!processed.is_new("ok"));
    }

    #[tokio::test]
    async fn test_auth_failure_aborts_run() {
        let dir = tempfile::tempdir().unwrap();
        let processed = ProcessedSet::load(dir.path().join("processed.json"));
        let source = FakeSource::new(&["a", "b"]);
        let destination = FakeDestination::failing_with(vec![UploadError::Auth(
            AuthError::Rejected("token expired".into()),
        )]);
        let settings = settings(dir.path(), 5);
        let pipeline = Pipeline {
            source: &source,
            destination: &destination,
            tools: &FakeTools::default(),
            processed: &processed,
            settings: &settings,
        };

        let err = pipeline.run().await.unwrap_err();
        assert!(matches!(err, PipelineError::Auth(_)));
        assert_eq!(*destination.calls.lock(), 1);
        assert_eq!(processed.len(), 0);
    }

    #[tokio::test]
    async fn test_limit_exceeded_skips_remaining() {
        let dir = tempfile::tempdir().unwrap();
        let processed = ProcessedSet::load(dir.path().join("processed.json"));
        let source = FakeSource::new(&["a", "b", "c"]);
        let destination = FakeDestination::failing_with(vec![UploadError::LimitExceeded(
            "uploadLimitExceeded".into(),
        )]);
        let settings = settings(dir.path(), 5);
        let pipeline = Pipeline {
            source: &source,
            destination: &destination,
            tools: &FakeTools::default(),
            processed: &processed,
            settings: &settings,
        };

        let summary = pipeline.run().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 2);
        assert_eq!(*destination.calls.lock(), 1);
        // leftovers stay on disk for the next run
        assert!(settings.download_dir.join("b.mp4").exists());
    }

    #[tokio::test]
    async fn test_normalized_copy_is_uploaded_and_both_files_removed() {
        let dir = tempfile::tempdir().unwrap();
        let processed = ProcessedSet::load(dir.path().join("processed.json"));
        let source = FakeSource::new(&["wide"]);
        let tools = FakeTools::default().with("wide.mp4", Ok(info(1920, 1080, 20.0)));
        let destination = FakeDestination::default();
        let mut settings = settings(dir.path(), 5);
        settings.normalize = Some(TargetAspect::default());
        let pipeline = Pipeline {
            source: &source,
            destination: &destination,
            tools: &tools,
            processed: &processed,
            settings: &settings,
        };

        let summary = pipeline.run().await.unwrap();
        assert_eq!(summary.uploaded, 1);
        assert!(!settings.download_dir.join("wide.mp4").exists());
        assert!(!settings.download_dir.join("adjusted_wide.mp4").exists());
    }

    #[tokio::test]
    async fn test_uploads_follow_listing_order_when_downloads_finish_out_of_order() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("processed.json");
        let processed = ProcessedSet::load(&cache_path);
        let mut source = FakeSource::new(&["a", "b", "c", "d"]);
        for (i, id) in ["a", "b", "c", "d"].iter().enumerate() {
            let millis = (3 - i as u64) * 40;
            source.delays.insert(id.to_string(), Duration::from_millis(millis));
        }
        let destination = FakeDestination {
            cache_path: Some(cache_path.clone()),
            ..Default::default()
        };
        let settings = settings(dir.path(), 5);
        let pipeline = Pipeline {
            source: &source,
            destination: &destination,
            tools: &FakeTools::default(),
            processed: &processed,
            settings: &settings,
        };

        let summary = pipeline.run().await.unwrap();
        assert_eq!(summary.uploaded, 4);
        assert_eq!(*source.finished.lock(), vec!["d", "c", "b", "a"]);
        assert_eq!(*destination.uploaded.lock(), vec!["a", "b", "c", "d"]);
        assert_eq!(
            summary.remote_ids,
            vec!["remote-a", "remote-b", "remote-c", "remote-d"]
        );
        // each upload sees every earlier item already recorded
        let seen = destination.cache_seen.lock();
        assert_eq!(seen[0], Vec::<String>::new());
        assert_eq!(seen[1], vec!["a"]);
        assert_eq!(seen[2], vec!["a", "b"]);
        assert_eq!(seen[3], vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_unconfirmed_upload_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let processed = ProcessedSet::load(dir.path().join("processed.json"));
        let source = FakeSource::new(&["a", "b"]);
        let destination = FakeDestination::failing_with(vec![UploadError::Unconfirmed(
            "configure returned no media".into(),
        )]);
        let settings = settings(dir.path(), 5);
        let pipeline = Pipeline {
            source: &source,
            destination: &destination,
            tools: &FakeTools::default(),
            processed: &processed,
            settings: &settings,
        };

        let summary = pipeline.run().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.uploaded, 1);
        assert_eq!(*destination.calls.lock(), 2);
        assert_eq!(*destination.uploaded.lock(), vec!["b"]);
        assert!(processed.is_new("a"));
    }
}
