mod args;
mod cache;
mod config;
mod error;
mod instagram;
mod media;
mod pipeline;
mod retry;
mod types;
mod utils;
mod youtube;

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use args::Args;
use cache::ProcessedSet;
use instagram::{InstagramClient, ReelsSource, ReelsUploader};
use media::Ffmpeg;
use pipeline::Pipeline;
use types::LogLevel;
use youtube::{OAuthSession, ShortsSearch, YouTubeUploader};

/// Console output plus a detailed `app.log` in the work directory.
fn init_logging(level: LogLevel, log_path: &Path) -> anyhow::Result<()> {
    let directives = format!("{},reqwest=warn,hyper=warn", level.as_filter());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("Opening log file {}", log_path.display()))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(
            fmt::layer()
                .with_writer(Mutex::new(log_file))
                .with_ansi(false)
                .with_thread_names(true),
        )
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    fs::create_dir_all(&args.work_dir)
        .with_context(|| format!("Creating work directory {}", args.work_dir.display()))?;
    init_logging(args.log_level, &args.work_dir.join("app.log"))?;

    let settings = config::load(&args)?;
    debug!("{:?}", settings);
    info!(
        "Starting reelshorts in {} ({:?})",
        settings.work_dir.display(),
        settings.direction
    );

    let shorts_query = if settings.direction.includes_shorts_to_reels() {
        Some(settings.shorts_query.clone().context(
            "A search query is required for Shorts -> Reels: pass QUERY or set SHORTS_QUERY",
        )?)
    } else {
        None
    };

    fs::create_dir_all(settings.download_dir())
        .with_context(|| format!("Creating {}", settings.download_dir().display()))?;

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(15))
        .build()
        .context("Building HTTP client")?;
    let tools = Ffmpeg::default();

    let instagram = Arc::new(
        InstagramClient::login(
            &settings.session_path(),
            settings.instagram_username.as_deref(),
            settings.instagram_password.as_deref(),
        )
        .await
        .context("Instagram login failed")?,
    );

    if settings.direction.includes_reels_to_shorts() {
        let auth = OAuthSession::load_or_authorize(
            http.clone(),
            &settings.token_path(),
            &settings.client_secrets_path(),
        )
        .await
        .context("YouTube authorization failed")?;

        let source = ReelsSource::new(
            instagram.clone(),
            settings.instagram_source_username.clone(),
            settings.reels_batch_size,
        );
        let destination = YouTubeUploader::new(http.clone(), auth);
        let processed = ProcessedSet::load(settings.processed_reels_path());
        debug!("{} holds {} reel id(s)", processed.path().display(), processed.len());
        let run_settings = settings.reels_to_shorts();

        info!("Reels -> Shorts: up to {} new reel(s)", run_settings.max_videos);
        let summary = Pipeline {
            source: &source,
            destination: &destination,
            tools: &tools,
            processed: &processed,
            settings: &run_settings,
        }
        .run()
        .await
        .context("Reels -> Shorts aborted")?;
        info!("Reels -> Shorts finished: {}", summary);
        debug!("New Shorts: {:?}", summary.remote_ids);
    }

    if let Some(query) = shorts_query {
        let source = ShortsSearch::new(http.clone(), query);
        let destination = ReelsUploader::new(instagram.clone());
        let processed = ProcessedSet::load(settings.processed_shorts_path());
        debug!("{} holds {} Short id(s)", processed.path().display(), processed.len());
        let run_settings = settings.shorts_to_reels();

        info!("Shorts -> Reels: up to {} new Short(s)", run_settings.max_videos);
        let summary = Pipeline {
            source: &source,
            destination: &destination,
            tools: &tools,
            processed: &processed,
            settings: &run_settings,
        }
        .run()
        .await
        .context("Shorts -> Reels aborted")?;
        if summary.listed == 0 {
            warn!("No new YouTube Shorts found for the query");
        }
        info!("Shorts -> Reels finished: {}", summary);
        debug!("New Reels: {:?}", summary.remote_ids);
    }

    info!("Process complete.");
    Ok(())
}
