//! Run settings: `.env` file, then process environment (which wins), then
//! command-line flags.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::warn;

use crate::args::Args;
use crate::instagram::reels::DEFAULT_BATCH_SIZE;
use crate::media::normalize::TargetAspect;
use crate::pipeline::{CaptionStyle, PipelineSettings};
use crate::retry::{Backoff, RetryConfig};
use crate::types::{Direction, Privacy};

/// New reels reposted per run when `--max-videos` is not given.
pub const DEFAULT_REELS_PER_RUN: usize = 20;
pub const DEFAULT_SHORTS_PER_RUN: usize = 5;
const MIN_DURATION_SECS: f64 = 0.5;
/// Pause after each published reel.
const REEL_POST_DELAY: Duration = Duration::from_secs(60);

pub struct Settings {
    pub work_dir: PathBuf,
    pub direction: Direction,
    pub instagram_username: Option<String>,
    pub instagram_password: Option<String>,
    pub instagram_source_username: Option<String>,
    pub shorts_query: Option<String>,
    pub reels_batch_size: usize,
    pub reels_caption: Option<String>,
    pub caption_override: Option<String>,
    pub max_videos: Option<usize>,
    pub download_workers: usize,
    pub privacy: Privacy,
    pub retry: RetryConfig,
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("work_dir", &self.work_dir)
            .field("direction", &self.direction)
            .field("instagram_username", &self.instagram_username)
            .field(
                "instagram_password",
                &self.instagram_password.as_ref().map(|_| "[REDACTED]"),
            )
            .field("instagram_source_username", &self.instagram_source_username)
            .field("shorts_query", &self.shorts_query)
            .field("reels_batch_size", &self.reels_batch_size)
            .field("max_videos", &self.max_videos)
            .field("download_workers", &self.download_workers)
            .field("privacy", &self.privacy)
            .field("retry", &self.retry)
            .finish()
    }
}

impl Settings {
    pub fn download_dir(&self) -> PathBuf {
        self.work_dir.join("downloads")
    }

    pub fn processed_reels_path(&self) -> PathBuf {
        self.work_dir.join("processed_reels.json")
    }

    pub fn processed_shorts_path(&self) -> PathBuf {
        self.work_dir.join("processed_shorts.json")
    }

    pub fn session_path(&self) -> PathBuf {
        self.work_dir.join("session.json")
    }

    pub fn token_path(&self) -> PathBuf {
        self.work_dir.join("token.json")
    }

    pub fn client_secrets_path(&self) -> PathBuf {
        self.work_dir.join("client_secrets.json")
    }

    /// Instagram Reels -> YouTube Shorts.
    pub fn reels_to_shorts(&self) -> PipelineSettings {
        PipelineSettings {
            max_videos: self.max_videos.unwrap_or(DEFAULT_REELS_PER_RUN),
            download_dir: self.download_dir(),
            download_workers: self.download_workers,
            min_duration_secs: MIN_DURATION_SECS,
            normalize: None,
            retry: self.retry.clone(),
            post_upload_delay: Duration::ZERO,
            privacy: self.privacy,
            caption: match &self.caption_override {
                Some(text) => CaptionStyle::Fixed(text.clone()),
                None => CaptionStyle::Subscribe,
            },
        }
    }

    /// YouTube Shorts -> Instagram Reels.
    pub fn shorts_to_reels(&self) -> PipelineSettings {
        PipelineSettings {
            max_videos: self.max_videos.unwrap_or(DEFAULT_SHORTS_PER_RUN),
            download_dir: self.download_dir(),
            download_workers: self.download_workers,
            min_duration_secs: MIN_DURATION_SECS,
            normalize: Some(TargetAspect::default()),
            retry: self.retry.clone(),
            post_upload_delay: REEL_POST_DELAY,
            privacy: Privacy::Public,
            caption: match self.caption_override.as_ref().or(self.reels_caption.as_ref()) {
                Some(text) => CaptionStyle::Fixed(text.clone()),
                None => CaptionStyle::Subscribe,
            },
        }
    }
}

pub fn default_workers() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    cpus.clamp(2, 8)
}

pub fn load(args: &Args) -> Result<Settings> {
    let env_path = args
        .env_file
        .clone()
        .unwrap_or_else(|| args.work_dir.join(".env"));
    let file_vars = read_env_file(&env_path)?;
    build_settings(args, &file_vars, env_var_string)
}

fn build_settings(
    args: &Args,
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<Settings> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let reels_batch_size = match lookup("REELS_BATCH_SIZE") {
        Some(raw) => raw
            .parse::<usize>()
            .ok()
            .filter(|n| *n > 0)
            .with_context(|| {
                format!("REELS_BATCH_SIZE must be a positive integer, got {raw:?}")
            })?,
        None => DEFAULT_BATCH_SIZE,
    };

    let mut retry = RetryConfig::default();
    if let Some(raw) = lookup("UPLOAD_RETRY_DELAY_SECS") {
        let secs = raw.parse::<u64>().with_context(|| {
            format!("UPLOAD_RETRY_DELAY_SECS must be a number of seconds, got {raw:?}")
        })?;
        retry.base_delay_secs = secs;
        retry.max_delay_secs = secs;
    }
    if let Some(raw) = lookup("UPLOAD_RETRIES") {
        retry.max_retries = raw
            .parse::<u32>()
            .with_context(|| format!("UPLOAD_RETRIES must be a whole number, got {raw:?}"))?;
    }
    if let Some(raw) = lookup("UPLOAD_RETRY_BACKOFF") {
        retry.backoff = match raw.to_ascii_lowercase().as_str() {
            "fixed" => Backoff::Fixed,
            "exponential" => {
                retry.max_delay_secs = retry.base_delay_secs.saturating_mul(8);
                Backoff::Exponential
            }
            _ => anyhow::bail!(
                "UPLOAD_RETRY_BACKOFF must be fixed or exponential, got {raw:?}"
            ),
        };
    }

    Ok(Settings {
        work_dir: args.work_dir.clone(),
        direction: args.direction,
        instagram_username: lookup("INSTAGRAM_USERNAME"),
        instagram_password: lookup("INSTAGRAM_PASSWORD"),
        instagram_source_username: lookup("INSTAGRAM_SOURCE_USERNAME")
            .map(|name| name.trim_start_matches('@').to_string()),
        shorts_query: args
            .query
            .clone()
            .filter(|q| !q.trim().is_empty())
            .or_else(|| lookup("SHORTS_QUERY")),
        reels_batch_size,
        reels_caption: lookup("REELS_CAPTION"),
        caption_override: args.caption.clone(),
        max_videos: args.max_videos,
        download_workers: args.workers.unwrap_or_else(default_workers).max(1),
        privacy: args.privacy,
        retry,
    })
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).filter(|v| !v.is_empty()).cloned())
}

/// Variables from a dotenv-style file. A missing file yields none.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("Reading settings file {}", path.display()));
        }
    };

    let mut vars = HashMap::new();
    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_env_line(line) {
            Some((key, value)) => {
                vars.insert(key.to_string(), value);
            }
            None => warn!("{}:{}: ignoring line without KEY=VALUE", path.display(), number + 1),
        }
    }
    Ok(vars)
}

/// `[export ]KEY=VALUE`. Quoted values are taken verbatim; unquoted ones end
/// at a ` #` comment.
fn parse_env_line(line: &str) -> Option<(&str, String)> {
    let line = line.strip_prefix("export ").unwrap_or(line);
    let (key, raw) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    let raw = raw.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = raw.strip_prefix(quote).and_then(|r| r.strip_suffix(quote)) {
            return Some((key, inner.to_string()));
        }
    }
    let value = raw.split_once(" #").map_or(raw, |(value, _)| value).trim_end();
    Some((key, value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_env(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn args(argv: &[&str]) -> Args {
        let mut full = vec!["reelshorts"];
        full.extend_from_slice(argv);
        Args::try_parse_from(full).unwrap()
    }

    #[test]
    fn test_read_env_file_handles_export_and_quotes() {
        let env = make_env(
            "# comment\nexport INSTAGRAM_USERNAME=\"me\"\nINSTAGRAM_PASSWORD='p=ss'\nnot a pair\n",
        );
        let vars = read_env_file(env.path()).unwrap();
        assert_eq!(vars.get("INSTAGRAM_USERNAME").unwrap(), "me");
        assert_eq!(vars.get("INSTAGRAM_PASSWORD").unwrap(), "p=ss");
        assert_eq!(vars.len(), 2);
    }

    #[test]
    fn test_env_line_comments_and_quotes() {
        assert_eq!(
            parse_env_line("SHORTS_QUERY=cats # weekend"),
            Some(("SHORTS_QUERY", "cats".to_string()))
        );
        assert_eq!(
            parse_env_line("REELS_CAPTION=\"new # reel\""),
            Some(("REELS_CAPTION", "new # reel".to_string()))
        );
        assert_eq!(parse_env_line("EMPTY="), Some(("EMPTY", String::new())));
        assert_eq!(parse_env_line("=value"), None);
        assert_eq!(parse_env_line("TWO WORDS=x"), None);
    }

    #[test]
    fn test_read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_env_file(&dir.path().join(".env")).unwrap().is_empty());
    }

    #[test]
    fn test_env_wins_over_file() {
        let vars = read_env_file(make_env("SHORTS_QUERY=from file\n").path()).unwrap();
        let settings = build_settings(&args(&[]), &vars, |key| {
            (key == "SHORTS_QUERY").then(|| "from env".to_string())
        })
        .unwrap();
        assert_eq!(settings.shorts_query.as_deref(), Some("from env"));
    }

    #[test]
    fn test_cli_query_wins_over_environment() {
        let settings = build_settings(&args(&["cli query"]), &HashMap::new(), |key| {
            (key == "SHORTS_QUERY").then(|| "from env".to_string())
        })
        .unwrap();
        assert_eq!(settings.shorts_query.as_deref(), Some("cli query"));
    }

    #[test]
    fn test_defaults() {
        let settings = build_settings(&args(&[]), &HashMap::new(), |_| None).unwrap();
        assert_eq!(settings.reels_batch_size, DEFAULT_BATCH_SIZE);
        assert!((2..=8).contains(&settings.download_workers));
        assert_eq!(settings.retry.max_retries, 1);
        assert_eq!(settings.download_dir(), PathBuf::from("./downloads"));

        let reels = settings.reels_to_shorts();
        assert_eq!(reels.max_videos, DEFAULT_REELS_PER_RUN);
        assert!(reels.normalize.is_none());
        assert!(matches!(reels.caption, CaptionStyle::Subscribe));

        let shorts = settings.shorts_to_reels();
        assert_eq!(shorts.max_videos, DEFAULT_SHORTS_PER_RUN);
        assert!(shorts.normalize.is_some());
        assert_eq!(shorts.post_upload_delay, REEL_POST_DELAY);
    }

    #[test]
    fn test_overrides_apply_to_both_directions() {
        let vars = read_env_file(
            make_env("UPLOAD_RETRY_DELAY_SECS=5\nREELS_CAPTION=\"Follow for more\"\n").path(),
        )
        .unwrap();
        let settings =
            build_settings(&args(&["-n", "3", "--workers", "4"]), &vars, |_| None).unwrap();
        assert_eq!(settings.reels_to_shorts().max_videos, 3);
        assert_eq!(settings.shorts_to_reels().max_videos, 3);
        assert_eq!(settings.shorts_to_reels().download_workers, 4);
        assert_eq!(settings.retry.delay_for_retry(0), Duration::from_secs(5));
        assert!(matches!(
            settings.shorts_to_reels().caption,
            CaptionStyle::Fixed(ref text) if text == "Follow for more"
        ));
    }

    #[test]
    fn test_exponential_backoff_from_environment() {
        let env = make_env(
            "UPLOAD_RETRIES=3\nUPLOAD_RETRY_DELAY_SECS=10\nUPLOAD_RETRY_BACKOFF=exponential\n",
        );
        let vars = read_env_file(env.path()).unwrap();
        let settings = build_settings(&args(&[]), &vars, |_| None).unwrap();
        assert_eq!(settings.retry.max_retries, 3);
        assert_eq!(settings.retry.backoff, Backoff::Exponential);
        assert_eq!(settings.retry.max_delay_secs, 80);
    }

    #[test]
    fn test_unknown_backoff_is_an_error() {
        let vars = read_env_file(make_env("UPLOAD_RETRY_BACKOFF=random\n").path()).unwrap();
        assert!(build_settings(&args(&[]), &vars, |_| None).is_err());
    }

    #[test]
    fn test_invalid_batch_size_is_an_error() {
        let vars = read_env_file(make_env("REELS_BATCH_SIZE=lots\n").path()).unwrap();
        assert!(build_settings(&args(&[]), &vars, |_| None).is_err());
    }

    #[test]
    fn test_source_username_strips_at_sign() {
        let settings = build_settings(&args(&[]), &HashMap::new(), |key| {
            (key == "INSTAGRAM_SOURCE_USERNAME").then(|| "@someone".to_string())
        })
        .unwrap();
        assert_eq!(settings.instagram_source_username.as_deref(), Some("someone"));
    }

    #[test]
    fn test_debug_redacts_password() {
        let settings = build_settings(&args(&[]), &HashMap::new(), |key| {
            (key == "INSTAGRAM_PASSWORD").then(|| "hunter2".to_string())
        })
        .unwrap();
        assert!(!format!("{:?}", settings).contains("hunter2"));
    }
}
