use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Credentials missing, rejected or unusable. Fatal for the run.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    #[error("Login rejected: {0}")]
    Rejected(String),

    #[error("Credential file {path} is unusable: {reason}")]
    CorruptCredentials { path: PathBuf, reason: String },

    #[error("Token does not carry the {0} scope; delete it and authorize again")]
    MissingScope(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Remote video unavailable, removed, or the transport failed.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("HTTP error {status} downloading {id}")]
    HttpStatus { status: u16, id: String },

    #[error("HTTP error downloading {id}: {source}")]
    Http { source: reqwest::Error, id: String },

    #[error("{tool} failed for {id}: {message}")]
    Tool {
        tool: &'static str,
        id: String,
        message: String,
    },

    #[error("No downloadable video for {0}")]
    Unavailable(String),

    #[error("Disk error: {0}")]
    Disk(#[from] std::io::Error),
}

/// The downloaded file is not a playable video.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{0} is missing or empty")]
    Empty(PathBuf),

    #[error("ffprobe could not read {path}: {message}")]
    Unreadable { path: PathBuf, message: String },

    #[error("{0} has no video stream")]
    NoVideoStream(PathBuf),

    #[error("{path} has implausible duration {duration:.2}s")]
    Duration { path: PathBuf, duration: f64 },
}

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("Source {0} has zero width or height")]
    UnknownDimensions(PathBuf),

    #[error("ffmpeg failed on {path}: {message}")]
    Failed { path: PathBuf, message: String },

    #[error("ffmpeg timed out after {secs}s on {path}")]
    Timeout { path: PathBuf, secs: u64 },

    #[error("ffmpeg produced an empty file at {0}")]
    EmptyOutput(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Upload limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("Transient upload failure: {0}")]
    Transient(String),

    #[error("Upload rejected: {0}")]
    Rejected(String),

    /// The platform accepted the upload but its reply did not say what was
    /// created. The post may exist, so this is never retried.
    #[error("Upload not confirmed: {0}")]
    Unconfirmed(String),

    #[error("Disk error: {0}")]
    Disk(#[from] std::io::Error),
}

impl UploadError {
    /// Only transient platform failures are worth another attempt. Auth failures
    /// surface immediately, and a hit upload limit will not clear within a run.
    pub fn is_retryable(&self) -> bool {
        matches!(self, UploadError::Transient(_))
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(e: reqwest::Error) -> Self {
        UploadError::Transient(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Download,
    Validate,
    Normalize,
    Upload,
    Record,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Download => "download",
            Stage::Validate => "validate",
            Stage::Normalize => "normalize",
            Stage::Upload => "upload",
            Stage::Record => "record",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Transcode(#[from] TranscodeError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("Processed-set write failed: {0}")]
    Record(std::io::Error),
}

/// A single item's failure, tagged with the identifier and the stage it died in.
#[derive(Debug, Error)]
#[error("{stage} failed for {id}: {source}")]
pub struct ItemError {
    pub id: String,
    pub stage: Stage,
    #[source]
    pub source: StageError,
}

impl ItemError {
    pub fn new(id: &str, stage: Stage, source: impl Into<StageError>) -> Self {
        Self {
            id: id.to_string(),
            stage,
            source: source.into(),
        }
    }
}

/// Run-level failures. Everything else is isolated per item.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Listing source videos failed: {0}")]
    Listing(String),
}

impl From<reqwest::Error> for PipelineError {
    fn from(e: reqwest::Error) -> Self {
        PipelineError::Listing(e.to_string())
    }
}
