//! Instagram over its web API: session handling, Reels listing and download,
//! and Reels publishing.

pub mod download;
pub mod reels;
pub mod session;
pub mod upload;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::cookie::Jar;
use reqwest::header::{ACCEPT, ORIGIN, REFERER, SET_COOKIE, USER_AGENT};
use reqwest::{Client, Method, RequestBuilder, Response, Url};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{AuthError, PipelineError, UploadError};

pub use reels::ReelsSource;
pub use session::SessionState;
pub use upload::ReelsUploader;

pub const WEB_ORIGIN: &str = "https://www.instagram.com";
const API_BASE: &str = "https://www.instagram.com/api/v1";
const IG_APP_ID: &str = "936619743392459";
const ASBD_ID: &str = "129477";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// A failed Instagram API call, classified by what the caller should do about it.
#[derive(Debug, Error)]
pub enum ApiFailure {
    #[error("Instagram session rejected: {0}")]
    LoginRequired(String),

    #[error("Instagram is rate limiting requests: {0}")]
    RateLimited(String),

    #[error("Instagram blocked the action: {0}")]
    ActionBlocked(String),

    #[error("Instagram has not finished processing the upload")]
    NotReady,

    #[error("Instagram returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Unexpected Instagram response: {0}")]
    Decode(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl From<ApiFailure> for UploadError {
    fn from(e: ApiFailure) -> Self {
        match e {
            ApiFailure::LoginRequired(reason) => UploadError::Auth(AuthError::Rejected(reason)),
            ApiFailure::ActionBlocked(reason) => UploadError::LimitExceeded(reason),
            ApiFailure::RateLimited(_) | ApiFailure::NotReady | ApiFailure::Http(_) => {
                UploadError::Transient(e.to_string())
            }
            ApiFailure::Status { status, .. } if status >= 500 => {
                UploadError::Transient(e.to_string())
            }
            ApiFailure::Status { .. } | ApiFailure::Decode(_) => {
                UploadError::Rejected(e.to_string())
            }
        }
    }
}

impl From<ApiFailure> for PipelineError {
    fn from(e: ApiFailure) -> Self {
        match e {
            ApiFailure::LoginRequired(reason) => PipelineError::Auth(AuthError::Rejected(reason)),
            other => PipelineError::Listing(other.to_string()),
        }
    }
}

/// Decide whether an API response succeeded and return its JSON body.
pub fn classify_response(status: u16, body: &str) -> Result<Value, ApiFailure> {
    let json: Option<Value> = serde_json::from_str(body).ok();
    let message = json
        .as_ref()
        .and_then(|v| v.get("message"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let failed = json
        .as_ref()
        .and_then(|v| v.get("status"))
        .and_then(Value::as_str)
        == Some("fail");

    match message.as_str() {
        "login_required" | "challenge_required" | "checkpoint_required" => {
            return Err(ApiFailure::LoginRequired(message));
        }
        "feedback_required" => {
            let title = json
                .as_ref()
                .and_then(|v| v.get("feedback_message"))
                .and_then(Value::as_str)
                .unwrap_or("feedback_required");
            return Err(ApiFailure::ActionBlocked(title.to_string()));
        }
        m if m.starts_with("Transcode not finished") => return Err(ApiFailure::NotReady),
        m if m.contains("wait a few minutes") => return Err(ApiFailure::RateLimited(message)),
        _ => {}
    }

    match status {
        401 | 403 => Err(ApiFailure::LoginRequired(if message.is_empty() {
            format!("HTTP {status}")
        } else {
            message
        })),
        429 => Err(ApiFailure::RateLimited(format!("HTTP {status}"))),
        202 => Err(ApiFailure::NotReady),
        200..=299 if !failed => {
            json.ok_or_else(|| ApiFailure::Decode(body.chars().take(200).collect()))
        }
        _ => Err(ApiFailure::Status {
            status,
            message: if message.is_empty() {
                body.chars().take(200).collect()
            } else {
                message
            },
        }),
    }
}

/// Cookie jar holding the saved session cookies for instagram.com.
fn seeded_jar(state: &SessionState) -> Arc<Jar> {
    let jar = Arc::new(Jar::default());
    match Url::parse(WEB_ORIGIN) {
        Ok(url) => {
            for (name, value) in &state.cookies {
                jar.add_cookie_str(&format!("{name}={value}; Domain=instagram.com; Path=/"), &url);
            }
        }
        Err(e) => warn!("Cannot seed Instagram cookies: {}", e),
    }
    jar
}

/// Authenticated Instagram client shared by the Reels source and uploader.
pub struct InstagramClient {
    http: Client,
    /// Kept alive for the `Client` that sends from it.
    #[allow(dead_code)]
    jar: Arc<Jar>,
    session_path: PathBuf,
    state: Mutex<SessionState>,
}

impl InstagramClient {
    fn new(session_path: &Path, state: SessionState) -> Result<Self, reqwest::Error> {
        let jar = seeded_jar(&state);
        let http = Client::builder()
            .cookie_provider(jar.clone())
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            jar,
            session_path: session_path.to_path_buf(),
            state: Mutex::new(state),
        })
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn user_id(&self) -> Option<String> {
        self.state.lock().user_id().map(str::to_string)
    }

    pub fn username(&self) -> Option<String> {
        self.state.lock().username.clone()
    }

    /// A request with the web app headers; cookies come from the jar.
    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let (user_agent, csrf) = {
            let state = self.state.lock();
            (
                state.user_agent().to_string(),
                state.csrf_token().map(str::to_string),
            )
        };
        let mut builder = self
            .http
            .request(method, url)
            .header(USER_AGENT, user_agent)
            .header(ACCEPT, "*/*")
            .header(ORIGIN, WEB_ORIGIN)
            .header(REFERER, format!("{WEB_ORIGIN}/"))
            .header("X-IG-App-ID", IG_APP_ID)
            .header("X-ASBD-ID", ASBD_ID)
            .header("X-Requested-With", "XMLHttpRequest");
        if let Some(csrf) = csrf {
            builder = builder.header("X-CSRFToken", csrf);
        }
        builder
    }

    /// Track `Set-Cookie` headers in the saved session, writing it if anything changed.
    /// The jar picks the same headers up on its own.
    fn absorb(&self, response: &Response) {
        let headers: Vec<&str> = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        if headers.is_empty() {
            return;
        }
        let changed = self.state.lock().absorb_set_cookies(headers);
        if changed {
            debug!("Instagram session cookies updated");
            self.persist();
        }
    }

    pub fn persist(&self) {
        let state = self.state.lock().clone();
        if let Err(e) = state.save(&self.session_path) {
            warn!("Could not save {}: {}", self.session_path.display(), e);
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Value, ApiFailure> {
        let response = builder.send().await?;
        self.absorb(&response);
        let status = response.status().as_u16();
        let body = response.text().await?;
        classify_response(status, &body)
    }

    pub async fn get_json(&self, path: &str, query: &[(&str, &str)]) -> Result<Value, ApiFailure> {
        let url = format!("{API_BASE}/{path}");
        self.send(self.request(Method::GET, &url).query(query)).await
    }

    pub async fn post_form(&self, path: &str, form: &[(&str, &str)]) -> Result<Value, ApiFailure> {
        let url = format!("{API_BASE}/{path}");
        self.send(self.request(Method::POST, &url).form(form)).await
    }

    /// POST raw bytes to an absolute upload URL with extra headers.
    pub async fn post_bytes(
        &self,
        url: &str,
        headers: &[(&str, String)],
        body: Vec<u8>,
    ) -> Result<Value, ApiFailure> {
        let mut builder = self.request(Method::POST, url);
        for (name, value) in headers {
            builder = builder.header(*name, value.as_str());
        }
        self.send(builder.body(body)).await
    }
}
