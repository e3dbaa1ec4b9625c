//! OAuth credentials for the YouTube Data API.
//!
//! `token.json` uses Google's "authorized user" layout so a token produced by
//! other Google tooling can be dropped in unchanged. Unknown fields survive a
//! rewrite.

use std::fmt;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::AuthError;

pub const UPLOAD_SCOPE: &str = "https://www.googleapis.com/auth/youtube.upload";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
const REDIRECT_URI: &str = "http://localhost";
/// Refresh this long before the recorded expiry.
const EXPIRY_SKEW_SECS: i64 = 60;

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Clone, Serialize, Deserialize)]
pub struct AuthorizedUser {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// RFC 3339 UTC timestamp.
    #[serde(default)]
    pub expiry: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl fmt::Debug for AuthorizedUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizedUser")
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("token_uri", &self.token_uri)
            .field("client_id", &self.client_id)
            .field("scopes", &self.scopes)
            .field("expiry", &self.expiry)
            .finish()
    }
}

impl AuthorizedUser {
    pub fn has_upload_scope(&self) -> bool {
        // Older token files omit scopes; the API answers 403 later if it is missing.
        self.scopes.is_empty() || self.scopes.iter().any(|s| s == UPLOAD_SCOPE)
    }

    /// True when there is no access token or it expires within the skew window.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        if self.token.as_deref().is_none_or(str::is_empty) {
            return true;
        }
        match self.expiry.as_deref().map(DateTime::parse_from_rfc3339) {
            Some(Ok(expiry)) => {
                now + chrono::Duration::seconds(EXPIRY_SKEW_SECS) >= expiry.with_timezone(&Utc)
            }
            Some(Err(_)) | None => true,
        }
    }

    fn apply(&mut self, response: TokenResponse, now: DateTime<Utc>) {
        self.token = Some(response.access_token);
        if let Some(refresh) = response.refresh_token {
            self.refresh_token = Some(refresh);
        }
        if let Some(scope) = response.scope {
            self.scopes = scope.split_whitespace().map(str::to_string).collect();
        }
        let expiry = now + chrono::Duration::seconds(response.expires_in.unwrap_or(3600));
        self.expiry = Some(expiry.to_rfc3339_opts(SecondsFormat::Micros, true));
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

/// `client_secrets.json` as downloaded from the Google Cloud console.
#[derive(Debug, Deserialize)]
struct ClientSecretsFile {
    installed: Option<ClientSecrets>,
    web: Option<ClientSecrets>,
}

#[derive(Debug, Deserialize)]
struct ClientSecrets {
    client_id: String,
    client_secret: String,
    #[serde(default)]
    auth_uri: Option<String>,
    #[serde(default)]
    token_uri: Option<String>,
}

pub fn load_token(path: &Path) -> Result<AuthorizedUser, AuthError> {
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| AuthError::CorruptCredentials {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

pub fn save_token(path: &Path, token: &AuthorizedUser) -> Result<(), AuthError> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(token)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

async fn post_token_form(
    client: &Client,
    token_uri: &str,
    form: &[(&str, &str)],
) -> Result<TokenResponse, AuthError> {
    let response = client.post(token_uri).form(form).send().await?;
    let status = response.status();
    let body = response.text().await?;
    if status.is_success() {
        return Ok(serde_json::from_str(&body)?);
    }
    let reason = match serde_json::from_str::<TokenErrorResponse>(&body) {
        Ok(err) => match err.error_description {
            Some(desc) => format!("{}: {}", err.error, desc),
            None => err.error,
        },
        Err(_) => format!("HTTP {status}"),
    };
    Err(AuthError::Rejected(format!(
        "token endpoint refused the request ({reason}); delete token.json and authorize again"
    )))
}

pub async fn refresh(client: &Client, token: &mut AuthorizedUser) -> Result<(), AuthError> {
    let refresh_token = token.refresh_token.clone().ok_or_else(|| {
        AuthError::MissingCredentials("token.json has no refresh_token".to_string())
    })?;
    debug!("Refreshing YouTube access token");
    let response = post_token_form(
        client,
        &token.token_uri,
        &[
            ("client_id", token.client_id.as_str()),
            ("client_secret", token.client_secret.as_str()),
            ("refresh_token", refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ],
    )
    .await?;
    token.apply(response, Utc::now());
    Ok(())
}

/// Accepts either the bare code or the whole redirect URL pasted from the browser.
pub fn extract_auth_code(input: &str) -> Option<String> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if let Ok(url) = Url::parse(input) {
        return url
            .query_pairs()
            .find(|(k, _)| k == "code")
            .map(|(_, v)| v.into_owned());
    }
    Some(input.to_string())
}

fn load_client_secrets(path: &Path) -> Result<ClientSecrets, AuthError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        AuthError::MissingCredentials(format!("cannot read {}: {}", path.display(), e))
    })?;
    let file: ClientSecretsFile =
        serde_json::from_str(&text).map_err(|e| AuthError::CorruptCredentials {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    file.installed
        .or(file.web)
        .ok_or_else(|| AuthError::CorruptCredentials {
            path: path.to_path_buf(),
            reason: "expected an \"installed\" or \"web\" client".to_string(),
        })
}

/// Installed-app consent flow on the terminal.
async fn authorize_interactive(
    client: &Client,
    secrets_path: &Path,
) -> Result<AuthorizedUser, AuthError> {
    let secrets = load_client_secrets(secrets_path)?;
    let auth_uri = secrets.auth_uri.as_deref().unwrap_or(DEFAULT_AUTH_URI);
    let consent = Url::parse_with_params(
        auth_uri,
        &[
            ("client_id", secrets.client_id.as_str()),
            ("redirect_uri", REDIRECT_URI),
            ("response_type", "code"),
            ("scope", UPLOAD_SCOPE),
            ("access_type", "offline"),
            ("prompt", "consent"),
        ],
    )
    .map_err(|e| AuthError::CorruptCredentials {
        path: secrets_path.to_path_buf(),
        reason: format!("bad auth_uri: {e}"),
    })?;

    let input = tokio::task::spawn_blocking(move || {
        println!("Open this URL in a browser and allow YouTube uploads:\n\n{consent}\n");
        print!("Paste the code (or the whole redirected URL): ");
        io::stdout().flush()?;
        let mut line = String::new();
        io::stdin().read_line(&mut line)?;
        Ok::<String, io::Error>(line)
    })
    .await
    .map_err(|e| AuthError::Io(io::Error::other(e)))??;

    let code = extract_auth_code(&input)
        .ok_or_else(|| AuthError::MissingCredentials("no authorization code entered".into()))?;
    let token_uri = secrets
        .token_uri
        .clone()
        .unwrap_or_else(default_token_uri);
    let response = post_token_form(
        client,
        &token_uri,
        &[
            ("code", code.as_str()),
            ("client_id", secrets.client_id.as_str()),
            ("client_secret", secrets.client_secret.as_str()),
            ("redirect_uri", REDIRECT_URI),
            ("grant_type", "authorization_code"),
        ],
    )
    .await?;

    let mut token = AuthorizedUser {
        token: None,
        refresh_token: None,
        token_uri,
        client_id: secrets.client_id,
        client_secret: secrets.client_secret,
        scopes: vec![UPLOAD_SCOPE.to_string()],
        expiry: None,
        extra: serde_json::Map::new(),
    };
    token.apply(response, Utc::now());
    if token.refresh_token.is_none() {
        warn!("Google returned no refresh token; this token will stop working when it expires");
    }
    Ok(token)
}

/// A usable YouTube credential, refreshed on demand and written back to disk.
pub struct OAuthSession {
    client: Client,
    path: PathBuf,
    token: Mutex<AuthorizedUser>,
}

impl OAuthSession {
    /// Load `token.json`, refreshing it if needed. Without a token file, run
    /// the consent flow when attached to a terminal; otherwise fail.
    pub async fn load_or_authorize(
        client: Client,
        token_path: &Path,
        secrets_path: &Path,
    ) -> Result<Self, AuthError> {
        let token = if token_path.exists() {
            let token = load_token(token_path)?;
            if !token.has_upload_scope() {
                return Err(AuthError::MissingScope(UPLOAD_SCOPE.to_string()));
            }
            token
        } else if io::stdin().is_terminal() {
            info!("No {} found; starting YouTube authorization", token_path.display());
            let token = authorize_interactive(&client, secrets_path).await?;
            save_token(token_path, &token)?;
            info!("Saved YouTube token to {}", token_path.display());
            token
        } else {
            return Err(AuthError::MissingCredentials(format!(
                "{} not found; run interactively once to authorize YouTube uploads",
                token_path.display()
            )));
        };

        let session = Self {
            client,
            path: token_path.to_path_buf(),
            token: Mutex::new(token),
        };
        session.access_token().await?;
        Ok(session)
    }

    /// Current bearer token, refreshing and persisting first if it is stale.
    pub async fn access_token(&self) -> Result<String, AuthError> {
        let mut token = self.token.lock().clone();
        if token.needs_refresh(Utc::now()) {
            refresh(&self.client, &mut token).await?;
            if let Err(e) = save_token(&self.path, &token) {
                warn!("Could not write refreshed token to {}: {}", self.path.display(), e);
            }
            *self.token.lock() = token.clone();
        }
        token
            .token
            .ok_or_else(|| AuthError::MissingCredentials("no access token".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AuthorizedUser {
        serde_json::from_str(
            r#"{
                "token": "ya29.abc",
                "refresh_token": "1//xyz",
                "token_uri": "https://oauth2.googleapis.com/token",
                "client_id": "id.apps.googleusercontent.com",
                "client_secret": "secret",
                "scopes": ["https://www.googleapis.com/auth/youtube.upload"],
                "universe_domain": "googleapis.com",
                "account": "",
                "expiry": "2030-01-01T00:00:00.000000Z"
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_valid_token_needs_no_refresh() {
        let token = sample();
        let now = DateTime::parse_from_rfc3339("2029-12-31T23:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(!token.needs_refresh(now));
        assert!(token.has_upload_scope());
    }

    #[test]
    fn test_token_near_expiry_needs_refresh() {
        let token = sample();
        let now = DateTime::parse_from_rfc3339("2029-12-31T23:59:30Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(token.needs_refresh(now));
    }

    #[test]
    fn test_missing_expiry_or_token_needs_refresh() {
        let mut token = sample();
        token.expiry = None;
        assert!(token.needs_refresh(Utc::now()));
        let mut token = sample();
        token.token = None;
        assert!(token.needs_refresh(Utc::now()));
    }

    #[test]
    fn test_wrong_scope_detected() {
        let mut token = sample();
        token.scopes = vec!["https://www.googleapis.com/auth/youtube.readonly".into()];
        assert!(!token.has_upload_scope());
    }

    #[test]
    fn test_apply_keeps_refresh_token_when_not_returned() {
        let mut token = sample();
        let now = Utc::now();
        token.apply(
            TokenResponse {
                access_token: "ya29.new".into(),
                expires_in: Some(3599),
                refresh_token: None,
                scope: None,
            },
            now,
        );
        assert_eq!(token.token.as_deref(), Some("ya29.new"));
        assert_eq!(token.refresh_token.as_deref(), Some("1//xyz"));
        assert!(!token.needs_refresh(now));
    }

    #[test]
    fn test_round_trip_preserves_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        save_token(&path, &sample()).unwrap();
        let loaded = load_token(&path).unwrap();
        assert_eq!(loaded.extra.get("universe_domain").unwrap(), "googleapis.com");
        assert!(!dir.path().join("token.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_token_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            load_token(&path),
            Err(AuthError::CorruptCredentials { .. })
        ));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let text = format!("{:?}", sample());
        assert!(!text.contains("ya29.abc"));
        assert!(!text.contains("1//xyz"));
        assert!(!text.contains("\"secret\""));
    }

    #[test]
    fn test_extract_auth_code() {
        assert_eq!(extract_auth_code("  4/0Abc  \n").as_deref(), Some("4/0Abc"));
        assert_eq!(
            extract_auth_code("http://localhost/?code=4/0Xyz&scope=s").as_deref(),
            Some("4/0Xyz")
        );
        assert_eq!(extract_auth_code("\n"), None);
    }
}
