//! Instagram web session: cookie state kept in `session.json` and the login
//! flow that establishes it.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use reqwest::header::{REFERER, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{ApiFailure, InstagramClient, WEB_ORIGIN};
use crate::error::AuthError;
use crate::youtube::search::BROWSER_USER_AGENT;

const LOGIN_URL: &str = "https://www.instagram.com/api/v1/web/accounts/login/ajax/";

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionState")
            .field("cookies", &self.cookies.keys().collect::<Vec<_>>())
            .field("username", &self.username)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

impl SessionState {
    /// `Ok(None)` when the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>, AuthError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| AuthError::CorruptCredentials {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }

    pub fn save(&self, path: &Path) -> Result<(), AuthError> {
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn has_session(&self) -> bool {
        self.cookies.get("sessionid").is_some_and(|v| !v.is_empty())
    }

    pub fn csrf_token(&self) -> Option<&str> {
        self.cookies.get("csrftoken").map(String::as_str)
    }

    /// Numeric id of the logged-in account.
    pub fn user_id(&self) -> Option<&str> {
        self.cookies.get("ds_user_id").map(String::as_str)
    }

    pub fn user_agent(&self) -> &str {
        self.user_agent.as_deref().unwrap_or(BROWSER_USER_AGENT)
    }

    /// Apply `Set-Cookie` values; returns whether anything changed.
    pub fn absorb_set_cookies<'a>(&mut self, headers: impl IntoIterator<Item = &'a str>) -> bool {
        let now = SystemTime::now();
        let mut changed = false;
        for header in headers {
            let Ok(parsed) = cookie::Cookie::parse(header) else {
                debug!("Ignoring unparsable Set-Cookie header");
                continue;
            };
            let expired = parsed.value().is_empty()
                || parsed.value() == "\"\""
                || parsed.max_age().is_some_and(|age| age.is_zero() || age.is_negative())
                || parsed
                    .expires_datetime()
                    .is_some_and(|at| SystemTime::from(at) < now);
            if expired {
                changed |= self.cookies.remove(parsed.name()).is_some();
            } else if self.cookies.get(parsed.name()).map(String::as_str) != Some(parsed.value()) {
                self.cookies
                    .insert(parsed.name().to_string(), parsed.value().to_string());
                changed = true;
            }
        }
        changed
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(default)]
    authenticated: bool,
    #[serde(default)]
    two_factor_required: bool,
    #[serde(default)]
    checkpoint_url: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CurrentUserResponse {
    user: CurrentUser,
}

#[derive(Debug, Deserialize)]
struct CurrentUser {
    username: String,
}

impl InstagramClient {
    /// Reuse the saved session when Instagram still accepts it, otherwise log
    /// in with the configured credentials. Any failure here is fatal.
    pub async fn login(
        session_path: &Path,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Self, AuthError> {
        let state = match SessionState::load(session_path) {
            Ok(Some(state)) => state,
            Ok(None) => SessionState::default(),
            Err(e) if password.is_some() => {
                warn!("{}; logging in from scratch", e);
                SessionState::default()
            }
            Err(e) => return Err(e),
        };
        let client = Self::new(session_path, state)?;

        if client.state.lock().has_session() {
            match client.current_username().await {
                Ok(name) => {
                    info!("Reusing Instagram session for @{}", name);
                    client.remember_username(&name);
                    client.persist();
                    return Ok(client);
                }
                Err(ApiFailure::LoginRequired(reason)) => {
                    warn!("Saved Instagram session was rejected ({}); logging in again", reason)
                }
                Err(e) => return Err(AuthError::Rejected(e.to_string())),
            }
        }

        let (Some(username), Some(password)) = (username, password) else {
            return Err(AuthError::MissingCredentials(
                "INSTAGRAM_USERNAME/INSTAGRAM_PASSWORD not set and no valid session.json"
                    .to_string(),
            ));
        };
        client.web_login(username, password).await?;
        let name = client
            .current_username()
            .await
            .map_err(|e| AuthError::Rejected(e.to_string()))?;
        client.remember_username(&name);
        client.persist();
        info!("Logged in to Instagram as @{}", name);
        Ok(client)
    }

    async fn current_username(&self) -> Result<String, ApiFailure> {
        let value = self
            .get_json("accounts/current_user/", &[("edit", "true")])
            .await?;
        let parsed: CurrentUserResponse =
            serde_json::from_value(value).map_err(|e| ApiFailure::Decode(e.to_string()))?;
        Ok(parsed.user.username)
    }

    fn remember_username(&self, name: &str) {
        self.state.lock().username = Some(name.to_string());
    }

    async fn web_login(&self, username: &str, password: &str) -> Result<(), AuthError> {
        // The login endpoint wants a csrftoken cookie issued by the home page.
        if self.state.lock().csrf_token().is_none() {
            let user_agent = self.state.lock().user_agent().to_string();
            let response = self
                .http
                .get(format!("{WEB_ORIGIN}/"))
                .header(USER_AGENT, user_agent)
                .send()
                .await?;
            self.absorb(&response);
        }

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let enc_password = format!("#PWD_INSTAGRAM_BROWSER:0:{timestamp}:{password}");
        let form = [
            ("username", username),
            ("enc_password", enc_password.as_str()),
            ("queryParams", "{}"),
            ("optIntoOneTap", "false"),
        ];
        let response = self
            .request(reqwest::Method::POST, LOGIN_URL)
            .header(REFERER, format!("{WEB_ORIGIN}/accounts/login/"))
            .form(&form)
            .send()
            .await?;
        self.absorb(&response);
        let body = response.text().await?;
        let parsed: LoginResponse = serde_json::from_str(&body).map_err(|_| {
            AuthError::Rejected(format!(
                "unexpected login response: {}",
                body.chars().take(200).collect::<String>()
            ))
        })?;
        check_login(&parsed)?;
        if !self.state.lock().has_session() {
            return Err(AuthError::Rejected(
                "login succeeded but no sessionid cookie was issued".to_string(),
            ));
        }
        Ok(())
    }
}

fn check_login(response: &LoginResponse) -> Result<(), AuthError> {
    if response.authenticated {
        return Ok(());
    }
    if response.two_factor_required {
        return Err(AuthError::Rejected(
            "two-factor authentication is required; log in through a browser and copy the \
             sessionid cookie into session.json"
                .to_string(),
        ));
    }
    if let Some(url) = &response.checkpoint_url {
        return Err(AuthError::Rejected(format!(
            "Instagram wants a security checkpoint first: {WEB_ORIGIN}{url}"
        )));
    }
    Err(AuthError::Rejected(
        response
            .message
            .clone()
            .unwrap_or_else(|| "wrong username or password".to_string()),
    ))
}
