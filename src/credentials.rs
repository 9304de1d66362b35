//! Login credentials for one mailbox
//!
//! A mailbox authenticates either with a static password (`LOGIN`) or
//! with an OAuth2 bearer token (`AUTHENTICATE XOAUTH2`). Tokens are
//! stored in Google's "authorized user" JSON format and refreshed
//! through the token endpoint when they have expired.

use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Seconds before the recorded expiry at which a token is treated as
/// expired already.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// How a mailbox proves its identity.
pub enum Credential {
    Password(String),
    OAuth2(TokenSource),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(<redacted>)"),
            Self::OAuth2(source) => f
                .debug_tuple("OAuth2")
                .field(&source.path.display())
                .finish(),
        }
    }
}

/// Contents of an authorized-user token file.
///
/// Fields this crate does not use (`scopes`, `universe_domain`, ...) are
/// kept so that writing the file back does not lose them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizedUser {
    pub token: Option<String>,
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub token_uri: Option<String>,
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl AuthorizedUser {
    /// Whether the access token is missing or about to expire.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.token.as_deref().is_none_or(str::is_empty)
            || self
                .expiry
                .is_some_and(|exp| Utc::now() + Duration::seconds(EXPIRY_MARGIN_SECS) >= exp)
    }
}

/// Client secrets as downloaded from the provider console.
#[derive(Debug, Deserialize)]
struct ClientSecrets {
    installed: Option<ClientApp>,
    web: Option<ClientApp>,
}

#[derive(Debug, Deserialize)]
struct ClientApp {
    client_id: String,
    client_secret: Option<String>,
    token_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefreshError {
    error: String,
    #[serde(default)]
    error_description: String,
}

/// An OAuth2 token backed by a file on disk.
pub struct TokenSource {
    path: PathBuf,
    user: AuthorizedUser,
    http: reqwest::Client,
}

impl TokenSource {
    /// Load a token file, filling in client id and secret from
    /// `secrets_file` when the token file lacks them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if either file cannot be read or parsed.
    pub fn load(token_file: &Path, secrets_file: Option<&Path>) -> Result<Self> {
        let mut user: AuthorizedUser = read_json(token_file)?;

        if let Some(secrets_file) = secrets_file
            && (user.client_id.is_none() || user.client_secret.is_none())
        {
            let secrets: ClientSecrets = read_json(secrets_file)?;
            let app = secrets.installed.or(secrets.web).ok_or_else(|| {
                Error::Config(format!(
                    "{}: expected an 'installed' or 'web' section",
                    secrets_file.display()
                ))
            })?;
            user.client_id.get_or_insert(app.client_id);
            if user.client_secret.is_none() {
                user.client_secret = app.client_secret;
            }
            if user.token_uri.is_none() {
                user.token_uri = app.token_uri;
            }
        }

        debug!("Loaded OAuth2 token from {}", token_file.display());
        Ok(Self::new(token_file.to_path_buf(), user))
    }

    /// Wrap an already-parsed token. Refreshed tokens are written to
    /// `path`.
    #[must_use]
    pub fn new(path: PathBuf, user: AuthorizedUser) -> Self {
        Self {
            path,
            user,
            http: reqwest::Client::new(),
        }
    }

    #[must_use]
    pub const fn authorized_user(&self) -> &AuthorizedUser {
        &self.user
    }

    /// Return a usable access token, refreshing it first if it has
    /// expired.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] if the token is expired and cannot be
    /// refreshed.
    pub async fn valid_token(&mut self) -> Result<String> {
        if self.user.is_expired() {
            self.refresh().await?;
        }
        self.user
            .token
            .clone()
            .ok_or_else(|| Error::Auth("Token file holds no access token".into()))
    }

    async fn refresh(&mut self) -> Result<()> {
        let refresh_token = self
            .user
            .refresh_token
            .as_deref()
            .ok_or_else(|| Error::Auth("Access token expired and no refresh token".into()))?;
        let client_id = self
            .user
            .client_id
            .as_deref()
            .ok_or_else(|| Error::Auth("Cannot refresh token without a client_id".into()))?;
        let token_uri = self.user.token_uri.as_deref().unwrap_or(GOOGLE_TOKEN_URI);

        let mut params = HashMap::new();
        params.insert("grant_type", "refresh_token");
        params.insert("refresh_token", refresh_token);
        params.insert("client_id", client_id);
        if let Some(secret) = &self.user.client_secret {
            params.insert("client_secret", secret);
        }

        debug!("Refreshing OAuth2 token via {}", token_uri);
        let response = self
            .http
            .post(token_uri)
            .form(&params)
            .send()
            .await
            .map_err(|e| Error::Auth(format!("Token refresh request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response
                .json::<RefreshError>()
                .await
                .map(|e| format!("{}: {}", e.error, e.error_description))
                .unwrap_or_else(|_| status.to_string());
            return Err(Error::Auth(format!("Token refresh rejected: {detail}")));
        }

        let refreshed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| Error::Auth(format!("Invalid token refresh response: {e}")))?;

        self.user.token = Some(refreshed.access_token);
        self.user.expiry = refreshed
            .expires_in
            .map(|secs| Utc::now() + Duration::seconds(secs));
        if let Some(rt) = refreshed.refresh_token {
            self.user.refresh_token = Some(rt);
        }
        info!("Refreshed OAuth2 token");

        self.save().await
    }

    async fn save(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.user)
            .map_err(|e| Error::Config(format!("Cannot serialize token: {e}")))?;
        tokio::fs::write(&self.path, json).await?;
        debug!("Saved OAuth2 token to {}", self.path.display());
        Ok(())
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Cannot read {}: {e}", path.display())))?;
    serde_json::from_str(&text)
        .map_err(|e| Error::Config(format!("Cannot parse {}: {e}", path.display())))
}
