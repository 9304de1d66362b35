//! Run configuration
//!
//! A single JSON document names both mailboxes, the search criteria and
//! the run options. Passwords can be kept out of the file with
//! `password_env`, which is resolved after loading `.env` if present.

use crate::connection::{MailboxEndpoint, Security};
use crate::credentials::{Credential, TokenSource};
use crate::error::{Error, Result};
use crate::flag::Flag;
use crate::folder::{Folder, FolderPolicy};
use crate::query::{SearchSpecification, parse_date};
use crate::sync::{Account, SyncOptions};
use serde::Deserialize;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

const LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "warning", "error"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    #[default]
    Password,
    #[serde(alias = "xoauth2")]
    OAuth2,
}

/// One mailbox as written in the config file.
#[derive(Clone, Deserialize)]
pub struct MailboxConfig {
    #[serde(default)]
    pub server: String,
    #[serde(default = "default_port")]
    pub port: u32,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub auth_method: AuthMethod,
    pub password: Option<String>,
    /// Environment variable holding the password.
    pub password_env: Option<String>,
    /// OAuth2 client secrets (`installed` or `web`).
    pub credentials_file: Option<PathBuf>,
    /// OAuth2 authorized-user token, rewritten on refresh.
    pub token_file: Option<PathBuf>,
    #[serde(default = "default_folder")]
    pub folder: String,
    #[serde(default)]
    pub security: Security,
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default = "default_true")]
    pub allow_folder_fallback: bool,
    pub fallback_folder: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

const fn default_port() -> u32 {
    993
}

fn default_folder() -> String {
    "INBOX".into()
}

const fn default_true() -> bool {
    true
}

const fn default_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".into()
}

impl fmt::Debug for MailboxConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailboxConfig")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("auth_method", &self.auth_method)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("password_env", &self.password_env)
            .field("token_file", &self.token_file)
            .field("folder", &self.folder)
            .field("security", &self.security)
            .finish_non_exhaustive()
    }
}

impl MailboxConfig {
    fn problems(&self, name: &str, out: &mut Vec<String>) {
        if self.server.trim().is_empty() {
            out.push(format!("{name}.server is empty"));
        }
        if self.username.trim().is_empty() {
            out.push(format!("{name}.username is empty"));
        }
        if !(1..=u32::from(u16::MAX)).contains(&self.port) {
            out.push(format!("{name}.port {} is out of range", self.port));
        }
        if self.timeout_secs == 0 {
            out.push(format!("{name}.timeout_secs must be positive"));
        }
        if self.folder.trim().is_empty() {
            out.push(format!("{name}.folder is empty"));
        }
        match self.auth_method {
            AuthMethod::Password if self.password.is_none() && self.password_env.is_none() => {
                out.push(format!("{name}: password auth needs password or password_env"));
            }
            AuthMethod::OAuth2 if self.token_file.is_none() => {
                out.push(format!("{name}: oauth2 auth needs token_file"));
            }
            _ => {}
        }
    }

    /// Connection settings for this mailbox.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the port is out of range.
    pub fn endpoint(&self) -> Result<MailboxEndpoint> {
        let port = u16::try_from(self.port)
            .ok()
            .filter(|&p| p != 0)
            .ok_or_else(|| Error::Config(format!("Port {} is out of range", self.port)))?;
        Ok(MailboxEndpoint {
            server: self.server.clone(),
            port,
            username: self.username.clone(),
            security: self.security,
            accept_invalid_certs: self.accept_invalid_certs,
            folder: FolderPolicy::for_host(
                &self.server,
                Folder::from(self.folder.as_str()),
                self.allow_folder_fallback,
                self.fallback_folder.as_deref(),
            ),
            timeout: Duration::from_secs(self.timeout_secs),
        })
    }

    /// Resolve the credential, reading token files and environment
    /// variables as needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the password or token cannot be found.
    pub fn credential(&self) -> Result<Credential> {
        match self.auth_method {
            AuthMethod::Password => {
                if let Some(password) = &self.password {
                    return Ok(Credential::Password(password.clone()));
                }
                let var = self
                    .password_env
                    .as_deref()
                    .ok_or_else(|| Error::Config(format!("No password for {}", self.username)))?;
                dotenvy::dotenv().ok();
                env::var(var)
                    .map(Credential::Password)
                    .map_err(|_| Error::Config(format!("{var} not set")))
            }
            AuthMethod::OAuth2 => {
                let token_file = self.token_file.as_deref().ok_or_else(|| {
                    Error::Config(format!("No token_file for {}", self.username))
                })?;
                let source = TokenSource::load(token_file, self.credentials_file.as_deref())?;
                Ok(Credential::OAuth2(source))
            }
        }
    }

    /// Endpoint and credential together.
    ///
    /// # Errors
    ///
    /// See [`Self::endpoint`] and [`Self::credential`].
    pub fn account(&self) -> Result<Account> {
        Ok(Account {
            endpoint: self.endpoint()?,
            credential: self.credential()?,
        })
    }
}

/// Source-side search criteria. Dates are `YYYY-MM-DD`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchCriteria {
    pub from: Option<String>,
    pub to: Option<String>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub date_after: Option<String>,
    #[serde(alias = "before_date")]
    pub date_before: Option<String>,
    pub gmail_query: Option<String>,
}

impl SearchCriteria {
    /// # Errors
    ///
    /// Returns [`Error::Config`] for unparseable dates or values that
    /// cannot be searched for.
    pub fn specification(&self) -> Result<SearchSpecification> {
        let mut spec = SearchSpecification::new();
        if let Some(v) = &self.from {
            spec = spec.sender(v);
        }
        if let Some(v) = &self.to {
            spec = spec.recipient(v);
        }
        if let Some(v) = &self.subject {
            spec = spec.subject(v);
        }
        if let Some(v) = &self.body {
            spec = spec.body(v);
        }
        if let Some(v) = &self.date_after {
            spec = spec.date_after(parse_date(v)?);
        }
        if let Some(v) = &self.date_before {
            spec = spec.date_before(parse_date(v)?);
        }
        if let Some(v) = &self.gmail_query {
            spec = spec.native_query(v);
        }
        spec.validate()?;
        Ok(spec)
    }
}

/// The whole config document.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub source_mailbox: Option<MailboxConfig>,
    pub target_mailbox: Option<MailboxConfig>,
    #[serde(default)]
    pub search_criteria: SearchCriteria,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub dry_run: bool,
    /// Keyword added to confirmed messages on dry runs.
    pub dry_run_marker: Option<String>,
}

impl Config {
    /// Read and validate a config file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file cannot be read, is not
    /// valid JSON or fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Cannot read {}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    /// Parse and validate a config document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the document is malformed or fails
    /// validation.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| Error::Config(format!("Invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the whole document, reporting every problem at once.
    ///
    /// # Errors
    ///
    /// Returns one [`Error::Config`] listing all problems found.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        for (name, mailbox) in [
            ("source_mailbox", &self.source_mailbox),
            ("target_mailbox", &self.target_mailbox),
        ] {
            match mailbox {
                Some(mailbox) => mailbox.problems(name, &mut problems),
                None => problems.push(format!("{name} is missing")),
            }
        }

        if !LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            problems.push(format!(
                "log_level '{}' is not one of {}",
                self.log_level,
                LOG_LEVELS.join("/")
            ));
        }
        if let Some(marker) = &self.dry_run_marker
            && let Err(e) = Flag::keyword(marker)
        {
            problems.push(e.to_string());
        }

        let criteria = &self.search_criteria;
        let dates = [
            ("date_after", &criteria.date_after),
            ("date_before", &criteria.date_before),
        ];
        for (field, value) in dates {
            if let Some(value) = value
                && let Err(e) = parse_date(value)
            {
                problems.push(format!("search_criteria.{field}: {e}"));
            }
        }
        if let Err(e) = criteria.specification()
            && !problems.iter().any(|p| p.starts_with("search_criteria."))
        {
            problems.push(format!("search_criteria: {e}"));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(problems.join("; ")))
        }
    }

    /// `tracing` filter directive for the configured level.
    #[must_use]
    pub fn log_filter(&self) -> &'static str {
        match self.log_level.to_lowercase().as_str() {
            "trace" => "trace",
            "debug" => "debug",
            "warn" | "warning" => "warn",
            "error" => "error",
            _ => "info",
        }
    }

    /// Source and target accounts, with credentials resolved.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a mailbox is missing or its
    /// credential cannot be resolved.
    pub fn accounts(&self) -> Result<(Account, Account)> {
        let source = self
            .source_mailbox
            .as_ref()
            .ok_or_else(|| Error::Config("source_mailbox is missing".into()))?;
        let target = self
            .target_mailbox
            .as_ref()
            .ok_or_else(|| Error::Config("target_mailbox is missing".into()))?;
        Ok((source.account()?, target.account()?))
    }

    /// # Errors
    ///
    /// See [`SearchCriteria::specification`].
    pub fn search_specification(&self) -> Result<SearchSpecification> {
        self.search_criteria.specification()
    }

    /// Run options; `force_dry_run` is OR'd with the file's `dry_run`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid marker keyword.
    pub fn sync_options(&self, force_dry_run: bool) -> Result<SyncOptions> {
        Ok(SyncOptions {
            dry_run: self.dry_run || force_dry_run,
            dry_run_marker: self.dry_run_marker.as_deref().map(Flag::keyword).transpose()?,
        })
    }
}
