//! Search specification and its translation into IMAP SEARCH syntax
//!
//! A [`SearchSpecification`] holds the user's fielded criteria and an
//! optional provider-native query string. [`translate`] turns it into
//! a [`ProtocolQuery`], choosing the native form only when the server
//! advertises support for it.
//!
//! IMAP semantics for the date keys: `SINCE` is `>= date`, `BEFORE` is
//! `< date`, both at day granularity.

use crate::error::{Error, Result};
use chrono::NaiveDate;
use std::fmt;
use tracing::{debug, warn};

/// Capability advertised by servers accepting `X-GM-RAW` searches.
pub const NATIVE_QUERY_CAPABILITY: &str = "X-GM-EXT-1";

/// Date formats accepted for the date criteria, tried in order.
const DATE_FORMATS: [&str; 6] = [
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%d-%b-%Y",
    "%d %b %Y",
    "%B %d, %Y",
    "%b %d, %Y",
];

/// Parse a human-readable calendar date.
///
/// Accepts `2024-01-15`, `2024/01/15`, `15-Jan-2024` (the IMAP form),
/// `15 Jan 2024` and `January 15, 2024`.
pub fn parse_date(input: &str) -> Result<NaiveDate> {
    let trimmed = input.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
        .ok_or_else(|| Error::Config(format!("Invalid date '{input}'")))
}

/// Format a date the way IMAP SEARCH expects it (`1-Feb-2024`).
#[must_use]
pub fn imap_date(date: NaiveDate) -> String {
    date.format("%-d-%b-%Y").to_string()
}

/// What a server lets us do when searching.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerCapabilities {
    /// `X-GM-RAW` provider-native queries.
    pub native_query: bool,
    /// `UID EXPUNGE` (RFC 4315).
    pub uidplus: bool,
}

impl ServerCapabilities {
    /// Derive capabilities from the server's CAPABILITY names.
    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        names
            .into_iter()
            .fold(Self::default(), |mut caps, name| {
                if name.eq_ignore_ascii_case(NATIVE_QUERY_CAPABILITY) {
                    caps.native_query = true;
                } else if name.eq_ignore_ascii_case("UIDPLUS") {
                    caps.uidplus = true;
                }
                caps
            })
    }
}

/// Fielded criteria plus an optional native query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchSpecification {
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub date_after: Option<NaiveDate>,
    pub date_before: Option<NaiveDate>,
    pub native_query: Option<String>,
}

impl SearchSpecification {
    /// A specification matching everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn sender(mut self, value: impl Into<String>) -> Self {
        self.sender = Some(value.into());
        self
    }

    #[must_use]
    pub fn recipient(mut self, value: impl Into<String>) -> Self {
        self.recipient = Some(value.into());
        self
    }

    #[must_use]
    pub fn subject(mut self, value: impl Into<String>) -> Self {
        self.subject = Some(value.into());
        self
    }

    #[must_use]
    pub fn body(mut self, value: impl Into<String>) -> Self {
        self.body = Some(value.into());
        self
    }

    #[must_use]
    pub const fn date_after(mut self, date: NaiveDate) -> Self {
        self.date_after = Some(date);
        self
    }

    #[must_use]
    pub const fn date_before(mut self, date: NaiveDate) -> Self {
        self.date_before = Some(date);
        self
    }

    #[must_use]
    pub fn native_query(mut self, query: impl Into<String>) -> Self {
        self.native_query = Some(query.into());
        self
    }

    /// The native query, if one was given and is not blank.
    #[must_use]
    pub fn native(&self) -> Option<&str> {
        self.native_query
            .as_deref()
            .filter(|q| !q.trim().is_empty())
    }

    /// Translate the fielded criteria into search keys.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a value cannot be sent as an IMAP
    /// quoted string.
    pub fn fielded_keys(&self) -> Result<Vec<SearchKey>> {
        let mut keys = Vec::new();
        let text_fields: [(&str, &Option<String>, fn(String) -> SearchKey); 4] = [
            ("from", &self.sender, SearchKey::From),
            ("to", &self.recipient, SearchKey::To),
            ("subject", &self.subject, SearchKey::Subject),
            ("body", &self.body, SearchKey::Body),
        ];
        for (field, value, key) in text_fields {
            if let Some(value) = value {
                check_quotable(field, value)?;
                keys.push(key(value.clone()));
            }
        }
        if let Some(date) = self.date_after {
            keys.push(SearchKey::Since(date));
        }
        if let Some(date) = self.date_before {
            keys.push(SearchKey::Before(date));
        }
        if let (Some(after), Some(before)) = (self.date_after, self.date_before)
            && after >= before
        {
            warn!(
                "date_after {} is not before date_before {}; nothing can match",
                after, before
            );
        }
        Ok(keys)
    }

    /// Check every part of the specification that can be checked
    /// without talking to a server.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for unusable values.
    pub fn validate(&self) -> Result<()> {
        self.fielded_keys()?;
        if let Some(native) = self.native() {
            check_native(native)?;
        }
        Ok(())
    }
}

/// A single IMAP SEARCH key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchKey {
    From(String),
    To(String),
    Subject(String),
    Body(String),
    Since(NaiveDate),
    Before(NaiveDate),
    SentOn(NaiveDate),
    Header(String, String),
}

impl fmt::Display for SearchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::From(v) => write!(f, "FROM {}", quote(v)),
            Self::To(v) => write!(f, "TO {}", quote(v)),
            Self::Subject(v) => write!(f, "SUBJECT {}", quote(v)),
            Self::Body(v) => write!(f, "BODY {}", quote(v)),
            Self::Since(d) => write!(f, "SINCE {}", imap_date(*d)),
            Self::Before(d) => write!(f, "BEFORE {}", imap_date(*d)),
            Self::SentOn(d) => write!(f, "SENTON {}", imap_date(*d)),
            Self::Header(name, v) => write!(f, "HEADER {} {}", quote(name), quote(v)),
        }
    }
}

/// A search ready to be sent to one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolQuery {
    /// Provider-native query, passed through uninterpreted.
    Native(String),
    /// Standard keys combined with implicit AND. Empty means ALL.
    Fielded(Vec<SearchKey>),
}

impl ProtocolQuery {
    /// A query matching every message in the folder.
    #[must_use]
    pub const fn all() -> Self {
        Self::Fielded(Vec::new())
    }

    /// Whether the query selects every message in the folder.
    #[must_use]
    pub fn is_match_all(&self) -> bool {
        matches!(self, Self::Fielded(keys) if keys.is_empty())
    }

    /// The SEARCH arguments as sent on the wire.
    #[must_use]
    pub fn to_imap(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ProtocolQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native(raw) if raw.is_ascii() => write!(f, "X-GM-RAW {}", quote(raw)),
            Self::Native(raw) => write!(f, "CHARSET UTF-8 X-GM-RAW {}", quote(raw)),
            Self::Fielded(keys) if keys.is_empty() => f.write_str("ALL"),
            Self::Fielded(keys) => {
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{key}")?;
                }
                Ok(())
            }
        }
    }
}

/// Translate a specification for a server with `caps`.
///
/// # Errors
///
/// Returns [`Error::Config`] when a value cannot be expressed, or when
/// only a native query was given and the server cannot run it.
pub fn translate(spec: &SearchSpecification, caps: ServerCapabilities) -> Result<ProtocolQuery> {
    let keys = spec.fielded_keys()?;

    if let Some(native) = spec.native() {
        if caps.native_query {
            check_native(native)?;
            if !keys.is_empty() {
                debug!("Native query takes precedence over {} fielded criteria", keys.len());
            }
            return Ok(ProtocolQuery::Native(native.to_string()));
        }
        if keys.is_empty() {
            return Err(Error::Config(
                "Server does not support native queries and no fielded criteria were given"
                    .into(),
            ));
        }
        warn!("Server does not support native queries; ignoring '{}'", native);
    }

    Ok(ProtocolQuery::Fielded(keys))
}

/// Quote a string for IMAP, escaping `\` and `"`.
fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Whether `value` can be sent as an IMAP quoted string.
pub(crate) fn is_quotable(value: &str) -> bool {
    value.bytes().all(|b| b.is_ascii() && !b.is_ascii_control())
}

fn check_quotable(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::Config(format!("Search criterion '{field}' is empty")));
    }
    if !is_quotable(value) {
        return Err(Error::Config(format!(
            "Search criterion '{field}' must be printable ASCII: '{value}'"
        )));
    }
    Ok(())
}

fn check_native(query: &str) -> Result<()> {
    if query.contains(['\r', '\n', '\0']) {
        return Err(Error::Config(
            "Native query must not contain line breaks or NUL".into(),
        ));
    }
    Ok(())
}
