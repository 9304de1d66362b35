//! Message handles, envelopes and fingerprints
//!
//! A [`MessageHandle`] is only meaningful on the session that produced
//! it. To recognise the same message on another server we compare
//! [`Fingerprint`]s derived from the message headers.

use crate::error::{Error, Result};
use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use mailparse::{MailAddr, MailHeaderMap};
use serde::Serialize;

/// Server-assigned UID of a message in the selected folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct MessageHandle(pub u32);

impl MessageHandle {
    #[must_use]
    pub const fn uid(self) -> u32 {
        self.0
    }
}

/// Header fields used to identify a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Envelope {
    /// `Message-ID` without angle brackets.
    pub message_id: Option<String>,
    /// Lower-cased address of the first `From` mailbox.
    pub sender: Option<String>,
    pub subject: Option<String>,
    pub date: Option<DateTime<FixedOffset>>,
    /// `RFC822.SIZE` as reported by the server.
    pub size: Option<u32>,
}

impl Envelope {
    /// Parse the envelope out of a raw RFC 5322 header block.
    ///
    /// Encoded words (RFC 2047) are decoded. Missing or unparseable
    /// headers become `None`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Fetch`] if the header block itself is malformed.
    pub fn from_header_block(raw: &[u8], size: Option<u32>) -> Result<Self> {
        let (headers, _) = mailparse::parse_headers(raw)
            .map_err(|e| Error::Fetch(format!("Unparseable header block: {e}")))?;

        let message_id = headers
            .get_first_value("Message-ID")
            .and_then(|v| normalize_message_id(&v));
        let sender = headers
            .get_first_value("From")
            .and_then(|v| sender_address(&v));
        let subject = headers.get_first_value("Subject");
        let date = headers.get_first_value("Date").and_then(|v| parse_header_date(&v));

        Ok(Self {
            message_id,
            sender,
            subject,
            date,
            size,
        })
    }

    /// The calendar day the message was sent on, in the sender's zone.
    ///
    /// This is what IMAP `SENTON` compares against.
    #[must_use]
    pub fn sent_day(&self) -> Option<NaiveDate> {
        self.date.map(|d| d.date_naive())
    }

    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self)
    }
}

/// Key identifying one logical message across servers.
///
/// The `Message-ID` is used when present. Otherwise a composite of
/// sender, subject, send time truncated to the minute, and size is
/// used. The composite can collide for bulk mail sent within the same
/// minute with identical subject and size (e.g. automated
/// notifications); such messages are indistinguishable here.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Fingerprint {
    MessageId(String),
    Composite {
        sender: Option<String>,
        subject: String,
        /// Minutes since the Unix epoch (UTC).
        minute: Option<i64>,
        size: Option<u32>,
    },
}

impl Fingerprint {
    #[must_use]
    pub fn of(envelope: &Envelope) -> Self {
        if let Some(id) = &envelope.message_id {
            return Self::MessageId(id.clone());
        }
        Self::Composite {
            sender: envelope.sender.clone(),
            subject: envelope
                .subject
                .as_deref()
                .map(collapse_whitespace)
                .unwrap_or_default(),
            minute: envelope.date.map(|d| d.timestamp().div_euclid(60)),
            size: envelope.size,
        }
    }

    /// Whether this fingerprint rests on the `Message-ID` header.
    #[must_use]
    pub const fn is_message_id(&self) -> bool {
        matches!(self, Self::MessageId(_))
    }
}

fn normalize_message_id(raw: &str) -> Option<String> {
    let id = raw.trim().trim_start_matches('<').trim_end_matches('>').trim();
    (!id.is_empty()).then(|| id.to_string())
}

fn sender_address(raw: &str) -> Option<String> {
    let parsed = mailparse::addrparse(raw).ok().and_then(|list| {
        list.iter().find_map(|addr| match addr {
            MailAddr::Single(info) => Some(info.addr.clone()),
            MailAddr::Group(group) => group.addrs.first().map(|info| info.addr.clone()),
        })
    });
    let addr = parsed.unwrap_or_else(|| raw.trim().to_string());
    (!addr.is_empty()).then(|| addr.to_lowercase())
}

fn parse_header_date(raw: &str) -> Option<DateTime<FixedOffset>> {
    let trimmed = raw.trim();
    DateTime::parse_from_rfc2822(trimmed).ok().or_else(|| {
        mailparse::dateparse(trimmed)
            .ok()
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
            .map(|d| d.fixed_offset())
    })
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
