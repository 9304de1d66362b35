//! Cross-server message correlation
//!
//! UIDs are local to one server, so a source message is looked up in
//! the target by its headers and the hits are compared by
//! [`Fingerprint`].

use crate::error::Result;
use crate::message::{Envelope, Fingerprint, MessageHandle};
use crate::query::{ProtocolQuery, SearchKey, is_quotable};
use crate::session::MailStore;
use tracing::{debug, warn};

/// Outcome of looking a message up in the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation {
    /// The target holds a message with the same fingerprint.
    Confirmed(MessageHandle),
    NotFound,
}

impl Correlation {
    #[must_use]
    pub const fn is_confirmed(self) -> bool {
        matches!(self, Self::Confirmed(_))
    }
}

/// Search keys narrowing the target down to plausible copies of
/// `envelope`, or `None` when no header can be searched for.
#[must_use]
pub fn lookup_query(envelope: &Envelope) -> Option<ProtocolQuery> {
    if let Some(id) = envelope.message_id.as_deref().filter(|id| is_quotable(id)) {
        return Some(ProtocolQuery::Fielded(vec![SearchKey::Header(
            "Message-ID".into(),
            id.to_string(),
        )]));
    }

    let mut keys = Vec::new();
    if let Some(sender) = envelope.sender.as_deref().filter(|s| is_quotable(s)) {
        keys.push(SearchKey::From(sender.to_string()));
    }
    if let Some(subject) = envelope
        .subject
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty() && is_quotable(s))
    {
        keys.push(SearchKey::Subject(subject.to_string()));
    }
    if let Some(day) = envelope.sent_day() {
        keys.push(SearchKey::SentOn(day));
    }
    (!keys.is_empty()).then_some(ProtocolQuery::Fielded(keys))
}

/// Decide whether `candidate` exists in `target`.
///
/// Target hits whose envelope cannot be fetched are skipped. Duplicates
/// at the target are not distinguished: the first match wins.
///
/// # Errors
///
/// Returns the target's error if the search itself fails, or if
/// fetching a hit fails fatally.
pub async fn confirm<S: MailStore>(
    candidate: &Envelope,
    target: &mut S,
) -> Result<Correlation> {
    let fingerprint = Fingerprint::of(candidate);
    let Some(query) = lookup_query(candidate) else {
        warn!("Message has no searchable headers; cannot verify it");
        return Ok(Correlation::NotFound);
    };

    let hits = target.search(&query).await?;
    debug!("{} target hit(s) for {}", hits.len(), query);

    for hit in hits {
        match target.fetch_envelope(hit).await {
            Ok(envelope) if Fingerprint::of(&envelope) == fingerprint => {
                return Ok(Correlation::Confirmed(hit));
            }
            Ok(_) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!("Skipping target UID {}: {}", hit.uid(), e),
        }
    }
    Ok(Correlation::NotFound)
}
