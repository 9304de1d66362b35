//! IMAP folder selection
//!
//! A strongly-typed folder name plus the policy deciding what to
//! select when the requested folder is unavailable. The well-known
//! provider "all messages" folder (Gmail's `[Gmail]/All Mail`) has a
//! dedicated variant since it is the usual fallback target.

use std::fmt;

/// Gmail's virtual folder holding every message of the account.
pub const GMAIL_ALL_MAIL: &str = "[Gmail]/All Mail";

/// Host names served by Gmail's IMAP frontend.
const GMAIL_HOSTS: [&str; 2] = ["imap.gmail.com", "imap.googlemail.com"];

/// Whether `host` is one of Gmail's IMAP servers (case-insensitive).
#[must_use]
pub fn is_gmail_host(host: &str) -> bool {
    GMAIL_HOSTS.iter().any(|h| h.eq_ignore_ascii_case(host))
}

/// An IMAP mailbox folder.
///
/// # Examples
///
/// ```
/// use mailbox_sync::Folder;
///
/// assert_eq!(Folder::from("inbox").as_str(), "INBOX");
/// assert_eq!(Folder::from("[Gmail]/All Mail"), Folder::AllMail);
/// assert_eq!(Folder::custom("Receipts").as_str(), "Receipts");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Folder {
    /// The INBOX folder (RFC 3501 required, case-insensitive).
    Inbox,
    /// Gmail's `[Gmail]/All Mail`.
    AllMail,
    /// Any other folder, by its server-side name.
    Custom(String),
}

impl Folder {
    #[must_use]
    pub fn custom(name: impl Into<String>) -> Self {
        Self::Custom(name.into())
    }

    /// The IMAP folder name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Inbox => "INBOX",
            Self::AllMail => GMAIL_ALL_MAIL,
            Self::Custom(name) => name,
        }
    }
}

impl fmt::Display for Folder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Folder {
    fn from(s: &str) -> Self {
        if s.eq_ignore_ascii_case("inbox") {
            Self::Inbox
        } else if s == GMAIL_ALL_MAIL {
            Self::AllMail
        } else {
            Self::Custom(s.to_string())
        }
    }
}

impl From<String> for Folder {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

/// What to select, and what to do when it cannot be selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderPolicy {
    /// Tried before `requested` when set; skipped silently if refused.
    pub preferred: Option<Folder>,
    pub requested: Folder,
    pub fallback: Fallback,
}

/// Fallback behaviour when the requested folder cannot be selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fallback {
    /// Selection failure is fatal.
    Disabled,
    /// Select this folder instead.
    Folder(Folder),
    /// Ask the server (LIST) for the folder flagged `\All`.
    Discover,
}

impl FolderPolicy {
    /// A policy that never falls back.
    #[must_use]
    pub fn strict(folder: impl Into<Folder>) -> Self {
        Self {
            preferred: None,
            requested: folder.into(),
            fallback: Fallback::Disabled,
        }
    }

    /// Try `folder` first, keeping the rest of the policy as it is.
    #[must_use]
    pub fn preferring(self, folder: Folder) -> Self {
        let preferred = (folder != self.requested).then_some(folder);
        Self { preferred, ..self }
    }

    /// Build the policy for an endpoint.
    ///
    /// An explicit fallback folder wins; Gmail hosts fall back to
    /// `[Gmail]/All Mail`; other servers are asked for their `\All`
    /// special-use folder.
    #[must_use]
    pub fn for_host(
        host: &str,
        folder: impl Into<Folder>,
        allow_fallback: bool,
        fallback_folder: Option<&str>,
    ) -> Self {
        let fallback = if !allow_fallback {
            Fallback::Disabled
        } else if let Some(name) = fallback_folder {
            Fallback::Folder(Folder::from(name))
        } else if is_gmail_host(host) {
            Fallback::Folder(Folder::AllMail)
        } else {
            Fallback::Discover
        };
        Self {
            preferred: None,
            requested: folder.into(),
            fallback,
        }
    }
}
