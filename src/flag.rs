//! IMAP message flags
//!
//! Only the flags this crate ever stores: `\Deleted` for removal and
//! keyword flags for the dry-run marker. On Gmail the marker is stored
//! as a label instead.

use crate::error::{Error, Result};
use std::fmt;

/// An IMAP message flag.
///
/// # Examples
///
/// ```
/// use mailbox_sync::Flag;
///
/// assert_eq!(Flag::Deleted.as_imap_str(), "\\Deleted");
///
/// let kw = Flag::keyword("_TO_DELETE").unwrap();
/// assert_eq!(kw.as_imap_str(), "_TO_DELETE");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Flag {
    /// Message is marked for deletion (`\Deleted`).
    Deleted,
    /// A user-defined keyword flag (no `\` prefix).
    Keyword(String),
}

impl Flag {
    /// Build a keyword flag, checking it is a valid IMAP atom.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `name` is empty or contains
    /// characters not allowed in an atom.
    pub fn keyword(name: &str) -> Result<Self> {
        let valid = !name.is_empty()
            && name.bytes().all(|b| {
                b.is_ascii_graphic()
                    && !matches!(b, b'(' | b')' | b'{' | b'%' | b'*' | b'"' | b'\\' | b']')
            });
        if valid {
            Ok(Self::Keyword(name.to_string()))
        } else {
            Err(Error::Config(format!("Invalid keyword flag '{name}'")))
        }
    }

    /// The IMAP wire representation of this flag.
    #[must_use]
    pub fn as_imap_str(&self) -> &str {
        match self {
            Self::Deleted => "\\Deleted",
            Self::Keyword(kw) => kw,
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_imap_str())
    }
}
