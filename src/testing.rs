//! In-memory [`MailStore`] for unit tests

use crate::error::{Error, Result};
use crate::flag::Flag;
use crate::message::{Envelope, MessageHandle};
use crate::query::{ProtocolQuery, SearchKey, ServerCapabilities};
use crate::session::MailStore;
use async_trait::async_trait;
use chrono::DateTime;
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub uid: u32,
    pub envelope: Envelope,
    pub recipient: Option<String>,
    pub body: String,
    pub flags: Vec<Flag>,
}

impl StoredMessage {
    /// A message with every envelope field set. `date` is RFC 3339.
    pub fn new(
        uid: u32,
        sender: &str,
        subject: &str,
        date: &str,
        message_id: Option<&str>,
    ) -> Self {
        Self {
            uid,
            envelope: Envelope {
                message_id: message_id.map(String::from),
                sender: Some(sender.to_lowercase()),
                subject: Some(subject.to_string()),
                date: Some(DateTime::parse_from_rfc3339(date).unwrap()),
                size: Some(1000 + uid),
            },
            recipient: Some("me@example.com".into()),
            body: format!("Body of {subject}"),
            flags: Vec::new(),
        }
    }

    pub fn with_size(mut self, size: u32) -> Self {
        self.envelope.size = Some(size);
        self
    }

    fn matches(&self, key: &SearchKey) -> bool {
        let env = &self.envelope;
        let contains = |field: Option<&str>, needle: &str| {
            field.is_some_and(|f| f.to_lowercase().contains(&needle.to_lowercase()))
        };
        let day = env.sent_day();
        match key {
            SearchKey::From(v) => contains(env.sender.as_deref(), v),
            SearchKey::To(v) => contains(self.recipient.as_deref(), v),
            SearchKey::Subject(v) => contains(env.subject.as_deref(), v),
            SearchKey::Body(v) => contains(Some(&self.body), v),
            SearchKey::Since(d) => day.is_some_and(|day| day >= *d),
            SearchKey::Before(d) => day.is_some_and(|day| day < *d),
            SearchKey::SentOn(d) => day == Some(*d),
            SearchKey::Header(name, v) if name.eq_ignore_ascii_case("Message-ID") => {
                contains(env.message_id.as_deref(), v)
            }
            SearchKey::Header(..) => false,
        }
    }

    /// Tiny subset of Gmail's search language: `subject:`, `from:`,
    /// anything else matches subject or body.
    fn matches_native(&self, query: &str) -> bool {
        query.split_whitespace().all(|term| {
            if let Some(v) = term.strip_prefix("subject:") {
                self.matches(&SearchKey::Subject(v.into()))
            } else if let Some(v) = term.strip_prefix("from:") {
                self.matches(&SearchKey::From(v.into()))
            } else {
                self.matches(&SearchKey::Subject(term.into()))
                    || self.matches(&SearchKey::Body(term.into()))
            }
        })
    }
}

#[derive(Debug, Default)]
pub struct MemoryState {
    pub messages: Vec<StoredMessage>,
    pub capabilities: ServerCapabilities,
    pub fail_fetch: HashSet<u32>,
    pub fail_delete: HashSet<u32>,
    /// Deletes in `fail_delete` fail as if the connection dropped.
    pub fatal_delete: bool,
    /// Error every search returns, if set.
    pub fail_search: Option<fn(String) -> Error>,
    /// Native queries are refused with [`Error::Imap`].
    pub refuse_native: bool,
    /// Searches issued, rendered as IMAP.
    pub searches: Vec<String>,
    pub closed: bool,
}

impl MemoryState {
    pub fn uids(&self) -> Vec<u32> {
        self.messages.iter().map(|m| m.uid).collect()
    }

    pub fn flagged(&self, flag: &Flag) -> Vec<u32> {
        self.messages
            .iter()
            .filter(|m| m.flags.contains(flag))
            .map(|m| m.uid)
            .collect()
    }
}

/// Cloneable handle; clones share the same state so tests can inspect
/// a store after it has been consumed.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    pub state: Rc<RefCell<MemoryState>>,
}

impl MemoryStore {
    pub fn with_messages(messages: Vec<StoredMessage>) -> Self {
        let store = Self::default();
        store.state.borrow_mut().messages = messages;
        store
    }

    pub fn native(self) -> Self {
        self.state.borrow_mut().capabilities.native_query = true;
        self
    }

    pub fn state(&self) -> std::cell::Ref<'_, MemoryState> {
        self.state.borrow()
    }

    pub fn state_mut(&self) -> std::cell::RefMut<'_, MemoryState> {
        self.state.borrow_mut()
    }
}

#[async_trait(?Send)]
impl MailStore for MemoryStore {
    fn capabilities(&self) -> ServerCapabilities {
        self.state.borrow().capabilities
    }

    async fn search(&mut self, query: &ProtocolQuery) -> Result<Vec<MessageHandle>> {
        let mut state = self.state.borrow_mut();
        state.searches.push(query.to_imap());
        if let Some(fail) = state.fail_search {
            return Err(fail("search refused".into()));
        }
        if state.refuse_native && matches!(query, ProtocolQuery::Native(_)) {
            return Err(Error::Imap("X-GM-RAW not supported".into()));
        }
        Ok(state
            .messages
            .iter()
            .filter(|m| match query {
                ProtocolQuery::Native(q) => m.matches_native(q),
                ProtocolQuery::Fielded(keys) => keys.iter().all(|k| m.matches(k)),
            })
            .map(|m| MessageHandle(m.uid))
            .collect())
    }

    async fn fetch_envelope(&mut self, handle: MessageHandle) -> Result<Envelope> {
        let state = self.state.borrow();
        if state.fail_fetch.contains(&handle.uid()) {
            return Err(Error::Fetch(format!("UID {} unreadable", handle.uid())));
        }
        state
            .messages
            .iter()
            .find(|m| m.uid == handle.uid())
            .map(|m| m.envelope.clone())
            .ok_or_else(|| Error::Fetch(format!("UID {} not found", handle.uid())))
    }

    async fn delete(&mut self, handle: MessageHandle) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.fail_delete.contains(&handle.uid()) {
            let fail = if state.fatal_delete { Error::Connection } else { Error::Delete };
            return Err(fail(format!("UID {} is locked", handle.uid())));
        }
        let before = state.messages.len();
        state.messages.retain(|m| m.uid != handle.uid());
        if state.messages.len() == before {
            return Err(Error::Delete(format!("UID {} not found", handle.uid())));
        }
        Ok(())
    }

    async fn mark(&mut self, handle: MessageHandle, flag: &Flag) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let message = state
            .messages
            .iter_mut()
            .find(|m| m.uid == handle.uid())
            .ok_or_else(|| Error::Imap(format!("UID {} not found", handle.uid())))?;
        if !message.flags.contains(flag) {
            message.flags.push(flag.clone());
        }
        Ok(())
    }

    async fn close(self) {
        self.state.borrow_mut().closed = true;
    }
}
