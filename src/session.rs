//! Folder-scoped mailbox operations
//!
//! [`MailStore`] is the seam between the sync logic and the IMAP
//! protocol: the correlator and orchestrator only ever talk to a store.
//! [`SelectedMailbox`] implements it over a live IMAP session.

use crate::connection::{Access, Connection, command_error, within};
use crate::error::{Error, Result};
use crate::flag::Flag;
use crate::folder::Folder;
use crate::message::{Envelope, MessageHandle};
use crate::query::{ProtocolQuery, ServerCapabilities};
use async_imap::types::Fetch;
use async_trait::async_trait;
use futures::TryStreamExt;
use tracing::{debug, info, warn};

/// Items fetched to build an [`Envelope`].
const ENVELOPE_ITEMS: &str = "(UID RFC822.SIZE BODY.PEEK[HEADER])";

/// A mailbox folder that can be searched and modified.
#[async_trait(?Send)]
pub trait MailStore {
    fn capabilities(&self) -> ServerCapabilities;

    /// UIDs of the messages matching `query`, ascending.
    ///
    /// Native queries on Gmail run against `[Gmail]/All Mail` when it
    /// can be opened, and the store stays there afterwards.
    async fn search(&mut self, query: &ProtocolQuery) -> Result<Vec<MessageHandle>>;

    async fn fetch_envelope(&mut self, handle: MessageHandle) -> Result<Envelope>;

    /// Permanently remove one message.
    ///
    /// Either the message is gone afterwards or an error is returned
    /// and the message is left as it was.
    async fn delete(&mut self, handle: MessageHandle) -> Result<()>;

    /// Add a marker to one message: a label on Gmail, a keyword flag
    /// elsewhere.
    async fn mark(&mut self, handle: MessageHandle, flag: &Flag) -> Result<()>;

    /// End the session without expunging anything. Failures are logged,
    /// not returned.
    async fn close(self);
}

/// An authenticated session with a folder selected.
pub struct SelectedMailbox {
    connection: Connection,
    folder: Folder,
    access: Access,
}

impl SelectedMailbox {
    pub(crate) const fn new(connection: Connection, folder: Folder, access: Access) -> Self {
        Self {
            connection,
            folder,
            access,
        }
    }

    /// The folder actually selected (after any fallback).
    #[must_use]
    pub const fn folder(&self) -> &Folder {
        &self.folder
    }

    #[must_use]
    pub const fn access(&self) -> Access {
        self.access
    }

    /// Move to `[Gmail]/All Mail`, or stay in the current folder if the
    /// server refuses it.
    async fn enter_all_mail(&mut self) -> Result<()> {
        if self.connection.try_select(&Folder::AllMail, self.access).await? {
            info!("Searching {} instead of {}", Folder::AllMail, self.folder);
            self.folder = Folder::AllMail;
            return Ok(());
        }
        debug!("{} not available, searching {}", Folder::AllMail, self.folder);
        if self.connection.try_select(&self.folder, self.access).await? {
            Ok(())
        } else {
            Err(Error::FolderNotFound(format!("{} could not be reopened", self.folder)))
        }
    }

    /// Without UIDPLUS the only way to remove a message is EXPUNGE,
    /// which removes every `\Deleted` message in the folder. Refuse
    /// when anything besides `handle` already carries the flag.
    async fn check_expunge_scope(&mut self, handle: MessageHandle) -> Result<()> {
        let session = &mut self.connection.session;
        let flagged = within(self.connection.timeout, "UID SEARCH", async {
            session
                .uid_search("DELETED")
                .await
                .map_err(|e| command_error("UID SEARCH", &e, Error::Delete))
        })
        .await?;
        let others = flagged.iter().filter(|&&uid| uid != handle.uid()).count();
        if others == 0 {
            return Ok(());
        }
        Err(Error::Delete(format!(
            "UID {} kept: {} other message(s) in {} are already flagged {} and the \
             server has no UIDPLUS, so EXPUNGE would remove them too",
            handle.uid(),
            others,
            self.folder,
            Flag::Deleted
        )))
    }

    async fn store(
        &mut self,
        uid: &str,
        change: &str,
        protocol: fn(String) -> Error,
    ) -> Result<()> {
        let session = &mut self.connection.session;
        within(self.connection.timeout, "UID STORE", async {
            let _updates: Vec<Fetch> = session
                .uid_store(uid, change)
                .await
                .map_err(|e| command_error("UID STORE", &e, protocol))?
                .try_collect()
                .await
                .map_err(|e| command_error("UID STORE", &e, protocol))?;
            Ok(())
        })
        .await
    }

    async fn expunge(&mut self, uid: &str) -> Result<()> {
        let uidplus = self.connection.capabilities.uidplus;
        let session = &mut self.connection.session;
        within(self.connection.timeout, "EXPUNGE", async {
            let expunged: Vec<u32> = if uidplus {
                session
                    .uid_expunge(uid)
                    .await
                    .map_err(|e| command_error("UID EXPUNGE", &e, Error::Delete))?
                    .try_collect()
                    .await
                    .map_err(|e| command_error("UID EXPUNGE", &e, Error::Delete))?
            } else {
                session
                    .expunge()
                    .await
                    .map_err(|e| command_error("EXPUNGE", &e, Error::Delete))?
                    .try_collect()
                    .await
                    .map_err(|e| command_error("EXPUNGE", &e, Error::Delete))?
            };
            debug!("Expunged {} message(s)", expunged.len());
            Ok(())
        })
        .await
    }
}

#[async_trait(?Send)]
impl MailStore for SelectedMailbox {
    fn capabilities(&self) -> ServerCapabilities {
        self.connection.capabilities
    }

    async fn search(&mut self, query: &ProtocolQuery) -> Result<Vec<MessageHandle>> {
        if matches!(query, ProtocolQuery::Native(_))
            && self.connection.capabilities.native_query
            && self.folder != Folder::AllMail
        {
            self.enter_all_mail().await?;
        }

        let criteria = query.to_imap();
        debug!("UID SEARCH {} in {}", criteria, self.folder);
        let session = &mut self.connection.session;
        let uids = within(self.connection.timeout, "UID SEARCH", async {
            session
                .uid_search(&criteria)
                .await
                .map_err(|e| command_error("UID SEARCH", &e, Error::Imap))
        })
        .await?;

        let mut handles: Vec<MessageHandle> = uids.into_iter().map(MessageHandle).collect();
        handles.sort_unstable();
        Ok(handles)
    }

    async fn fetch_envelope(&mut self, handle: MessageHandle) -> Result<Envelope> {
        let uid = handle.uid().to_string();
        let session = &mut self.connection.session;
        let fetches: Vec<Fetch> = within(self.connection.timeout, "UID FETCH", async {
            session
                .uid_fetch(&uid, ENVELOPE_ITEMS)
                .await
                .map_err(|e| command_error("UID FETCH", &e, Error::Fetch))?
                .try_collect()
                .await
                .map_err(|e| command_error("UID FETCH", &e, Error::Fetch))
        })
        .await?;

        let fetch = fetches
            .iter()
            .find(|f| f.uid == Some(handle.uid()))
            .ok_or_else(|| Error::Fetch(format!("UID {uid} not found in {}", self.folder)))?;
        let header = fetch
            .header()
            .ok_or_else(|| Error::Fetch(format!("No header returned for UID {uid}")))?;
        Envelope::from_header_block(header, fetch.size)
    }

    async fn delete(&mut self, handle: MessageHandle) -> Result<()> {
        let uid = handle.uid().to_string();
        if !self.connection.capabilities.uidplus {
            self.check_expunge_scope(handle).await?;
        }
        let deleted = Flag::Deleted;
        self.store(&uid, &format!("+FLAGS.SILENT ({deleted})"), Error::Delete)
            .await?;

        if let Err(e) = self.expunge(&uid).await {
            if e.is_fatal() {
                return Err(e);
            }
            warn!("Expunge of UID {} failed, clearing {} again", uid, deleted);
            if let Err(undo) = self
                .store(&uid, &format!("-FLAGS.SILENT ({deleted})"), Error::Delete)
                .await
            {
                warn!("Could not clear {} on UID {}: {}", deleted, uid, undo);
            }
            return Err(e);
        }
        Ok(())
    }

    async fn mark(&mut self, handle: MessageHandle, flag: &Flag) -> Result<()> {
        let uid = handle.uid().to_string();
        if self.connection.capabilities.native_query {
            let label = format!("+X-GM-LABELS (\"{}\")", flag.as_imap_str());
            match self.store(&uid, &label, Error::Imap).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => debug!("Could not label UID {}, adding a keyword instead: {}", uid, e),
            }
        }
        let change = format!("+FLAGS.SILENT ({flag})");
        self.store(&uid, &change, Error::Imap).await
    }

    async fn close(self) {
        // CLOSE would expunge every \Deleted message in a read-write folder.
        self.connection.logout().await;
    }
}
