//! Sync orchestration
//!
//! One run connects to both mailboxes, searches the source, confirms
//! each candidate in the target and deletes the confirmed ones from the
//! source:
//!
//! ```text
//! Init -> ConnectedSource -> ConnectedTarget -> Queried -> Correlated
//!      -> (DryRunReport | Deleted) -> Done
//! ```
//!
//! Any fatal error moves the run to `Failed`. Fatal errors during
//! connection, search or correlation abort the run before anything is
//! deleted.

use crate::connection::{Access, MailboxEndpoint, connect};
use crate::correlate::{Correlation, confirm};
use crate::credentials::Credential;
use crate::error::{Error, Result, Side};
use crate::flag::Flag;
use crate::folder::Folder;
use crate::message::{Envelope, MessageHandle};
use crate::query::{ProtocolQuery, SearchSpecification, translate};
use crate::session::{MailStore, SelectedMailbox};
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error, info, warn};

/// Stage of a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Init,
    ConnectedSource,
    ConnectedTarget,
    Queried,
    Correlated,
    DryRunReport,
    Deleted,
    Done,
    Failed,
}

/// Whether confirmed messages were actually deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Live,
    DryRun,
    /// Deletion was declined at the approval prompt.
    Declined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// No copy in the target; kept.
    NotFound,
    /// Copy found in the target; not deleted (dry run).
    Confirmed,
    Deleted,
    /// Copy found in the target but the delete failed.
    DeleteFailed,
    /// The message could not be examined.
    Failed,
}

impl MessageStatus {
    /// Whether the target was found to hold a copy.
    #[must_use]
    pub const fn is_confirmed(self) -> bool {
        matches!(self, Self::Confirmed | Self::Deleted | Self::DeleteFailed)
    }
}

/// What happened to one source message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageOutcome {
    pub uid: MessageHandle,
    pub message_id: Option<String>,
    pub sender: Option<String>,
    pub subject: Option<String>,
    pub status: MessageStatus,
    /// The dry-run marker flag was added.
    pub marked: bool,
    pub error: Option<String>,
}

impl MessageOutcome {
    fn new(uid: MessageHandle, envelope: Option<&Envelope>, status: MessageStatus) -> Self {
        Self {
            uid,
            message_id: envelope.and_then(|e| e.message_id.clone()),
            sender: envelope.and_then(|e| e.sender.clone()),
            subject: envelope.and_then(|e| e.subject.clone()),
            status,
            marked: false,
            error: None,
        }
    }

    fn failed(uid: MessageHandle, envelope: Option<&Envelope>, err: &Error) -> Self {
        Self {
            error: Some(err.to_string()),
            ..Self::new(uid, envelope, MessageStatus::Failed)
        }
    }
}

/// Report of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    pub mode: Mode,
    /// The source search as sent to the server.
    pub query: String,
    pub examined: usize,
    pub confirmed: usize,
    pub deleted: usize,
    pub outcomes: Vec<MessageOutcome>,
    /// Set when a fatal error stopped the deletions part-way.
    pub aborted: Option<String>,
}

impl SyncResult {
    /// Messages whose processing recorded an error.
    #[must_use]
    pub fn errors(&self) -> usize {
        self.outcomes.iter().filter(|o| o.error.is_some()).count()
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.aborted.is_none()
    }
}

/// Something worth telling the user about during a run.
#[derive(Debug)]
pub enum SyncEvent<'a> {
    State(RunState),
    Warning(&'a str),
    Candidates(usize),
    Outcome(&'a MessageOutcome),
    Finished(&'a SyncResult),
}

/// Receives progress events from the orchestrator.
pub trait Reporter {
    fn report(&mut self, event: &SyncEvent<'_>);
}

/// Reports events as `tracing` events.
#[derive(Debug, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&mut self, event: &SyncEvent<'_>) {
        match event {
            SyncEvent::State(state) => debug!("Sync state: {:?}", state),
            SyncEvent::Warning(message) => warn!("{}", message),
            SyncEvent::Candidates(0) => {
                info!("No messages match the search criteria; nothing to do");
            }
            SyncEvent::Candidates(n) => info!("Found {} candidate message(s) in source", n),
            SyncEvent::Outcome(outcome) => {
                let subject = outcome.subject.as_deref().unwrap_or("(no subject)");
                match (outcome.status, &outcome.error) {
                    (MessageStatus::NotFound, _) => {
                        info!("UID {}: '{}' not found in target, keeping", outcome.uid.0, subject);
                    }
                    (MessageStatus::Confirmed, _) => {
                        info!("UID {}: '{}' verified in target", outcome.uid.0, subject);
                    }
                    (MessageStatus::Deleted, _) => {
                        info!("UID {}: '{}' deleted from source", outcome.uid.0, subject);
                    }
                    (_, error) => error!(
                        "UID {}: '{}' failed: {}",
                        outcome.uid.0,
                        subject,
                        error.as_deref().unwrap_or("unknown error")
                    ),
                }
            }
            SyncEvent::Finished(result) => info!(
                "Sync finished ({:?}): processed {}, verified {}, deleted {}, errors {}",
                result.mode,
                result.examined,
                result.confirmed,
                result.deleted,
                result.errors()
            ),
        }
    }
}

/// Details shown when asking whether to delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletionRequest {
    pub examined: usize,
    pub confirmed: usize,
    /// The source search matched every message in the folder.
    pub unbounded: bool,
}

/// Gate in front of the destructive step.
pub trait Approval {
    fn approve(&mut self, request: &DeletionRequest) -> bool;
}

/// Approves every deletion.
#[derive(Debug, Default)]
pub struct AutoApprove;

impl Approval for AutoApprove {
    fn approve(&mut self, _request: &DeletionRequest) -> bool {
        true
    }
}

/// Opens the selected mailbox of one side.
#[async_trait(?Send)]
pub trait Connector {
    type Store: MailStore;

    async fn open(&mut self, side: Side, access: Access) -> Result<Self::Store>;
}

/// Endpoint plus the credential to log in with.
#[derive(Debug)]
pub struct Account {
    pub endpoint: MailboxEndpoint,
    pub credential: Credential,
}

/// Connects to real IMAP servers.
#[derive(Debug)]
pub struct ImapConnector {
    source: Account,
    target: Account,
}

impl ImapConnector {
    #[must_use]
    pub const fn new(source: Account, target: Account) -> Self {
        Self { source, target }
    }
}

#[async_trait(?Send)]
impl Connector for ImapConnector {
    type Store = SelectedMailbox;

    async fn open(&mut self, side: Side, access: Access) -> Result<SelectedMailbox> {
        let account = match side {
            Side::Source => &mut self.source,
            Side::Target => &mut self.target,
        };
        let connection = connect(&account.endpoint, &mut account.credential).await?;
        let mut policy = account.endpoint.folder.clone();
        // Archived Gmail messages are only found in All Mail.
        if side == Side::Target && connection.capabilities().native_query {
            policy = policy.preferring(Folder::AllMail);
        }
        let mailbox = connection.select(&policy, access).await?;
        info!(
            "Opened {} mailbox {} on {} ({:?})",
            side,
            mailbox.folder(),
            account.endpoint.server,
            mailbox.access()
        );
        Ok(mailbox)
    }
}

/// Run options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOptions {
    pub dry_run: bool,
    /// Marker added to confirmed messages instead of deleting them.
    /// Gmail gets it as a label, other servers as a keyword flag.
    pub dry_run_marker: Option<Flag>,
}

impl SyncOptions {
    /// How the source folder must be opened for this run.
    #[must_use]
    pub const fn source_access(&self) -> Access {
        if self.dry_run && self.dry_run_marker.is_none() {
            Access::ReadOnly
        } else {
            Access::ReadWrite
        }
    }
}

/// Drives one sync run.
pub struct Orchestrator<'a> {
    reporter: &'a mut dyn Reporter,
    approval: &'a mut dyn Approval,
    state: RunState,
}

impl<'a> Orchestrator<'a> {
    pub fn new(reporter: &'a mut dyn Reporter, approval: &'a mut dyn Approval) -> Self {
        Self {
            reporter,
            approval,
            state: RunState::Init,
        }
    }

    /// The stage reached by the last run.
    #[must_use]
    pub const fn state(&self) -> RunState {
        self.state
    }

    /// Run a sync.
    ///
    /// Both sessions are closed before this returns, on every path.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error, attributed to the side it came
    /// from. Nothing has been deleted when an error is returned.
    pub async fn run<C: Connector>(
        &mut self,
        connector: &mut C,
        spec: &SearchSpecification,
        options: &SyncOptions,
    ) -> Result<SyncResult> {
        self.transition(RunState::Init);
        if let Err(e) = spec.validate() {
            return Err(self.fail(e));
        }

        let mut source = match connector.open(Side::Source, options.source_access()).await {
            Ok(store) => store,
            Err(e) => return Err(self.fail(e.on(Side::Source))),
        };
        self.transition(RunState::ConnectedSource);

        let mut target = match connector.open(Side::Target, Access::ReadOnly).await {
            Ok(store) => store,
            Err(e) => {
                source.close().await;
                return Err(self.fail(e.on(Side::Target)));
            }
        };
        self.transition(RunState::ConnectedTarget);

        let outcome = self.sync(&mut source, &mut target, spec, options).await;
        source.close().await;
        target.close().await;

        match outcome {
            Ok(result) => {
                if result.is_success() {
                    self.transition(RunState::Done);
                } else {
                    self.transition(RunState::Failed);
                }
                self.reporter.report(&SyncEvent::Finished(&result));
                Ok(result)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn sync<S: MailStore, T: MailStore>(
        &mut self,
        source: &mut S,
        target: &mut T,
        spec: &SearchSpecification,
        options: &SyncOptions,
    ) -> Result<SyncResult> {
        let query = translate(spec, source.capabilities()).map_err(|e| e.on(Side::Source))?;
        let unbounded = query.is_match_all();
        if unbounded {
            self.warn(
                "No search criteria given: every message in the source folder is a candidate",
            );
        }

        let (query, handles) = self.search(source, spec, query).await?;
        self.transition(RunState::Queried);
        self.reporter.report(&SyncEvent::Candidates(handles.len()));

        let mut result = SyncResult {
            mode: if options.dry_run { Mode::DryRun } else { Mode::Live },
            query: query.to_imap(),
            examined: handles.len(),
            confirmed: 0,
            deleted: 0,
            outcomes: Vec::with_capacity(handles.len()),
            aborted: None,
        };
        if handles.is_empty() {
            return Ok(result);
        }

        let confirmed = self.correlate(source, target, &handles, &mut result).await?;
        result.confirmed = confirmed.len();
        self.transition(RunState::Correlated);

        if !options.dry_run && !confirmed.is_empty() {
            if unbounded {
                self.warn("About to delete from an unbounded search");
            }
            let request = DeletionRequest {
                examined: result.examined,
                confirmed: result.confirmed,
                unbounded,
            };
            if !self.approval.approve(&request) {
                info!("Deletion declined; treating run as a dry run");
                result.mode = Mode::Declined;
            }
        }

        if result.mode == Mode::Live {
            self.delete(source, &confirmed, &mut result).await;
            self.transition(RunState::Deleted);
        } else {
            if let Some(marker) = &options.dry_run_marker {
                self.mark(source, &confirmed, marker, &mut result).await?;
            }
            self.transition(RunState::DryRunReport);
        }
        Ok(result)
    }

    /// Search the source. A refused native query is retried with the
    /// fielded criteria when there are any.
    async fn search<S: MailStore>(
        &mut self,
        source: &mut S,
        spec: &SearchSpecification,
        query: ProtocolQuery,
    ) -> Result<(ProtocolQuery, Vec<MessageHandle>)> {
        let error = match source.search(&query).await {
            Ok(handles) => return Ok((query, handles)),
            Err(e) => e.on(Side::Source),
        };
        if error.is_fatal() || !matches!(query, ProtocolQuery::Native(_)) {
            return Err(error);
        }
        let keys = spec.fielded_keys()?;
        if keys.is_empty() {
            return Err(error);
        }
        self.warn(&format!("Native search failed ({error}); using the fielded criteria"));
        let fielded = ProtocolQuery::Fielded(keys);
        let handles = source.search(&fielded).await.map_err(|e| e.on(Side::Source))?;
        Ok((fielded, handles))
    }

    /// Look every candidate up in the target. Returns the confirmed
    /// handles with the index of their outcome.
    async fn correlate<S: MailStore, T: MailStore>(
        &mut self,
        source: &mut S,
        target: &mut T,
        handles: &[MessageHandle],
        result: &mut SyncResult,
    ) -> Result<Vec<(MessageHandle, usize)>> {
        let mut confirmed = Vec::new();
        for &handle in handles {
            let envelope = match source.fetch_envelope(handle).await {
                Ok(envelope) => envelope,
                Err(e) if e.is_fatal() => return Err(e.on(Side::Source)),
                Err(e) => {
                    self.record(result, MessageOutcome::failed(handle, None, &e.on(Side::Source)));
                    continue;
                }
            };

            let outcome = match confirm(&envelope, target).await {
                Ok(Correlation::Confirmed(found)) => {
                    debug!("Source UID {} is target UID {}", handle.0, found.0);
                    confirmed.push((handle, result.outcomes.len()));
                    MessageOutcome::new(handle, Some(&envelope), MessageStatus::Confirmed)
                }
                Ok(Correlation::NotFound) => {
                    MessageOutcome::new(handle, Some(&envelope), MessageStatus::NotFound)
                }
                Err(e) if e.is_fatal() => return Err(e.on(Side::Target)),
                Err(e) => MessageOutcome::failed(handle, Some(&envelope), &e.on(Side::Target)),
            };
            self.record(result, outcome);
        }
        Ok(confirmed)
    }

    async fn delete<S: MailStore>(
        &mut self,
        source: &mut S,
        confirmed: &[(MessageHandle, usize)],
        result: &mut SyncResult,
    ) {
        for &(handle, index) in confirmed {
            let deleted = source.delete(handle).await;
            let outcome = &mut result.outcomes[index];
            match deleted {
                Ok(()) => {
                    outcome.status = MessageStatus::Deleted;
                    result.deleted += 1;
                }
                Err(e) => {
                    let fatal = e.is_fatal();
                    outcome.status = MessageStatus::DeleteFailed;
                    outcome.error = Some(e.on(Side::Source).to_string());
                    if fatal {
                        result.aborted = outcome.error.clone();
                    }
                }
            }
            self.reporter.report(&SyncEvent::Outcome(&result.outcomes[index]));
            if result.aborted.is_some() {
                break;
            }
        }
    }

    async fn mark<S: MailStore>(
        &mut self,
        source: &mut S,
        confirmed: &[(MessageHandle, usize)],
        marker: &Flag,
        result: &mut SyncResult,
    ) -> Result<()> {
        for &(handle, index) in confirmed {
            match source.mark(handle, marker).await {
                Ok(()) => result.outcomes[index].marked = true,
                Err(e) if e.is_fatal() => return Err(e.on(Side::Source)),
                Err(e) => {
                    warn!("Could not add {} to UID {}: {}", marker, handle.0, e);
                    result.outcomes[index].error = Some(e.on(Side::Source).to_string());
                }
            }
        }
        Ok(())
    }

    fn record(&mut self, result: &mut SyncResult, outcome: MessageOutcome) {
        self.reporter.report(&SyncEvent::Outcome(&outcome));
        result.outcomes.push(outcome);
    }

    fn warn(&mut self, message: &str) {
        self.reporter.report(&SyncEvent::Warning(message));
    }

    fn transition(&mut self, next: RunState) {
        self.state = next;
        self.reporter.report(&SyncEvent::State(next));
    }

    fn fail(&mut self, e: Error) -> Error {
        self.transition(RunState::Failed);
        error!("Sync aborted: {}", e);
        e
    }
}
