//! IMAP mailbox pruning
//!
//! Removes messages from a source mailbox once a copy is confirmed to
//! exist in a target mailbox, typically after a migration between
//! providers. Messages are matched across servers by Message-ID, or by
//! sender, subject, minute and size when there is none.
//!
//! ```no_run
//! use mailbox_sync::{AutoApprove, Config, ImapConnector, Orchestrator, TracingReporter};
//! use std::path::Path;
//!
//! # async fn run() -> mailbox_sync::Result<()> {
//! let config = Config::load(Path::new("config.json"))?;
//! let (source, target) = config.accounts()?;
//! let mut connector = ImapConnector::new(source, target);
//!
//! let mut reporter = TracingReporter;
//! let mut approval = AutoApprove;
//! let result = Orchestrator::new(&mut reporter, &mut approval)
//!     .run(
//!         &mut connector,
//!         &config.search_specification()?,
//!         &config.sync_options(true)?,
//!     )
//!     .await?;
//! println!("{} of {} messages confirmed", result.confirmed, result.examined);
//! # Ok(())
//! # }
//! ```

mod config;
mod connection;
mod correlate;
mod credentials;
mod error;
mod flag;
mod folder;
mod message;
mod query;
mod session;
mod sync;
#[cfg(test)]
mod testing;

pub use config::{AuthMethod, Config, MailboxConfig, SearchCriteria};
pub use connection::{Access, Connection, MailboxEndpoint, Security, connect};
pub use correlate::{Correlation, confirm, lookup_query};
pub use credentials::{AuthorizedUser, Credential, TokenSource};
pub use error::{Error, Result, Side};
pub use flag::Flag;
pub use folder::{Fallback, Folder, FolderPolicy, GMAIL_ALL_MAIL, is_gmail_host};
pub use message::{Envelope, Fingerprint, MessageHandle};
pub use query::{
    ProtocolQuery, SearchKey, SearchSpecification, ServerCapabilities, parse_date, translate,
};
pub use session::{MailStore, SelectedMailbox};
pub use sync::{
    Account, Approval, AutoApprove, Connector, DeletionRequest, ImapConnector, MessageOutcome,
    MessageStatus, Mode, Orchestrator, Reporter, RunState, SyncEvent, SyncOptions, SyncResult,
    TracingReporter,
};
