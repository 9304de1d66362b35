//! IMAP connection and TLS setup
//!
//! Opens an authenticated session to one [`MailboxEndpoint`] and
//! selects the folder to work on. Every network step is bounded by the
//! endpoint's timeout.

use crate::credentials::Credential;
use crate::error::{Error, Result};
use crate::folder::{Fallback, Folder, FolderPolicy, is_gmail_host};
use crate::query::ServerCapabilities;
use crate::session::SelectedMailbox;
use async_imap::Session;
use async_imap::types::{Capability, NameAttribute};
use futures::TryStreamExt;
use rustls::RootCertStore;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::ServerName;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, info, warn};

/// A TLS-wrapped IMAP session.
pub type ImapSession = Session<Compat<TlsStream<TcpStream>>>;

const DEFAULT_PORT: u16 = 993;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_GREETING: usize = 4096;

/// How the connection is encrypted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Security {
    /// TLS from the first byte (port 993).
    #[default]
    Tls,
    /// Plain connection upgraded with `STARTTLS` (port 143, local bridges).
    Starttls,
}

/// How a folder is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// `SELECT`: flags can be stored and messages expunged.
    ReadWrite,
    /// `EXAMINE`: the folder cannot be changed through this session.
    ReadOnly,
}

impl Access {
    const fn command(self) -> &'static str {
        match self {
            Self::ReadWrite => "SELECT",
            Self::ReadOnly => "EXAMINE",
        }
    }
}

/// Where and how to reach one mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxEndpoint {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub security: Security,
    /// Skip certificate verification (self-signed local bridges).
    pub accept_invalid_certs: bool,
    pub folder: FolderPolicy,
    pub timeout: Duration,
}

impl MailboxEndpoint {
    /// An endpoint on port 993 with implicit TLS, selecting INBOX.
    #[must_use]
    pub fn new(server: impl Into<String>, username: impl Into<String>) -> Self {
        let server = server.into();
        let folder = FolderPolicy::for_host(&server, Folder::Inbox, true, None);
        Self {
            server,
            port: DEFAULT_PORT,
            username: username.into(),
            security: Security::Tls,
            accept_invalid_certs: false,
            folder,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// An authenticated session with no folder selected yet.
pub struct Connection {
    pub(crate) session: ImapSession,
    pub(crate) capabilities: ServerCapabilities,
    pub(crate) timeout: Duration,
}

/// Open an authenticated session to `endpoint`.
///
/// # Errors
///
/// Returns [`Error::Connection`] for network failures and timeouts,
/// [`Error::Tls`] for handshake failures and [`Error::Auth`] when the
/// server rejects the credentials.
pub async fn connect(
    endpoint: &MailboxEndpoint,
    credential: &mut Credential,
) -> Result<Connection> {
    let addr = format!("{}:{}", endpoint.server, endpoint.port);
    let limit = endpoint.timeout;
    debug!("Connecting to IMAP server at {}", addr);

    let tcp = within(limit, "TCP connect", async {
        TcpStream::connect(&addr)
            .await
            .map_err(|e| Error::Connection(format!("{addr}: {e}")))
    })
    .await?;

    let connector = tls_connector(endpoint.accept_invalid_certs)?;
    let server_name = ServerName::try_from(endpoint.server.clone())
        .map_err(|e| Error::Tls(format!("Invalid server name: {e}")))?;

    let tcp = match endpoint.security {
        Security::Tls => tcp,
        Security::Starttls => {
            let mut tcp = tcp;
            within(limit, "greeting", read_greeting(&mut tcp)).await?;
            let mut client = async_imap::Client::new(tcp.compat());
            within(limit, "STARTTLS", async {
                client
                    .run_command_and_check_ok("STARTTLS", None)
                    .await
                    .map_err(|e| Error::Tls(format!("STARTTLS failed: {e}")))
            })
            .await?;
            client.into_inner().into_inner()
        }
    };

    let mut tls_stream = within(limit, "TLS handshake", async {
        connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| Error::Tls(e.to_string()))
    })
    .await?;
    if endpoint.security == Security::Tls {
        within(limit, "greeting", read_greeting(&mut tls_stream)).await?;
    }

    let client = async_imap::Client::new(tls_stream.compat());
    let mut session = within(
        limit,
        "authentication",
        authenticate(client, &endpoint.username, credential),
    )
    .await?;

    let capabilities = within(limit, "CAPABILITY", async {
        let caps = session
            .capabilities()
            .await
            .map_err(|e| Error::Imap(format!("CAPABILITY failed: {e}")))?;
        let names = caps.iter().filter_map(|cap| match cap {
            Capability::Atom(name) => Some(&**name),
            _ => None,
        });
        Ok(ServerCapabilities::from_names(names))
    })
    .await?;
    let capabilities = ServerCapabilities {
        native_query: capabilities.native_query || is_gmail_host(&endpoint.server),
        ..capabilities
    };

    info!(
        "Connected to {} as {} (native queries: {}, UIDPLUS: {})",
        endpoint.server, endpoint.username, capabilities.native_query, capabilities.uidplus
    );
    Ok(Connection {
        session,
        capabilities,
        timeout: limit,
    })
}

impl Connection {
    #[must_use]
    pub const fn capabilities(&self) -> ServerCapabilities {
        self.capabilities
    }

    /// Open the folder named by `policy`, falling back as it allows.
    ///
    /// The session is logged out when nothing could be opened.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FolderNotFound`] when neither the requested
    /// folder nor the fallback can be opened.
    pub async fn select(
        mut self,
        policy: &FolderPolicy,
        access: Access,
    ) -> Result<SelectedMailbox> {
        if let Some(preferred) = &policy.preferred {
            match self.try_select(preferred, access).await {
                Ok(true) => return Ok(SelectedMailbox::new(self, preferred.clone(), access)),
                Ok(false) => debug!("{} not available, using {}", preferred, policy.requested),
                Err(e) => {
                    self.logout().await;
                    return Err(e);
                }
            }
        }

        match self.try_select(&policy.requested, access).await {
            Ok(true) => return Ok(SelectedMailbox::new(self, policy.requested.clone(), access)),
            Ok(false) => {}
            Err(e) => {
                self.logout().await;
                return Err(e);
            }
        }

        let fallback = match &policy.fallback {
            Fallback::Disabled => None,
            Fallback::Folder(folder) => Some(folder.clone()),
            Fallback::Discover => match self.discover_all_folder().await {
                Ok(found) => found,
                Err(e) => {
                    self.logout().await;
                    return Err(e);
                }
            },
        };

        if let Some(folder) = fallback.filter(|f| *f != policy.requested) {
            warn!(
                "Folder {} is not available, falling back to {}",
                policy.requested, folder
            );
            match self.try_select(&folder, access).await {
                Ok(true) => return Ok(SelectedMailbox::new(self, folder, access)),
                Ok(false) => {
                    self.logout().await;
                    return Err(Error::FolderNotFound(format!(
                        "{} (fallback {} not available either)",
                        policy.requested, folder
                    )));
                }
                Err(e) => {
                    self.logout().await;
                    return Err(e);
                }
            }
        }

        self.logout().await;
        Err(Error::FolderNotFound(policy.requested.to_string()))
    }

    /// `Ok(false)` when the server refused the folder. A refused
    /// SELECT or EXAMINE leaves no folder selected.
    pub(crate) async fn try_select(&mut self, folder: &Folder, access: Access) -> Result<bool> {
        let session = &mut self.session;
        let command = access.command();
        within(self.timeout, command, async {
            let opened = match access {
                Access::ReadWrite => session.select(folder.as_str()).await,
                Access::ReadOnly => session.examine(folder.as_str()).await,
            };
            match opened {
                Ok(mailbox) => {
                    debug!("{} {} ({} messages)", command, folder, mailbox.exists);
                    Ok(true)
                }
                Err(async_imap::error::Error::No(msg) | async_imap::error::Error::Bad(msg)) => {
                    debug!("{} {} refused: {}", command, folder, msg);
                    Ok(false)
                }
                Err(e) => Err(command_error(command, &e, Error::Imap)),
            }
        })
        .await
    }

    /// Ask the server for the folder carrying the `\All` attribute.
    async fn discover_all_folder(&mut self) -> Result<Option<Folder>> {
        let session = &mut self.session;
        within(self.timeout, "LIST", async {
            let names: Vec<_> = session
                .list(Some(""), Some("*"))
                .await
                .map_err(|e| command_error("LIST", &e, Error::Imap))?
                .try_collect()
                .await
                .map_err(|e| command_error("LIST", &e, Error::Imap))?;
            let found = names
                .iter()
                .find(|name| name.attributes().contains(&NameAttribute::All))
                .map(|name| Folder::from(name.name()));
            debug!("Discovered all-messages folder: {:?}", found);
            Ok(found)
        })
        .await
    }

    /// LOGOUT, ignoring failures.
    pub async fn logout(mut self) {
        let result = within(self.timeout, "LOGOUT", async {
            self.session
                .logout()
                .await
                .map_err(|e| Error::Imap(e.to_string()))
        })
        .await;
        if let Err(e) = result {
            debug!("LOGOUT failed: {}", e);
        }
    }
}

/// Run `fut`, failing with [`Error::Connection`] after `limit`.
pub(crate) async fn within<T>(
    limit: Duration,
    what: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(limit, fut).await.map_err(|_| {
        Error::Connection(format!("{what} timed out after {}s", limit.as_secs()))
    })?
}

/// Map an async-imap error: transport failures become
/// [`Error::Connection`], everything else goes through `protocol`.
pub(crate) fn command_error(
    command: &str,
    e: &async_imap::error::Error,
    protocol: fn(String) -> Error,
) -> Error {
    match e {
        async_imap::error::Error::Io(_) | async_imap::error::Error::ConnectionLost => {
            Error::Connection(format!("{command}: {e}"))
        }
        _ => protocol(format!("{command} failed: {e}")),
    }
}

/// Consume the untagged server greeting so the first command starts
/// on a clean stream. Read byte by byte to leave nothing buffered.
async fn read_greeting<S: AsyncRead + Unpin>(stream: &mut S) -> Result<()> {
    let mut line = Vec::new();
    while line.last() != Some(&b'\n') && line.len() < MAX_GREETING {
        let byte = stream
            .read_u8()
            .await
            .map_err(|e| Error::Connection(format!("No server greeting: {e}")))?;
        line.push(byte);
    }
    let greeting = String::from_utf8_lossy(&line);
    let greeting = greeting.trim_end();
    debug!("Server greeting: {}", greeting);
    if greeting.starts_with("* OK") || greeting.starts_with("* PREAUTH") {
        Ok(())
    } else {
        Err(Error::Connection(format!("Server refused connection: {greeting}")))
    }
}

async fn authenticate(
    client: async_imap::Client<Compat<TlsStream<TcpStream>>>,
    username: &str,
    credential: &mut Credential,
) -> Result<ImapSession> {
    let result = match credential {
        Credential::Password(password) => client.login(username, password.as_str()).await,
        Credential::OAuth2(source) => {
            let token = source.valid_token().await?;
            client
                .authenticate("XOAUTH2", XOAuth2::new(username, &token))
                .await
        }
    };
    result.map_err(|(e, _)| match e {
        async_imap::error::Error::Io(_) | async_imap::error::Error::ConnectionLost => {
            Error::Connection(format!("Connection lost during login: {e}"))
        }
        other => Error::Auth(other.to_string()),
    })
}

/// SASL XOAUTH2: a single client response carrying user and token.
///
/// async-imap base64-encodes the response itself. When the server
/// rejects the token it sends an error challenge, answered with an
/// empty response.
struct XOAuth2 {
    response: Option<String>,
}

impl XOAuth2 {
    fn new(user: &str, token: &str) -> Self {
        Self {
            response: Some(format!("user={user}\x01auth=Bearer {token}\x01\x01")),
        }
    }
}

impl async_imap::Authenticator for XOAuth2 {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        self.response.take().unwrap_or_default()
    }
}

fn tls_connector(accept_invalid_certs: bool) -> Result<TlsConnector> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(e.to_string()))?;

    let config = if accept_invalid_certs {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
            .with_no_client_auth()
    } else {
        let roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Certificate verifier that accepts any server certificate but still
/// checks handshake signatures (for local bridges with self-signed
/// certificates).
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
