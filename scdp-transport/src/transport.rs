//! [`SshTransport`]: an authenticated SSH connection to a remote host
//! (§4.1 "SSHTransport").
//!
//! An `ssh2::Session` over a `std::net::TcpStream`, with blocking `ssh2`
//! calls pushed onto `tokio::task::spawn_blocking` and an
//! `Arc<Mutex<Session>>` shared between `exec`, `open_channel`, and the
//! keepalive loop.

use std::net::TcpStream;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use scdp_events::BoundaryError;
use scdp_events::ErrorKind;
use ssh2::Session;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::auth;
use crate::auth::Credential;

/// The default connect timeout (§4.1: 10s).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// The default keepalive interval (§4.1: 5s).
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
/// The default number of missed keepalives before the transport is
/// considered lost (§4.1: 3).
pub const DEFAULT_KEEPALIVE_COUNT: u32 = 3;

/// An error from [`SshTransport`].
#[derive(Debug, Error)]
pub enum Error {
    /// Authentication failed.
    #[error("auth: {0}")]
    Auth(String),
    /// The operation exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),
    /// A generic connection-level failure.
    #[error("connection: {0}")]
    Connection(String),
    /// The transport was not connected.
    #[error("transport/not-connected: {0}")]
    NotConnected(&'static str),
    /// A remote command exited non-zero (carried separately from transport
    /// failure; `exec` itself still returns `Ok` with a nonzero `exit_code`
    /// per POSIX convention — this variant is for when spawning the command
    /// channel itself fails).
    #[error("exec: {0}")]
    Exec(String),
    /// An I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The blocking task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    /// Classifies an [`ssh2::Error`] into this crate's error kinds, per
    /// §4.1 "Failure classification": authentication-related text maps to
    /// `auth`, timeouts to `timeout`, everything else to `connection`. The
    /// original message is preserved as `detail`.
    fn classify(err: ssh2::Error) -> Self {
        let detail = err.message().to_string();
        let lower = detail.to_ascii_lowercase();
        if lower.contains("auth") || lower.contains("publickey") || lower.contains("password") {
            Error::Auth(detail)
        } else if lower.contains("timed out") || lower.contains("timeout") {
            Error::Timeout(detail)
        } else {
            Error::Connection(detail)
        }
    }

    /// Maps this error onto the stable boundary vocabulary (§7).
    pub fn to_boundary(&self) -> BoundaryError {
        let kind = match self {
            Error::Auth(_) => ErrorKind::Auth,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Connection(_) => ErrorKind::Connection,
            Error::NotConnected(_) => ErrorKind::TransportNotConnected,
            Error::Exec(_) => ErrorKind::Exec,
            Error::Io(_) => ErrorKind::Connection,
            Error::Join(_) => ErrorKind::Connection,
        };
        BoundaryError::new(kind, self.to_string())
    }
}

/// A `Result` specialized to [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// The outcome of [`SshTransport::exec`].
#[derive(Clone, Debug, Default)]
pub struct ExecOutput {
    /// Captured standard output.
    pub stdout: Vec<u8>,
    /// Captured standard error.
    pub stderr: Vec<u8>,
    /// The remote process's exit code.
    pub exit_code: i32,
}

impl ExecOutput {
    /// Returns `true` iff the remote command exited zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns `stdout` decoded as lossy UTF-8.
    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Returns `stderr` decoded as lossy UTF-8.
    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// An event emitted by an [`SshTransport`].
#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// The transport finished connecting.
    Ready,
    /// The transport closed (whether by request or due to a lost
    /// connection).
    Close,
    /// An error occurred.
    Error {
        /// The classified boundary error.
        error: BoundaryError,
    },
    /// A keepalive or connect attempt exceeded its deadline.
    Timeout,
}

/// A coarse connection state, mirroring §4.1's
/// `disconnected → connecting → connected` machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Disconnected,
    Connecting,
    Connected,
}

struct Inner {
    state: State,
    session: Option<Arc<Mutex<Session>>>,
    keepalive: Option<JoinHandle<()>>,
}

/// Connection parameters for [`SshTransport::connect`].
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    /// The remote host (hostname or IP address).
    pub host: String,
    /// The remote SSH port.
    pub port: u16,
    /// The SSH username.
    pub username: String,
    /// The authentication credential.
    pub credential: Credential,
    /// The connect timeout.
    pub connect_timeout: Duration,
    /// The keepalive interval.
    pub keepalive_interval: Duration,
    /// The number of missed keepalives before the transport is considered
    /// lost.
    pub keepalive_count: u32,
}

/// An authenticated SSH connection to a remote host (§4.1).
///
/// Events are broadcast to subscribers registered via [`Self::subscribe`].
#[derive(Clone)]
pub struct SshTransport {
    inner: Arc<RwLock<Inner>>,
    events: broadcast::Sender<TransportEvent>,
}

impl std::fmt::Debug for SshTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTransport").finish_non_exhaustive()
    }
}

impl Default for SshTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SshTransport {
    /// Constructs a new, disconnected transport.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            inner: Arc::new(RwLock::new(Inner {
                state: State::Disconnected,
                session: None,
                keepalive: None,
            })),
            events,
        }
    }

    /// Subscribes to this transport's events.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    /// Returns `true` iff the transport is currently connected.
    pub async fn is_connected(&self) -> bool {
        self.inner.read().await.state == State::Connected
    }

    /// Connects to the remote host described by `options`.
    ///
    /// A no-op if already connected (§4.1).
    pub async fn connect(&self, options: ConnectOptions) -> Result<()> {
        {
            let mut inner = self.inner.write().await;
            if inner.state == State::Connected {
                return Ok(());
            }
            inner.state = State::Connecting;
        }

        if let Credential::PrivateKey { path, passphrase } = &options.credential {
            auth::validate_private_key(path, passphrase.as_deref()).map_err(|err| {
                Error::Auth(err.to_string())
            })?;
        }

        let deadline = options.connect_timeout;
        let result = tokio::time::timeout(deadline, self.connect_blocking(options.clone())).await;

        let session = match result {
            Ok(Ok(session)) => session,
            Ok(Err(err)) => {
                self.fail(&err).await;
                return Err(err);
            }
            Err(_) => {
                let err = Error::Timeout(format!("connecting within {deadline:?}"));
                self.fail(&err).await;
                return Err(err);
            }
        };

        let keepalive = self.spawn_keepalive(
            session.clone(),
            options.keepalive_interval,
            options.keepalive_count,
        );

        {
            let mut inner = self.inner.write().await;
            inner.state = State::Connected;
            inner.session = Some(session);
            inner.keepalive = Some(keepalive);
        }

        self.events.send(TransportEvent::Ready).ok();
        Ok(())
    }

    async fn fail(&self, err: &Error) {
        let mut inner = self.inner.write().await;
        inner.state = State::Disconnected;
        inner.session = None;
        drop(inner);
        self.events
            .send(TransportEvent::Error {
                error: err.to_boundary(),
            })
            .ok();
    }

    /// Performs the blocking connect/handshake/auth sequence on a blocking
    /// thread.
    async fn connect_blocking(&self, options: ConnectOptions) -> Result<Arc<Mutex<Session>>> {
        tokio::task::spawn_blocking(move || {
            let addr = format!("{}:{}", options.host, options.port);
            trace!("connecting to SSH host: {addr}");
            let tcp = TcpStream::connect(&addr).map_err(Error::Io)?;

            let mut session = Session::new().map_err(Error::classify)?;
            session.set_tcp_stream(tcp);
            session.handshake().map_err(Error::classify)?;

            authenticate(&mut session, &options.username, &options.credential)?;

            if !session.authenticated() {
                return Err(Error::Auth("authentication was not accepted".into()));
            }

            session.set_blocking(true);
            Ok(Arc::new(Mutex::new(session)))
        })
        .await?
    }

    fn spawn_keepalive(
        &self,
        session: Arc<Mutex<Session>>,
        interval: Duration,
        count: u32,
    ) -> JoinHandle<()> {
        let events = self.events.clone();
        let inner = self.inner.clone();

        tokio::spawn(async move {
            let mut misses = 0u32;
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let session = session.clone();
                let result = tokio::task::spawn_blocking(move || {
                    let session = session.lock().expect("session mutex poisoned");
                    session.keepalive_send()
                })
                .await;

                match result {
                    Ok(Ok(_)) => {
                        misses = 0;
                    }
                    _ => {
                        misses += 1;
                        warn!(misses, count, "missed SSH keepalive");
                        if misses >= count {
                            let mut guard = inner.write().await;
                            guard.state = State::Disconnected;
                            guard.session = None;
                            drop(guard);
                            events
                                .send(TransportEvent::Error {
                                    error: BoundaryError::new(
                                        ErrorKind::Connection,
                                        "keepalive deadline exceeded; transport considered lost",
                                    ),
                                })
                                .ok();
                            events.send(TransportEvent::Close).ok();
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Disconnects the transport. A no-op if not connected (§4.1).
    pub async fn disconnect(&self) {
        let mut inner = self.inner.write().await;
        if inner.state == State::Disconnected {
            return;
        }

        if let Some(handle) = inner.keepalive.take() {
            handle.abort();
        }

        if let Some(session) = inner.session.take() {
            let _ = tokio::task::spawn_blocking(move || {
                if let Ok(session) = session.lock() {
                    let _ = session.disconnect(None, "client disconnect", None);
                }
            })
            .await;
        }

        inner.state = State::Disconnected;
        drop(inner);
        self.events.send(TransportEvent::Close).ok();
    }

    /// Returns the live session handle, or [`Error::NotConnected`] (§4.1:
    /// `exec`/`openChannel` while not connected fail with
    /// `transport/not-connected`).
    pub(crate) async fn session(&self) -> Result<Arc<Mutex<Session>>> {
        let inner = self.inner.read().await;
        if inner.state != State::Connected {
            return Err(Error::NotConnected("transport is not connected"));
        }
        inner
            .session
            .clone()
            .ok_or(Error::NotConnected("transport is not connected"))
    }

    /// Executes `command` on the remote host, waiting up to `timeout`.
    ///
    /// Concurrent `exec` calls on one transport are serialized by the
    /// underlying session (§5 "Shared resources").
    pub async fn exec(&self, command: impl Into<String>, timeout: Duration) -> Result<ExecOutput> {
        let session = self.session().await?;
        let command = command.into();

        let started = Instant::now();
        let result = tokio::time::timeout(timeout, run_exec(session, command)).await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(Error::Timeout(format!(
                "command did not complete within {:?} (waited {:?})",
                timeout,
                started.elapsed()
            ))),
        }
    }

    /// Opens a direct-tcpip channel to `(host, port)`, using `originator` as
    /// the source tuple reported to the SSH peer (§4.2).
    pub async fn open_channel(
        &self,
        host: impl Into<String>,
        port: u16,
        originator: Option<(String, u16)>,
    ) -> Result<crate::channel::SshChannel> {
        let session = self.session().await?;
        let host = host.into();

        let channel = {
            let session = session.clone();
            tokio::task::spawn_blocking(move || {
                let guard = session.lock().expect("session mutex poisoned");
                let (origin_host, origin_port) = originator.unwrap_or_else(|| ("127.0.0.1".into(), 0));
                guard
                    .channel_direct_tcpip(&host, port, Some((origin_host.as_str(), origin_port)))
                    .map_err(Error::classify)
            })
            .await??
        };

        Ok(crate::channel::SshChannel::new(session, channel))
    }

    /// Asks the SSH peer to listen on `port` (on `host`, which most servers
    /// ignore in favor of their own bind address) and returns a blocking
    /// [`ssh2::Listener`] plus the port actually bound, for use by a
    /// [`crate::forward::RemoteForwarder`].
    pub async fn forward_listen(&self, host: &str, port: u16) -> Result<(ssh2::Listener, u16)> {
        let session = self.session().await?;
        let host = host.to_string();

        tokio::task::spawn_blocking(move || {
            let guard = session.lock().expect("session mutex poisoned");
            guard
                .channel_forward_listen(port, Some(&host), None)
                .map_err(Error::classify)
        })
        .await?
    }
}

/// Authenticates `session` as `username` using `credential`.
fn authenticate(session: &mut Session, username: &str, credential: &Credential) -> Result<()> {
    match credential {
        Credential::Password(password) => session
            .userauth_password(username, password)
            .map_err(Error::classify),
        Credential::PrivateKey { path, passphrase } => session
            .userauth_pubkey_file(username, None, path, passphrase.as_deref())
            .map_err(Error::classify),
    }
}

/// Runs a blocking SSH exec and collects its output (grounded on the
/// teacher's `run_ssh_command`).
async fn run_exec(session: Arc<Mutex<Session>>, command: String) -> Result<ExecOutput> {
    tokio::task::spawn_blocking(move || {
        use std::io::Read;

        debug!("running remote command: `{command}`");
        let guard = session.lock().expect("session mutex poisoned");
        let mut channel = guard.channel_session().map_err(Error::classify)?;

        channel.exec(&command).map_err(|err| Error::Exec(err.to_string()))?;

        let mut stdout = Vec::new();
        channel.read_to_end(&mut stdout)?;

        let mut stderr = Vec::new();
        channel.stderr().read_to_end(&mut stderr)?;

        channel.wait_close().map_err(Error::classify)?;
        let exit_code = channel.exit_status().map_err(Error::classify)?;

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
        })
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_auth_failures() {
        let err = Error::Auth("authentication failed".into());
        assert_eq!(err.to_boundary().kind, ErrorKind::Auth);
    }

    #[tokio::test]
    async fn exec_without_connecting_fails_not_connected() {
        let transport = SshTransport::new();
        let err = transport
            .exec("echo hi", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected(_)));
    }

    #[tokio::test]
    async fn open_channel_without_connecting_fails_not_connected() {
        let transport = SshTransport::new();
        let err = transport.open_channel("127.0.0.1", 9222, None).await.unwrap_err();
        assert!(matches!(err, Error::NotConnected(_)));
    }

    #[tokio::test]
    async fn disconnect_when_not_connected_is_a_noop() {
        let transport = SshTransport::new();
        transport.disconnect().await;
        assert!(!transport.is_connected().await);
    }
}
