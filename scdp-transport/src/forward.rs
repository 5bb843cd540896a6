//! [`LocalForwarder`] and [`RemoteForwarder`]: SSH-backed TCP port
//! forwarding (§4.2 "LocalForwarder (SSH-backed)").
//!
//! Each rule is a thin owned handle around a background accept loop on a
//! `tokio::net::TcpListener`, with a per-connection pair of blocking copy
//! loops proxying bytes to and from an SSH channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use scdp_events::ForwardEvent;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::transport::SshTransport;

/// An error starting or stopping a forward rule.
#[derive(Debug, Error)]
pub enum Error {
    /// Binding the local listener failed.
    #[error("port-forward: failed to bind {0}: {1}")]
    Bind(String, std::io::Error),
    /// No rule exists with the given id.
    #[error("port-forward: no forward rule with id `{0}`")]
    NotFound(String),
    /// Requesting a remote listen socket failed.
    #[error("port-forward: failed to request remote listen on port {0}: {1}")]
    RemoteListen(u16, String),
}

/// A `Result` specialized to [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// The lifecycle state of a [`ForwardRule`] (§3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForwardState {
    /// No listener is bound.
    Inactive,
    /// The listener is bound and accepting connections.
    Active,
    /// The rule failed to start or was torn down due to an error.
    Error,
}

/// A snapshot of a forward rule's public state (§3 "Forward rule").
#[derive(Clone, Debug)]
pub struct ForwardRule {
    /// The rule's unique id.
    pub id: String,
    /// The bound local address (for a local forward) or listen host (for a
    /// remote forward).
    pub local_addr: String,
    /// The bound local port (for a local forward) or the port the remote
    /// side was asked to listen on (for a remote forward).
    pub local_port: u16,
    /// The destination host the forward connects to.
    pub remote_host: String,
    /// The destination port the forward connects to.
    pub remote_port: u16,
    /// The rule's current state.
    pub state: ForwardState,
    /// The number of currently active connection pairs.
    pub active_conns: usize,
}

/// An id assigned to an in-flight connection pair, for bookkeeping within
/// `active_conns` (§3 "Forward rule": `activeConns: set<ConnPair>`).
type ConnId = u64;

struct RuleHandle {
    descriptor: ForwardRule,
    accept_loop: JoinHandle<()>,
    active_conns: Arc<Mutex<HashMap<ConnId, JoinHandle<()>>>>,
}

/// Accepts local connections and bidirectionally proxies each to a channel
/// opened through an [`SshTransport`] (§4.2).
pub struct LocalForwarder {
    transport: Arc<SshTransport>,
    rules: Arc<Mutex<HashMap<String, RuleHandle>>>,
    events: broadcast::Sender<ForwardEvent>,
    next_rule_id: AtomicU64,
    next_conn_id: AtomicU64,
}

impl LocalForwarder {
    /// Constructs a new forwarder over `transport`.
    pub fn new(transport: Arc<SshTransport>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            transport,
            rules: Arc::new(Mutex::new(HashMap::new())),
            events,
            next_rule_id: AtomicU64::new(1),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Subscribes to per-connection forward failures (§4.2, §7: reported as
    /// events rather than exceptions, so the listener survives).
    pub fn subscribe(&self) -> broadcast::Receiver<ForwardEvent> {
        self.events.subscribe()
    }

    /// Starts a local forward: binds `local_host:local_port` and proxies
    /// each accepted connection to `remote_host:remote_port` through the SSH
    /// transport (§4.2 "Algorithm").
    pub async fn start_local(
        &self,
        local_host: impl Into<String>,
        local_port: u16,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Result<ForwardRule> {
        let local_host = local_host.into();
        let remote_host = remote_host.into();
        let bind_addr = format!("{local_host}:{local_port}");

        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|err| Error::Bind(bind_addr.clone(), err))?;
        let bound_port = listener.local_addr().map(|a| a.port()).unwrap_or(local_port);

        let id = format!("fwd-{}", self.next_rule_id.fetch_add(1, Ordering::Relaxed));
        let active_conns: Arc<Mutex<HashMap<ConnId, JoinHandle<()>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let descriptor = ForwardRule {
            id: id.clone(),
            local_addr: local_host.clone(),
            local_port: bound_port,
            remote_host: remote_host.clone(),
            remote_port,
            state: ForwardState::Active,
            active_conns: 0,
        };

        let accept_loop = self.spawn_accept_loop(
            id.clone(),
            listener,
            remote_host,
            remote_port,
            active_conns.clone(),
        );

        let handle = RuleHandle {
            descriptor: descriptor.clone(),
            accept_loop,
            active_conns,
        };

        self.rules.lock().await.insert(id, handle);
        debug!(rule = %descriptor.id, local = %bind_addr, "local forward started");
        Ok(descriptor)
    }

    fn spawn_accept_loop(
        &self,
        rule_id: String,
        listener: TcpListener,
        remote_host: String,
        remote_port: u16,
        active_conns: Arc<Mutex<HashMap<ConnId, JoinHandle<()>>>>,
    ) -> JoinHandle<()> {
        let transport = self.transport.clone();
        let events = self.events.clone();
        let next_conn_id = Arc::new(AtomicU64::new(1));

        tokio::spawn(async move {
            loop {
                let (socket, peer) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(rule = %rule_id, error = %err, "accept failed; listener continues");
                        continue;
                    }
                };

                let conn_id = next_conn_id.fetch_add(1, Ordering::Relaxed);
                let transport = transport.clone();
                let remote_host = remote_host.clone();
                let rule_id_for_task = rule_id.clone();
                let events = events.clone();
                let active_conns_for_removal = active_conns.clone();

                let task = tokio::spawn(async move {
                    pump_one_connection(
                        transport,
                        socket,
                        peer,
                        remote_host,
                        remote_port,
                        rule_id_for_task,
                        events,
                    )
                    .await;

                    active_conns_for_removal.lock().await.remove(&conn_id);
                });

                active_conns.lock().await.insert(conn_id, task);
            }
        })
    }

    /// Stops a single rule: destroys every active socket pair, closes the
    /// listener, and removes the rule. Idempotent (§4.2 "Stop semantics").
    pub async fn stop(&self, rule_id: &str) -> Result<()> {
        let handle = self.rules.lock().await.remove(rule_id);
        let Some(handle) = handle else {
            return Ok(());
        };

        handle.accept_loop.abort();

        let mut conns = handle.active_conns.lock().await;
        for (_, task) in conns.drain() {
            task.abort();
        }

        debug!(rule = %rule_id, "local forward stopped");
        Ok(())
    }

    /// Stops every rule.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.rules.lock().await.keys().cloned().collect();
        for id in ids {
            let _ = self.stop(&id).await;
        }
    }

    /// Lists the current state of every rule.
    pub async fn list(&self) -> Vec<ForwardRule> {
        let mut out = Vec::new();
        for handle in self.rules.lock().await.values() {
            let mut descriptor = handle.descriptor.clone();
            descriptor.active_conns = handle.active_conns.lock().await.len();
            out.push(descriptor);
        }
        out
    }
}

/// Opens a remote channel and bidirectionally proxies the accepted socket,
/// emitting a [`ForwardEvent::Error`] (rather than propagating) if the
/// channel fails to open (§4.2 "Algorithm").
async fn pump_one_connection(
    transport: Arc<SshTransport>,
    socket: TcpStream,
    peer: SocketAddr,
    remote_host: String,
    remote_port: u16,
    rule_id: String,
    events: broadcast::Sender<ForwardEvent>,
) {
    let originator = Some((peer.ip().to_string(), peer.port()));

    let channel = match transport.open_channel(remote_host, remote_port, originator).await {
        Ok(channel) => channel,
        Err(err) => {
            drop(socket);
            events
                .send(ForwardEvent::Error {
                    rule_id,
                    message: err.to_string(),
                })
                .ok();
            return;
        }
    };

    trace!(rule = %rule_id, peer = %peer, "forward pair established");
    if let Err(err) = channel.pump(socket).await {
        events
            .send(ForwardEvent::Error {
                rule_id,
                message: err.to_string(),
            })
            .ok();
    }
}

/// Requests a remote listen socket and proxies each inbound channel open to
/// a local destination (§4.2 "Remote-forward variant").
///
/// Per §9's Open Question resolution, the naming is deliberately
/// `(remote_listen_host, remote_listen_port, dest_host, dest_port)` rather
/// than mirroring the source's (apparently swapped) `localHost`/`remoteHost`
/// convention for remote forwards.
pub struct RemoteForwarder {
    transport: Arc<SshTransport>,
}

impl RemoteForwarder {
    /// Constructs a new remote forwarder over `transport`.
    pub fn new(transport: Arc<SshTransport>) -> Self {
        Self { transport }
    }

    /// Starts a remote forward: the SSH peer listens on
    /// `remote_listen_host:remote_listen_port`, and every inbound channel
    /// open is proxied to `dest_host:dest_port` on this side.
    pub async fn start_remote_forward(
        &self,
        remote_listen_host: impl Into<String>,
        remote_listen_port: u16,
        dest_host: impl Into<String>,
        dest_port: u16,
    ) -> Result<ForwardRule> {
        let remote_listen_host = remote_listen_host.into();
        let dest_host = dest_host.into();

        let session = self
            .transport
            .session()
            .await
            .map_err(|err| Error::RemoteListen(remote_listen_port, err.to_string()))?;
        let (listener, bound_port) = self
            .transport
            .forward_listen(&remote_listen_host, remote_listen_port)
            .await
            .map_err(|err| Error::RemoteListen(remote_listen_port, err.to_string()))?;

        let id = format!("rfwd-{bound_port}");
        let descriptor = ForwardRule {
            id: id.clone(),
            local_addr: remote_listen_host,
            local_port: bound_port,
            remote_host: dest_host.clone(),
            remote_port: dest_port,
            state: ForwardState::Active,
            active_conns: 0,
        };

        spawn_remote_accept_loop(session, listener, dest_host, dest_port, id);

        Ok(descriptor)
    }
}

/// Drives the blocking `ssh2::Listener::accept` loop for a remote forward:
/// for each inbound channel, dials `dest_host:dest_port` locally and proxies
/// between the two (§4.2 "Remote-forward variant is symmetric but owns no
/// local listener; it ... matches inbound channel opens by destination
/// port").
fn spawn_remote_accept_loop(
    session: Arc<std::sync::Mutex<ssh2::Session>>,
    mut listener: ssh2::Listener,
    dest_host: String,
    dest_port: u16,
    rule_id: String,
) {
    tokio::task::spawn_blocking(move || loop {
        let channel = match listener.accept() {
            Ok(channel) => channel,
            Err(err) => {
                warn!(rule = %rule_id, error = %err, "remote-forward accept failed; listener continues");
                continue;
            }
        };

        let channel = crate::channel::SshChannel::new(session.clone(), channel);
        let dest_host = dest_host.clone();
        let rule_id = rule_id.clone();

        tokio::spawn(async move {
            let dest = format!("{dest_host}:{dest_port}");
            match TcpStream::connect(&dest).await {
                Ok(socket) => {
                    if let Err(err) = channel.pump(socket).await {
                        warn!(rule = %rule_id, error = %err, "remote-forward pump failed");
                    }
                }
                Err(err) => {
                    warn!(rule = %rule_id, dest = %dest, error = %err, "failed to dial remote-forward destination");
                }
            }
        });
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stopping_an_unknown_rule_is_idempotent() {
        let transport = Arc::new(SshTransport::new());
        let forwarder = LocalForwarder::new(transport);
        assert!(forwarder.stop("nonexistent").await.is_ok());
        assert!(forwarder.stop("nonexistent").await.is_ok());
    }

    #[tokio::test]
    async fn list_is_empty_for_a_fresh_forwarder() {
        let transport = Arc::new(SshTransport::new());
        let forwarder = LocalForwarder::new(transport);
        assert!(forwarder.list().await.is_empty());
    }
}
