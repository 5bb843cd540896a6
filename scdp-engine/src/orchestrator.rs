//! [`SessionOrchestrator`]: composes SSH transport, remote browser, local
//! forward, and CDP mux into one atomic session (§4.7).
//!
//! A struct holding the composed resources plus a `broadcast::Sender<Event>`
//! for state/error/close notifications, with an undo-stack-based start so a
//! failure partway through `start` rolls back exactly what succeeded.

use std::time::Duration;

use eyre::WrapErr;
use scdp_config::BrowserDefaults;
use scdp_config::CdpDefaults;
use scdp_config::ConnectionDescriptor;
use scdp_config::PortForwardDefaults;
use scdp_config::SshDefaults;
use scdp_events::BoundaryError;
use scdp_events::BrowserState;
use scdp_events::CdpState;
use scdp_events::ErrorKind;
use scdp_events::PortForwardState;
use scdp_events::SessionEvent;
use scdp_events::SessionState;
use scdp_events::SshState;
use scdp_transport::ConnectOptions;
use scdp_transport::Credential;
use scdp_transport::LocalForwarder;
use scdp_transport::SshTransport;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use tokio::sync::broadcast;
use tracing::debug;
use tracing::warn;

use crate::browser::LaunchOptions;
use crate::browser::RemoteBrowser;
use crate::cdp::mux::CdpMux;
use crate::cdp::mux::resolve_target;
use crate::cdp::network::NetworkRecorder;
use crate::cdp::page::PageAdapter;

/// The capacity of the session-state broadcast channel, mirroring the
/// teacher's `EVENTS_CHANNEL_CAPACITY` idiom.
const STATE_CHANNEL_CAPACITY: usize = 100;

/// An error from [`SessionOrchestrator`].
#[derive(Debug, Error)]
pub enum Error {
    /// A second session was requested while one was already active (or a
    /// start/stop was already in progress).
    #[error("session/already-active")]
    AlreadyActive,
    /// An operation that requires an active session was attempted with
    /// none active.
    #[error("session/not-active")]
    NotActive,
    /// Starting failed partway through; everything started so far has
    /// already been rolled back.
    #[error("session/start-failed: {0}")]
    StartFailed(#[source] eyre::Report),
}

impl Error {
    /// Maps this error onto the stable boundary vocabulary (§7).
    pub fn to_boundary(&self) -> BoundaryError {
        let kind = match self {
            Error::AlreadyActive => ErrorKind::SessionAlreadyActive,
            Error::NotActive => ErrorKind::SessionNotActive,
            Error::StartFailed(_) => ErrorKind::SessionStartFailed,
        };
        BoundaryError::new(kind, self.to_string())
    }
}

/// A `Result` specialized to [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// The overrides a caller may supply on top of the stored defaults
/// (§6 `POST /api/session/start` body).
#[derive(bon::Builder, Clone, Debug, Default)]
pub struct StartOverrides {
    /// Overrides [`BrowserDefaults::headless`].
    pub headless: Option<bool>,
    /// Overrides [`PortForwardDefaults::local_port`].
    pub local_port: Option<u16>,
    /// Overrides [`PortForwardDefaults::remote_port`].
    pub remote_port: Option<u16>,
}

/// Everything needed to start a session.
#[derive(bon::Builder, Clone, Debug)]
pub struct StartOptions {
    /// The connection to dial.
    pub connection: ConnectionDescriptor,
    /// SSH timeout/keepalive defaults.
    pub ssh_defaults: SshDefaults,
    /// Remote browser launch defaults.
    pub browser_defaults: BrowserDefaults,
    /// Local↔remote forward defaults.
    pub port_forward_defaults: PortForwardDefaults,
    /// CDP mux/page defaults.
    pub cdp_defaults: CdpDefaults,
    /// Per-start overrides.
    pub overrides: StartOverrides,
}

/// The resources composed by a running session, built up incrementally
/// during [`SessionOrchestrator::start`] so that a failure partway through
/// can roll back exactly what succeeded.
struct Resources {
    transport: SshTransport,
    browser: RemoteBrowser,
    browser_pid: Option<u32>,
    forwarder: LocalForwarder,
    forward_rule_id: Option<String>,
    cdp: Option<CdpMux>,
    page: Option<std::sync::Arc<PageAdapter>>,
    network: Option<std::sync::Arc<NetworkRecorder>>,
}

/// The concurrency guard described in §4.7 "Concurrency": at most one
/// start or stop in progress at any time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Starting,
    Active,
    Stopping,
}

/// Composes an [`SshTransport`], [`RemoteBrowser`], [`LocalForwarder`],
/// [`CdpMux`], [`PageAdapter`], and [`NetworkRecorder`] into one session,
/// with strict startup ordering, reverse-order teardown, and a broadcast
/// state/event stream (§4.7).
pub struct SessionOrchestrator {
    phase: Mutex<Phase>,
    state: RwLock<SessionState>,
    resources: Mutex<Option<Resources>>,
    events: broadcast::Sender<SessionEvent>,
}

impl std::fmt::Debug for SessionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOrchestrator").finish_non_exhaustive()
    }
}

impl Default for SessionOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionOrchestrator {
    /// Constructs a new, inactive orchestrator.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        Self {
            phase: Mutex::new(Phase::Idle),
            state: RwLock::new(SessionState::INITIAL),
            resources: Mutex::new(None),
            events,
        }
    }

    /// Subscribes to session state changes, errors, and close notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Returns a snapshot of the current session state.
    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    /// Returns `true` iff every axis is at its terminal positive value.
    pub async fn is_ready(&self) -> bool {
        self.state().await.is_ready()
    }

    /// Mutates the session state and broadcasts the resulting tuple
    /// (§4.7 "Broadcast": every axis mutation emits `state:change`).
    async fn set_state(&self, mutate: impl FnOnce(&mut SessionState)) {
        let mut state = self.state.write().await;
        mutate(&mut state);
        let snapshot = *state;
        drop(state);
        self.events.send(SessionEvent::StateChanged { state: snapshot }).ok();
    }

    /// Returns the running session's [`PageAdapter`], if active.
    pub async fn page(&self) -> Option<std::sync::Arc<PageAdapter>> {
        self.resources.lock().await.as_ref().and_then(|r| r.page.clone())
    }

    /// Returns the running session's [`NetworkRecorder`], if active.
    pub async fn network(&self) -> Option<std::sync::Arc<NetworkRecorder>> {
        self.resources.lock().await.as_ref().and_then(|r| r.network.clone())
    }

    /// Returns the id of the active local forward rule, if any.
    pub async fn forward_rule_id(&self) -> Option<String> {
        self.resources.lock().await.as_ref().and_then(|r| r.forward_rule_id.clone())
    }

    /// Starts a session per the strict ordering in §4.7.
    pub async fn start(&self, options: StartOptions) -> Result<()> {
        {
            let mut phase = self.phase.lock().await;
            if *phase != Phase::Idle {
                return Err(Error::AlreadyActive);
            }
            *phase = Phase::Starting;
        }

        match self.try_start(options).await {
            Ok(resources) => {
                *self.resources.lock().await = Some(resources);
                *self.phase.lock().await = Phase::Active;
                Ok(())
            }
            Err(report) => {
                self.set_state(|state| *state = SessionState::INITIAL).await;
                *self.phase.lock().await = Phase::Idle;
                let error = Error::StartFailed(report);
                self.events
                    .send(SessionEvent::Error {
                        error: error.to_boundary(),
                    })
                    .ok();
                Err(error)
            }
        }
    }

    /// Runs the four ordered startup steps, rolling back (in reverse order)
    /// whatever succeeded so far on the first failure.
    async fn try_start(&self, options: StartOptions) -> std::result::Result<Resources, eyre::Report> {
        let StartOptions {
            connection,
            ssh_defaults,
            browser_defaults,
            port_forward_defaults,
            cdp_defaults,
            overrides,
        } = options;

        let local_port = overrides.local_port.unwrap_or(port_forward_defaults.local_port);
        let remote_port = overrides.remote_port.unwrap_or(port_forward_defaults.remote_port);
        let headless = overrides.headless.unwrap_or(browser_defaults.headless);

        // Step 1: SSH transport.
        self.set_state(|state| state.ssh = SshState::Connecting).await;
        let transport = SshTransport::new();
        let credential = credential_from_descriptor(&connection)?;
        let connect_options = ConnectOptions {
            host: connection.host().to_string(),
            port: connection.port(),
            username: connection.username().to_string(),
            credential,
            connect_timeout: connection
                .connect_timeout_secs()
                .map(Duration::from_secs)
                .unwrap_or_else(|| Duration::from_secs(ssh_defaults.connect_timeout_secs)),
            keepalive_interval: Duration::from_secs(ssh_defaults.keepalive_interval_secs),
            keepalive_count: ssh_defaults.keepalive_count,
        };

        if let Err(err) = transport.connect(connect_options).await {
            return Err(eyre::Report::new(err).wrap_err("connecting SSH transport"));
        }
        self.set_state(|state| state.ssh = SshState::Connected).await;

        let mut resources = Resources {
            transport: transport.clone(),
            browser: RemoteBrowser::new(transport.clone()),
            browser_pid: None,
            forwarder: LocalForwarder::new(std::sync::Arc::new(transport.clone())),
            forward_rule_id: None,
            cdp: None,
            page: None,
            network: None,
        };

        // Step 2: remote browser.
        self.set_state(|state| state.browser = BrowserState::Starting).await;
        let launch_options = LaunchOptions::from_defaults(&browser_defaults, remote_port, "127.0.0.1");
        let launch = match resources.browser.launch(launch_options).await {
            Ok(launch) => launch,
            Err(err) => {
                self.teardown(resources).await;
                return Err(eyre::Report::new(err).wrap_err("launching remote browser"));
            }
        };
        resources.browser_pid = Some(launch.pid);

        // Step 3: local forward.
        let forward = resources
            .forwarder
            .start_local(
                port_forward_defaults.local_host.clone(),
                local_port,
                "127.0.0.1",
                remote_port,
            )
            .await;

        let forward = match forward {
            Ok(forward) => forward,
            Err(err) => {
                self.teardown(resources).await;
                return Err(eyre::Report::new(err).wrap_err("starting local port forward"));
            }
        };
        resources.forward_rule_id = Some(forward.id.clone());
        self.set_state(|state| {
            state.port_forward = PortForwardState::Active;
            state.browser = BrowserState::Running;
        })
        .await;

        // Step 4: CDP connect, page adapter, network recorder.
        self.set_state(|state| state.cdp = CdpState::Connecting).await;
        let http_base = format!("http://{}:{}", port_forward_defaults.local_host, forward.local_port);

        let cdp_result = connect_cdp(&http_base, &port_forward_defaults.local_host, &cdp_defaults).await;

        let (cdp, page) = match cdp_result {
            Ok(pair) => pair,
            Err(err) => {
                self.teardown(resources).await;
                return Err(err);
            }
        };

        let network = NetworkRecorder::new(cdp.clone());
        resources.cdp = Some(cdp);
        resources.page = Some(std::sync::Arc::new(page));
        resources.network = Some(std::sync::Arc::new(network));

        self.set_state(|state| state.cdp = CdpState::Connected).await;
        debug!(headless, local_port, remote_port, "session ready");

        Ok(resources)
    }

    /// Stops the session, strict reverse order, swallowing each step's own
    /// errors (§4.7 "Stop").
    pub async fn stop(&self) -> Result<()> {
        {
            let mut phase = self.phase.lock().await;
            if *phase != Phase::Active {
                return Err(Error::NotActive);
            }
            *phase = Phase::Stopping;
        }

        if let Some(resources) = self.resources.lock().await.take() {
            self.teardown(resources).await;
        }

        self.set_state(|state| *state = SessionState::INITIAL).await;
        *self.phase.lock().await = Phase::Idle;
        self.events.send(SessionEvent::Closed).ok();
        Ok(())
    }

    /// CDPMux.disconnect → LocalForwarder.stopAll → RemoteBrowser.cleanup
    /// (kills the known PID if any) → SSHTransport.disconnect. Each step
    /// swallows its own errors.
    async fn teardown(&self, resources: Resources) {
        if let Some(cdp) = &resources.cdp {
            cdp.disconnect().await;
        }

        resources.forwarder.stop_all().await;

        if let Some(pid) = resources.browser_pid {
            if let Err(err) = resources.browser.kill(pid).await {
                warn!(pid, error = %err, "failed to kill remote browser during teardown");
            }
        } else {
            resources.browser.cleanup().await;
        }

        resources.transport.disconnect().await;
    }
}

/// Resolves the CDP target, connects the WebSocket, and runs the page
/// adapter's enable step (§4.7 step 4).
async fn connect_cdp(
    http_base: &str,
    configured_host: &str,
    cdp_defaults: &CdpDefaults,
) -> std::result::Result<(CdpMux, PageAdapter), eyre::Report> {
    let ws_url = resolve_target(http_base, None, configured_host)
        .await
        .wrap_err("resolving CDP target")?;
    let cdp = CdpMux::connect(&ws_url, Duration::from_secs(cdp_defaults.connect_timeout_secs))
        .await
        .wrap_err("connecting CDP WebSocket")?;
    let page = PageAdapter::new(cdp.clone(), cdp_defaults.clone())
        .await
        .wrap_err("enabling page domains")?;
    Ok((cdp, page))
}

/// Converts a persisted connection descriptor into transport-layer
/// authentication material.
fn credential_from_descriptor(connection: &ConnectionDescriptor) -> std::result::Result<Credential, eyre::Report> {
    if let Some(password) = connection.password() {
        return Ok(Credential::Password(password.to_string()));
    }

    if let Some(key_path) = connection.key_path() {
        return Ok(Credential::PrivateKey {
            path: scdp_transport::auth::expand_tilde(key_path),
            passphrase: connection.passphrase().map(str::to_string),
        });
    }

    Err(eyre::eyre!(
        "connection descriptor `{}` carries no usable secret for its auth kind",
        connection.id()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_without_an_active_session_fails_not_active() {
        let orchestrator = SessionOrchestrator::new();
        let err = orchestrator.stop().await.unwrap_err();
        assert!(matches!(err, Error::NotActive));
    }

    #[tokio::test]
    async fn fresh_orchestrator_is_not_ready() {
        let orchestrator = SessionOrchestrator::new();
        assert!(!orchestrator.is_ready().await);
    }

    #[test]
    fn error_kinds_map_to_the_documented_boundary_codes() {
        assert_eq!(Error::AlreadyActive.to_boundary().kind, ErrorKind::SessionAlreadyActive);
        assert_eq!(Error::NotActive.to_boundary().kind, ErrorKind::SessionNotActive);
    }
}
