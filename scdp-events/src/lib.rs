//! Definition of the events broadcast by a session orchestrator, plus the
//! stable error-kind vocabulary shared across the boundary between the core
//! and its external collaborators (GUI server, CLI).

use serde::Deserialize;
use serde::Serialize;

/// The stable error codes used at every boundary (session orchestrator,
/// HTTP API, CLI).
///
/// These are intentionally `Display`-stable strings: external callers match
/// on them, so renaming a variant without updating its rendered string would
/// be a breaking change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Authentication failed.
    Auth,
    /// An operation was attempted on a transport that is not connected.
    TransportNotConnected,
    /// A generic connection-level failure.
    Connection,
    /// An operation exceeded its deadline.
    Timeout,
    /// A remote command exited non-zero.
    Exec,
    /// A port-forwarding rule failed to start or was torn down unexpectedly.
    PortForward,
    /// No supported browser binary could be found on the remote host.
    BrowserNotFound,
    /// The browser process failed to launch.
    BrowserLaunchFailed,
    /// The browser did not become reachable before the launch timeout.
    BrowserLaunchTimeout,
    /// The CDP WebSocket transport was closed.
    CdpTransportClosed,
    /// A CDP operation exceeded its deadline.
    CdpTimeout,
    /// Chrome responded to a CDP command with a protocol-level error.
    CdpProtocol,
    /// No suitable CDP target (page) could be found.
    CdpNoTarget,
    /// `Page.navigate` reported a navigation failure.
    PageNavFailed,
    /// A navigation wait-state was not reached before the timeout.
    PageNavTimeout,
    /// `Runtime.evaluate` reported an exception.
    PageEvalFailed,
    /// The on-disk configuration was malformed.
    ConfigInvalid,
    /// Reading or writing the on-disk configuration failed.
    ConfigIo,
    /// A field failed input validation.
    Validation,
    /// Starting a session failed partway through and was rolled back.
    SessionStartFailed,
    /// A second session was requested while one was already active.
    SessionAlreadyActive,
    /// An operation that requires an active session was attempted with none.
    SessionNotActive,
}

impl ErrorKind {
    /// Returns the stable wire string for this error kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::TransportNotConnected => "transport/not-connected",
            Self::Connection => "connection",
            Self::Timeout => "timeout",
            Self::Exec => "exec",
            Self::PortForward => "port-forward",
            Self::BrowserNotFound => "browser/not-found",
            Self::BrowserLaunchFailed => "browser/launch-failed",
            Self::BrowserLaunchTimeout => "browser/launch-timeout",
            Self::CdpTransportClosed => "cdp/transport-closed",
            Self::CdpTimeout => "cdp/timeout",
            Self::CdpProtocol => "cdp/protocol",
            Self::CdpNoTarget => "cdp/no-target",
            Self::PageNavFailed => "page/nav-failed",
            Self::PageNavTimeout => "page/nav-timeout",
            Self::PageEvalFailed => "page/eval-failed",
            Self::ConfigInvalid => "config/invalid",
            Self::ConfigIo => "config/io",
            Self::Validation => "validation",
            Self::SessionStartFailed => "session/start-failed",
            Self::SessionAlreadyActive => "session/already-active",
            Self::SessionNotActive => "session/not-active",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A boundary-facing error: a stable [`ErrorKind`] plus a human-readable
/// detail string (the original underlying message, per §7's propagation
/// policy).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BoundaryError {
    /// The stable error code.
    pub kind: ErrorKind,
    /// The original (unstable) message, preserved for diagnostics.
    pub detail: String,
}

impl BoundaryError {
    /// Constructs a new [`BoundaryError`].
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for BoundaryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

impl std::error::Error for BoundaryError {}

/// The SSH transport axis of a session's state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SshState {
    /// No connection has been established.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// The transport is connected and authenticated.
    Connected,
}

/// The local↔remote port-forward axis of a session's state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PortForwardState {
    /// No listener is bound.
    Inactive,
    /// The listener is bound and accepting connections.
    Active,
}

/// The remote browser process axis of a session's state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BrowserState {
    /// No browser process is known to be running.
    Stopped,
    /// The browser is being launched.
    Starting,
    /// The browser is running and reachable.
    Running,
}

/// The CDP WebSocket axis of a session's state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CdpState {
    /// No WebSocket connection exists.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// The WebSocket is connected.
    Connected,
}

/// The full four-axis state of a session (§3 "Session state").
///
/// Any assignment to any axis emits a [`SessionEvent::StateChanged`] carrying
/// the full tuple — there is no partial-delta contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    /// The SSH transport axis.
    pub ssh: SshState,
    /// The port-forward axis.
    pub port_forward: PortForwardState,
    /// The browser axis.
    pub browser: BrowserState,
    /// The CDP axis.
    pub cdp: CdpState,
}

impl SessionState {
    /// The state every axis starts (and ends, after a clean stop) in.
    pub const INITIAL: Self = Self {
        ssh: SshState::Disconnected,
        port_forward: PortForwardState::Inactive,
        browser: BrowserState::Stopped,
        cdp: CdpState::Disconnected,
    };

    /// A session is "ready" iff every axis is at its terminal positive value.
    pub fn is_ready(&self) -> bool {
        self.ssh == SshState::Connected
            && self.port_forward == PortForwardState::Active
            && self.browser == BrowserState::Running
            && self.cdp == CdpState::Connected
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::INITIAL
    }
}

/// An event broadcast by the session orchestrator.
///
/// Subscribers receive these in emission order (§5 "Ordering guarantees":
/// session state transitions are serialized).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SessionEvent {
    /// An axis of the session's state changed; carries the full tuple.
    StateChanged {
        /// The state immediately after the mutation.
        state: SessionState,
    },
    /// An error occurred.
    Error {
        /// The error that occurred.
        error: BoundaryError,
    },
    /// The session closed, whether normally or due to a forced teardown.
    Closed,
}

/// An event reported by a local-forwarder rule.
///
/// Per-connection failures are reported as events rather than exceptions, so
/// the listener survives (§7 "Propagation policy").
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ForwardEvent {
    /// Opening the remote channel for an accepted connection failed.
    Error {
        /// The id of the forward rule this event is about.
        rule_id: String,
        /// A human-readable description of the failure.
        message: String,
    },
}

/// An event reported by the network recorder.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum NetworkEvent {
    /// A request finished successfully (response received and, where
    /// applicable, its body fetched).
    RequestFinished {
        /// The CDP request id.
        request_id: String,
    },
    /// A request failed at the network layer.
    RequestFailed {
        /// The CDP request id.
        request_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_is_not_ready() {
        assert!(!SessionState::INITIAL.is_ready());
    }

    #[test]
    fn fully_connected_state_is_ready() {
        let state = SessionState {
            ssh: SshState::Connected,
            port_forward: PortForwardState::Active,
            browser: BrowserState::Running,
            cdp: CdpState::Connected,
        };
        assert!(state.is_ready());
    }

    #[test]
    fn error_kind_round_trips_through_json() {
        let err = BoundaryError::new(ErrorKind::CdpTimeout, "waited 5s");
        let json = serde_json::to_string(&err).unwrap();
        let back: BoundaryError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, ErrorKind::CdpTimeout);
        assert_eq!(back.kind.as_str(), "cdp/timeout");
    }
}
