//! SSH transport and SSH-backed TCP port forwarding (§4.1, §4.2).
//!
//! A few notes on the structure of this crate.
//!
//! * [`SshTransport`] is the single shared authenticated connection; it is
//!   cloned cheaply (it's a handle around `Arc`-wrapped state) and shared by
//!   [`LocalForwarder`], [`RemoteForwarder`], and — indirectly, through the
//!   forwarder — `scdp-engine`'s CDP multiplexer.
//! * Blocking `ssh2` calls never run on the async executor directly; they
//!   are pushed onto `tokio::task::spawn_blocking`.

pub mod auth;
pub mod channel;
pub mod forward;
pub mod transport;

pub use auth::Credential;
pub use channel::SshChannel;
pub use forward::ForwardRule;
pub use forward::ForwardState;
pub use forward::LocalForwarder;
pub use forward::RemoteForwarder;
pub use transport::ConnectOptions;
pub use transport::DEFAULT_CONNECT_TIMEOUT;
pub use transport::DEFAULT_KEEPALIVE_COUNT;
pub use transport::DEFAULT_KEEPALIVE_INTERVAL;
pub use transport::Error;
pub use transport::ExecOutput;
pub use transport::Result;
pub use transport::SshTransport;
pub use transport::TransportEvent;
