//! [`ConnectionPool`]: a bounded pool of [`SshTransport`]s with idle
//! eviction and linear-backoff reconnect (§4.7 "(NEW) ConnectionPool",
//! §5 "Shared resources").
//!
//! An `Arc<tokio::sync::Semaphore>` gates concurrent connections rather than
//! concurrent task executions, so `acquire` blocks once `max_connections`
//! are already checked out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use scdp_config::PoolDefaults;
use scdp_config::SshDefaults;
use scdp_config::ConnectionDescriptor;
use scdp_transport::ConnectOptions;
use scdp_transport::Credential;
use scdp_transport::SshTransport;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::sync::OwnedSemaphorePermit;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

/// An error acquiring a connection from the pool.
#[derive(Debug, Error)]
pub enum Error {
    /// Every reconnect attempt failed; the last underlying error is
    /// preserved.
    #[error("failed to connect after {attempts} attempt(s): {source}")]
    ReconnectExhausted {
        /// The number of attempts made.
        attempts: u32,
        /// The last underlying transport error.
        #[source]
        source: scdp_transport::Error,
    },
    /// The connection descriptor carries no usable secret.
    #[error("connection descriptor `{0}` carries no usable secret for its auth kind")]
    NoCredential(String),
}

/// A `Result` specialized to [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

struct Entry {
    transport: SshTransport,
    last_used: Instant,
    #[allow(dead_code)]
    permit: OwnedSemaphorePermit,
}

/// Bounds the number of simultaneously connected [`SshTransport`]s,
/// disconnects ones that have been idle too long, and retries failed
/// connects with linear backoff (§5).
pub struct ConnectionPool {
    defaults: PoolDefaults,
    semaphore: Arc<Semaphore>,
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    sweeper: JoinHandle<()>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool").finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Constructs a new pool and starts its idle-sweep background task.
    pub fn new(defaults: PoolDefaults) -> Self {
        let semaphore = Arc::new(Semaphore::new(defaults.max_connections));
        let entries: Arc<Mutex<HashMap<String, Entry>>> = Arc::new(Mutex::new(HashMap::new()));
        let idle_timeout = Duration::from_secs(defaults.idle_timeout_secs);

        let sweeper = spawn_idle_sweeper(entries.clone(), idle_timeout);

        Self {
            defaults,
            semaphore,
            entries,
            sweeper,
        }
    }

    /// Returns a connected [`SshTransport`] for `connection`, reusing a
    /// pooled one if present and connected. Blocks on the pool's semaphore
    /// if `max_connections` are already in use.
    pub async fn acquire(&self, connection: &ConnectionDescriptor, ssh_defaults: &SshDefaults) -> Result<SshTransport> {
        {
            let mut entries = self.entries.lock().await;
            if let Some(entry) = entries.get_mut(connection.id()) {
                if entry.transport.is_connected().await {
                    entry.last_used = Instant::now();
                    return Ok(entry.transport.clone());
                }
                // Stale: drop it (releasing its permit) and fall through to
                // reconnect below.
                entries.remove(connection.id());
            }
        }

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("pool semaphore is never closed");

        let transport = self.connect_with_retry(connection, ssh_defaults).await?;

        self.entries.lock().await.insert(
            connection.id().to_string(),
            Entry {
                transport: transport.clone(),
                last_used: Instant::now(),
                permit,
            },
        );

        Ok(transport)
    }

    /// Connects `connection`, retrying up to `reconnect_attempts` times with
    /// linear backoff `reconnect_delay_secs * attempt` (§5).
    async fn connect_with_retry(&self, connection: &ConnectionDescriptor, ssh_defaults: &SshDefaults) -> Result<SshTransport> {
        let credential = credential_from_descriptor(connection)?;
        let options = ConnectOptions {
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

        let mut last_err = None;
        for attempt in 1..=self.defaults.reconnect_attempts.max(1) {
            let transport = SshTransport::new();
            match transport.connect(options.clone()).await {
                Ok(()) => return Ok(transport),
                Err(err) => {
                    warn!(connection = connection.id(), attempt, error = %err, "pooled connect attempt failed");
                    last_err = Some(err);
                    if attempt < self.defaults.reconnect_attempts {
                        let delay = Duration::from_secs(self.defaults.reconnect_delay_secs * attempt as u64);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(Error::ReconnectExhausted {
            attempts: self.defaults.reconnect_attempts.max(1),
            source: last_err.expect("at least one attempt is always made"),
        })
    }

    /// Disconnects and evicts a specific connection, releasing its permit.
    pub async fn evict(&self, connection_id: &str) {
        if let Some(entry) = self.entries.lock().await.remove(connection_id) {
            entry.transport.disconnect().await;
        }
    }

    /// Disconnects and evicts every pooled connection, and stops the
    /// idle-sweep task.
    pub async fn shutdown(&self) {
        self.sweeper.abort();
        let mut entries = self.entries.lock().await;
        for (_, entry) in entries.drain() {
            entry.transport.disconnect().await;
        }
    }

    /// Returns the number of currently pooled (connected) connections.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Returns `true` iff no connections are currently pooled.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

/// Periodically disconnects and evicts entries that have been idle longer
/// than `idle_timeout` (§5 "per-entry `idleTimeout`").
fn spawn_idle_sweeper(entries: Arc<Mutex<HashMap<String, Entry>>>, idle_timeout: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(idle_timeout.max(Duration::from_secs(1)));
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let expired: Vec<String> = {
                let guard = entries.lock().await;
                guard
                    .iter()
                    .filter(|(_, entry)| entry.last_used.elapsed() >= idle_timeout)
                    .map(|(id, _)| id.clone())
                    .collect()
            };

            for id in expired {
                if let Some(entry) = entries.lock().await.remove(&id) {
                    debug!(connection = %id, "evicting idle pooled connection");
                    entry.transport.disconnect().await;
                }
            }
        }
    })
}

/// Converts a persisted connection descriptor into transport-layer
/// authentication material.
fn credential_from_descriptor(connection: &ConnectionDescriptor) -> Result<Credential> {
    if let Some(password) = connection.password() {
        return Ok(Credential::Password(password.to_string()));
    }

    if let Some(key_path) = connection.key_path() {
        return Ok(Credential::PrivateKey {
            path: scdp_transport::auth::expand_tilde(key_path),
            passphrase: connection.passphrase().map(str::to_string),
        });
    }

    Err(Error::NoCredential(connection.id().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> ConnectionDescriptor {
        ConnectionDescriptor::builder()
            .id("dev")
            .name("dev")
            .host("203.0.113.5")
            .port(22)
            .username("u")
            .auth_kind(scdp_config::AuthKind::Password)
            .secret("s3cret")
            .build()
    }

    #[tokio::test]
    async fn fresh_pool_is_empty() {
        let pool = ConnectionPool::new(PoolDefaults::default());
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn evicting_an_unknown_connection_is_a_noop() {
        let pool = ConnectionPool::new(PoolDefaults::default());
        pool.evict("nonexistent").await;
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn connect_with_retry_gives_up_after_configured_attempts() {
        let mut defaults = PoolDefaults::default();
        defaults.reconnect_attempts = 1;
        defaults.reconnect_delay_secs = 0;
        let pool = ConnectionPool::new(defaults);

        let err = pool.connect_with_retry(&descriptor(), &SshDefaults::default()).await.unwrap_err();
        assert!(matches!(err, Error::ReconnectExhausted { attempts: 1, .. }));
    }

    #[test]
    fn credential_from_descriptor_expands_tilde_key_paths() {
        let descriptor = ConnectionDescriptor::builder()
            .id("dev")
            .name("dev")
            .host("203.0.113.5")
            .port(22)
            .username("u")
            .auth_kind(scdp_config::AuthKind::PrivateKey)
            .secret("~/.ssh/id_rsa")
            .build();

        let credential = credential_from_descriptor(&descriptor).unwrap();
        let Credential::PrivateKey { path, .. } = credential else {
            panic!("expected a private-key credential");
        };

        assert!(!path.starts_with("~"), "path should have been tilde-expanded: {path:?}");
    }
}
