//! The connection descriptor data model (§3 "Connection descriptor").

use bon::Builder;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// The sentinel written in place of a password whenever a connection
/// descriptor is echoed back across a boundary (§6 "Secret handling at the
/// boundary").
pub const REDACTED_SECRET: &str = "********";

/// How a [`ConnectionDescriptor`] authenticates to the remote host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthKind {
    /// Password authentication.
    Password,
    /// Private-key authentication.
    PrivateKey,
}

/// An error constructing or validating a [`ConnectionDescriptor`].
#[derive(Debug, Error)]
pub enum Error {
    /// `auth_kind` was `Password` but no password was set (or vice versa).
    #[error(
        "connection descriptor must carry exactly one secret matching its auth kind: {0}"
    )]
    SecretAuthKindMismatch(&'static str),
    /// A required field was empty.
    #[error("field `{0}` must not be empty")]
    EmptyField(&'static str),
    /// The port was out of the valid range.
    #[error("port must be between 1 and 65535")]
    InvalidPort,
}

/// A stable identity describing how to reach and authenticate to a remote
/// host (§3 "Connection descriptor").
///
/// Invariant: exactly one of `password`/`key_path` is populated, matching
/// `auth_kind`. This invariant is enforced by [`Self::validate`]; it is the
/// caller's responsibility to call it after deserializing from an untrusted
/// source (the config store does this on `add`/`update`).
///
/// This struct is created by an external config store and consumed by the
/// session orchestrator; the core never mutates it.
#[derive(Builder, Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[builder(builder_type = Builder)]
pub struct ConnectionDescriptor {
    /// A stable, unique identifier.
    #[builder(into)]
    id: String,

    /// A user-facing display name.
    #[builder(into)]
    name: String,

    /// The remote host (hostname or IP address).
    #[builder(into)]
    host: String,

    /// The remote SSH port.
    #[builder(default = 22)]
    port: u16,

    /// The SSH username.
    #[builder(into)]
    username: String,

    /// Which kind of authentication `secret` carries.
    auth_kind: AuthKind,

    /// Either a password or a filesystem path to a private key, depending on
    /// `auth_kind`.
    #[builder(into)]
    secret: String,

    /// An optional passphrase for an encrypted private key.
    #[builder(into)]
    passphrase: Option<String>,

    /// A free-form label for organizing saved connections in a GUI list.
    #[builder(into)]
    label: Option<String>,

    /// Free-form tags for organizing saved connections.
    #[builder(default)]
    tags: Vec<String>,

    /// An override for the default SSH connect timeout.
    connect_timeout_secs: Option<u64>,
}

impl ConnectionDescriptor {
    /// Gets the connection id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Gets the display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gets the remote host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Gets the remote SSH port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Gets the SSH username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Gets the auth kind.
    pub fn auth_kind(&self) -> AuthKind {
        self.auth_kind
    }

    /// Gets the password, if `auth_kind` is [`AuthKind::Password`].
    pub fn password(&self) -> Option<&str> {
        matches!(self.auth_kind, AuthKind::Password).then_some(self.secret.as_str())
    }

    /// Gets the private key path, if `auth_kind` is [`AuthKind::PrivateKey`].
    pub fn key_path(&self) -> Option<&str> {
        matches!(self.auth_kind, AuthKind::PrivateKey).then_some(self.secret.as_str())
    }

    /// Gets the key passphrase, if any.
    pub fn passphrase(&self) -> Option<&str> {
        self.passphrase.as_deref()
    }

    /// Gets the connect timeout override, if any.
    pub fn connect_timeout_secs(&self) -> Option<u64> {
        self.connect_timeout_secs
    }

    /// Gets the raw secret (password or key path), whatever its current
    /// encryption state. Used by a [`crate::store::ConfigStore`] to encrypt
    /// or decrypt it in place.
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Overwrites the raw secret in place.
    pub fn set_secret(&mut self, secret: impl Into<String>) {
        self.secret = secret.into();
    }

    /// Overwrites the key passphrase in place.
    pub fn set_passphrase(&mut self, passphrase: Option<String>) {
        self.passphrase = passphrase;
    }

    /// Validates the invariants of a connection descriptor.
    pub fn validate(&self) -> Result<(), Error> {
        if self.id.is_empty() {
            return Err(Error::EmptyField("id"));
        }

        if self.host.is_empty() {
            return Err(Error::EmptyField("host"));
        }

        if self.username.is_empty() {
            return Err(Error::EmptyField("username"));
        }

        if self.port == 0 {
            return Err(Error::InvalidPort);
        }

        if self.secret.is_empty() {
            return Err(Error::SecretAuthKindMismatch(match self.auth_kind {
                AuthKind::Password => "password must be set",
                AuthKind::PrivateKey => "key path must be set",
            }));
        }

        Ok(())
    }

    /// Returns a clone of this descriptor with its secret replaced by the
    /// redaction sentinel, suitable for echoing back across a GUI boundary.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.secret = REDACTED_SECRET.to_string();
        copy.passphrase = copy.passphrase.map(|_| REDACTED_SECRET.to_string());
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ConnectionDescriptor {
        ConnectionDescriptor::builder()
            .id("dev")
            .name("dev")
            .host("h")
            .port(22)
            .username("u")
            .auth_kind(AuthKind::PrivateKey)
            .secret("~/.ssh/id_rsa")
            .build()
    }

    #[test]
    fn validates_a_well_formed_descriptor() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn rejects_empty_host() {
        let mut descriptor = sample();
        descriptor.host = String::new();
        assert!(matches!(descriptor.validate(), Err(Error::EmptyField("host"))));
    }

    #[test]
    fn redaction_never_leaks_the_secret() {
        let descriptor = ConnectionDescriptor::builder()
            .id("dev")
            .name("dev")
            .host("h")
            .username("u")
            .auth_kind(AuthKind::Password)
            .secret("s3cret")
            .build();

        let redacted = descriptor.redacted();
        assert_eq!(redacted.password(), Some(REDACTED_SECRET));
        let json = serde_json::to_string(&redacted).unwrap();
        assert!(!json.contains("s3cret"));
    }
}
