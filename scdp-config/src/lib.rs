//! Configuration facilities for the session orchestrator.
//!
//! A few notes on the structure of this crate.
//!
//! * Configuration objects are typically considered immutable from the
//!   perspective of the core orchestrator, and are only mutated through a
//!   [`store::ConfigStore`].
//! * Secrets (passwords, key passphrases) are encrypted at rest by the store,
//!   never by [`connection::ConnectionDescriptor`] itself.

pub mod connection;
pub mod defaults;
pub mod secret;
pub mod settings;
pub mod store;

pub use connection::AuthKind;
pub use connection::ConnectionDescriptor;
pub use defaults::BrowserDefaults;
pub use defaults::CdpDefaults;
pub use defaults::PoolDefaults;
pub use defaults::PortForwardDefaults;
pub use defaults::SshDefaults;
pub use secret::EncryptionKey;
pub use settings::Settings;
pub use store::ConfigStore;
pub use store::JsonFileStore;
