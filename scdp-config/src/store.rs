//! The on-disk connection store (§6 "Persisted state layout").
//!
//! [`JsonFileStore`] is the reference implementation: a single JSON document
//! at `~/.ssh-command-tool3/config.json`, with secrets encrypted at rest
//! using a key derived from a passphrase and a salt file sitting alongside
//! it. [`ConfigStore`] is the trait a GUI or CLI front end programs against,
//! so an alternate backing store (e.g. an OS keychain) can be substituted.

use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use thiserror::Error;

use crate::connection::ConnectionDescriptor;
use crate::secret;
use crate::secret::EncryptionKey;
use crate::settings::Settings;
use crate::settings::FILE_NAME;

/// The file name of the salt used to derive the encryption key.
pub const SALT_FILE_NAME: &str = ".salt";

/// An error reading, writing, or validating the connection store.
#[derive(Debug, Error)]
pub enum Error {
    /// The state directory could not be determined (no home directory).
    #[error("could not determine the state directory (no home directory)")]
    NoStateDir,
    /// An I/O error reading or writing store files.
    #[error("I/O error accessing {path}: {source}")]
    Io {
        /// The path being accessed.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The persisted document was not valid JSON.
    #[error("malformed configuration document: {0}")]
    Malformed(#[from] serde_json::Error),
    /// A secret failed to encrypt or decrypt.
    #[error("secret encryption error: {0}")]
    Secret(#[from] secret::Error),
    /// The descriptor failed validation.
    #[error("invalid connection descriptor: {0}")]
    InvalidDescriptor(#[from] crate::connection::Error),
    /// No connection with the given id exists.
    #[error("no connection with id `{0}`")]
    NotFound(String),
    /// A connection with the given id already exists.
    #[error("a connection with id `{0}` already exists")]
    AlreadyExists(String),
}

/// A store of saved [`ConnectionDescriptor`]s and the defaults sections of
/// [`Settings`] (§6).
///
/// Implementations are responsible for encrypting secrets at rest; callers
/// always see descriptors with their secrets in cleartext.
pub trait ConfigStore {
    /// Loads the current settings, including all saved connections.
    fn load(&self) -> Result<Settings, Error>;

    /// Persists `settings` in full.
    fn save(&self, settings: &Settings) -> Result<(), Error>;

    /// Gets a single connection by id.
    fn get(&self, id: &str) -> Result<ConnectionDescriptor, Error> {
        self.load()?
            .connections
            .into_iter()
            .find(|c| c.id() == id)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Lists all saved connections (with secrets redacted).
    fn list(&self) -> Result<Vec<ConnectionDescriptor>, Error> {
        Ok(self
            .load()?
            .connections
            .into_iter()
            .map(|c| c.redacted())
            .collect())
    }

    /// Adds a new connection. Fails if a connection with the same id already
    /// exists.
    fn add(&self, descriptor: ConnectionDescriptor) -> Result<(), Error> {
        descriptor.validate()?;
        let mut settings = self.load()?;
        if settings.connections.iter().any(|c| c.id() == descriptor.id()) {
            return Err(Error::AlreadyExists(descriptor.id().to_string()));
        }
        settings.connections.push(descriptor);
        self.save(&settings)
    }

    /// Replaces an existing connection in place.
    fn update(&self, descriptor: ConnectionDescriptor) -> Result<(), Error> {
        descriptor.validate()?;
        let mut settings = self.load()?;
        let slot = settings
            .connections
            .iter_mut()
            .find(|c| c.id() == descriptor.id())
            .ok_or_else(|| Error::NotFound(descriptor.id().to_string()))?;
        *slot = descriptor;
        self.save(&settings)
    }

    /// Removes a connection by id.
    fn remove(&self, id: &str) -> Result<(), Error> {
        let mut settings = self.load()?;
        let before = settings.connections.len();
        settings.connections.retain(|c| c.id() != id);
        if settings.connections.len() == before {
            return Err(Error::NotFound(id.to_string()));
        }
        if settings.last_connection_id.as_deref() == Some(id) {
            settings.last_connection_id = None;
        }
        self.save(&settings)
    }

    /// Records the id of the most recently used connection.
    fn set_last_connection_id(&self, id: Option<&str>) -> Result<(), Error> {
        let mut settings = self.load()?;
        settings.last_connection_id = id.map(str::to_string);
        self.save(&settings)
    }
}

/// A [`ConfigStore`] backed by a single encrypted JSON file on disk.
pub struct JsonFileStore {
    dir: PathBuf,
    passphrase: String,
}

impl JsonFileStore {
    /// Opens (without yet reading) the store rooted at [`Settings::state_dir`].
    pub fn open(passphrase: impl Into<String>) -> Result<Self, Error> {
        let dir = Settings::state_dir().ok_or(Error::NoStateDir)?;
        Self::open_in(dir, passphrase)
    }

    /// Opens a store rooted at an explicit directory (primarily for tests).
    pub fn open_in(dir: impl Into<PathBuf>, passphrase: impl Into<String>) -> Result<Self, Error> {
        let dir = dir.into();
        ensure_dir(&dir)?;
        Ok(Self {
            dir,
            passphrase: passphrase.into(),
        })
    }

    fn config_path(&self) -> PathBuf {
        self.dir.join(FILE_NAME)
    }

    fn salt_path(&self) -> PathBuf {
        self.dir.join(SALT_FILE_NAME)
    }

    /// Loads the salt, generating and persisting a new one if absent.
    fn load_or_create_salt(&self) -> Result<[u8; 16], Error> {
        let path = self.salt_path();
        match fs::read(&path) {
            Ok(bytes) if bytes.len() == 16 => {
                let mut salt = [0u8; 16];
                salt.copy_from_slice(&bytes);
                Ok(salt)
            }
            Ok(_) | Err(_) => {
                let salt = EncryptionKey::generate_salt();
                write_restricted(&path, &salt, 0o600)?;
                Ok(salt)
            }
        }
    }

    fn key(&self) -> Result<EncryptionKey, Error> {
        let salt = self.load_or_create_salt()?;
        Ok(EncryptionKey::from_passphrase(&self.passphrase, &salt))
    }
}

impl ConfigStore for JsonFileStore {
    fn load(&self) -> Result<Settings, Error> {
        let path = self.config_path();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(Settings::default());
            }
            Err(err) => {
                return Err(Error::Io {
                    path,
                    source: err,
                });
            }
        };

        let mut settings: Settings = serde_json::from_str(&raw)?;

        let key = self.key()?;
        for descriptor in &mut settings.connections {
            decrypt_secret_in_place(descriptor, &key)?;
        }

        Ok(settings)
    }

    fn save(&self, settings: &Settings) -> Result<(), Error> {
        let mut settings = settings.clone();
        let key = self.key()?;
        for descriptor in &mut settings.connections {
            encrypt_secret_in_place(descriptor, &key);
        }

        let serialized = serde_json::to_string_pretty(&settings)?;
        write_restricted(&self.config_path(), serialized.as_bytes(), 0o600)
    }
}

/// Encrypts a descriptor's secret (and passphrase, if any) in place.
fn encrypt_secret_in_place(descriptor: &mut ConnectionDescriptor, key: &EncryptionKey) {
    descriptor.set_secret(secret::encrypt(descriptor.secret(), key));
    if let Some(passphrase) = descriptor.passphrase() {
        if !secret::is_encrypted(passphrase) {
            descriptor.set_passphrase(Some(secret::encrypt(passphrase, key)));
        }
    }
}

/// Decrypts a descriptor's secret (and passphrase, if any) in place.
///
/// Values that are not recognized as encrypted are left untouched, so a
/// hand-edited plaintext document still loads.
fn decrypt_secret_in_place(descriptor: &mut ConnectionDescriptor, key: &EncryptionKey) -> Result<(), Error> {
    if secret::is_encrypted(descriptor.secret()) {
        descriptor.set_secret(secret::decrypt(descriptor.secret(), key)?);
    }

    if let Some(passphrase) = descriptor.passphrase() {
        if secret::is_encrypted(passphrase) {
            let plain = secret::decrypt(passphrase, key)?;
            descriptor.set_passphrase(Some(plain));
        }
    }

    Ok(())
}

fn ensure_dir(dir: &Path) -> Result<(), Error> {
    fs::create_dir_all(dir).map_err(|source| Error::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    set_mode(dir, 0o700)
}

fn write_restricted(path: &Path, contents: &[u8], mode: u32) -> Result<(), Error> {
    fs::write(path, contents).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    set_mode(path, mode)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), Error> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::AuthKind;

    fn descriptor(id: &str, secret: &str) -> ConnectionDescriptor {
        ConnectionDescriptor::builder()
            .id(id)
            .name(id)
            .host("example.com")
            .username("root")
            .auth_kind(AuthKind::Password)
            .secret(secret)
            .build()
    }

    #[test]
    fn round_trips_a_connection_with_secrets_encrypted_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open_in(dir.path(), "passphrase").unwrap();

        store.add(descriptor("dev", "s3cret")).unwrap();

        let raw = fs::read_to_string(dir.path().join(FILE_NAME)).unwrap();
        assert!(!raw.contains("s3cret"));

        let loaded = store.get("dev").unwrap();
        assert_eq!(loaded.password(), Some("s3cret"));
    }

    #[test]
    fn listing_redacts_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open_in(dir.path(), "passphrase").unwrap();
        store.add(descriptor("dev", "s3cret")).unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed[0].password(), Some(crate::connection::REDACTED_SECRET));
    }

    #[test]
    fn adding_a_duplicate_id_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open_in(dir.path(), "passphrase").unwrap();
        store.add(descriptor("dev", "s3cret")).unwrap();
        assert!(matches!(
            store.add(descriptor("dev", "other")),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn removing_the_last_connection_clears_last_connection_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open_in(dir.path(), "passphrase").unwrap();
        store.add(descriptor("dev", "s3cret")).unwrap();
        store.set_last_connection_id(Some("dev")).unwrap();
        store.remove("dev").unwrap();
        assert!(store.load().unwrap().last_connection_id.is_none());
    }
}
