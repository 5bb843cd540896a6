//! The top-level, persisted settings object (§6 "Persisted state layout").
//!
//! A few notes on the structure of this module.
//!
//! * [`Settings`] is the JSON document written to `config.json`. It is
//!   considered the source of truth for saved connections and defaults.
//! * Layered, file-based overrides are supported for the default sections
//!   only — connections themselves are exclusively managed through a
//!   [`crate::store::ConfigStore`].

use std::path::Path;
use std::path::PathBuf;

use ::config::Config as ConfigLoader;
use ::config::File;
use ::config::FileFormat;
use serde::Deserialize;
use serde::Serialize;

use crate::connection::ConnectionDescriptor;
use crate::defaults::BrowserDefaults;
use crate::defaults::CdpDefaults;
use crate::defaults::PoolDefaults;
use crate::defaults::PortForwardDefaults;
use crate::defaults::SshDefaults;

/// The file name (sans directory) of the persisted settings document.
pub const FILE_NAME: &str = "config.json";

/// The current on-disk schema version written by this crate.
pub const SCHEMA_VERSION: u32 = 1;

/// The directory, under the user's home directory, where state is persisted
/// (§6: `~/.ssh-command-tool3`).
pub const STATE_DIR_NAME: &str = ".ssh-command-tool3";

/// The top-level persisted settings document (§6 "Persisted state layout":
/// `{version, connections[], lastConnectionId?, browserSettings,
/// portForwardDefaults}`, with the remaining default sections carried
/// alongside in the same camelCase convention).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// The schema version this document was written with.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Saved connection descriptors.
    pub connections: Vec<ConnectionDescriptor>,
    /// The id of the most recently used connection, if any.
    pub last_connection_id: Option<String>,
    /// Default SSH transport settings.
    pub ssh_defaults: SshDefaults,
    /// Default browser launch settings (§6: `browserSettings`).
    #[serde(rename = "browserSettings")]
    pub browser_defaults: BrowserDefaults,
    /// Default port-forward settings.
    pub port_forward_defaults: PortForwardDefaults,
    /// Default CDP and page-adapter settings.
    pub cdp_defaults: CdpDefaults,
    /// Default connection-pool settings.
    pub pool_defaults: PoolDefaults,
}

fn default_version() -> u32 {
    SCHEMA_VERSION
}

impl Settings {
    /// Returns the directory state is persisted under (`~/.ssh-command-tool3`).
    pub fn state_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(STATE_DIR_NAME))
    }

    /// Gets a loader pre-seeded with the default override sources.
    ///
    /// The default sources, applied in order (later overrides earlier):
    ///
    /// * The persisted `config.json` at [`Self::state_dir`], if present.
    /// * `<CWD>/scdp.json`, if present.
    /// * The file pointed to by the `SCDP_CONFIG` environment variable, if set.
    ///
    /// Every source is optional; a missing file is silently skipped rather
    /// than treated as an error, matching the layered-override convention
    /// used throughout this workspace.
    pub fn default_sources() -> ConfigLoader {
        let mut builder = ConfigLoader::builder();

        if let Some(state_dir) = Self::state_dir() {
            builder = builder.add_source(
                File::from(state_dir.join(FILE_NAME))
                    .format(FileFormat::Json)
                    .required(false),
            );
        }

        if let Ok(cwd) = std::env::current_dir() {
            builder = builder.add_source(
                File::from(cwd.join("scdp.json"))
                    .format(FileFormat::Json)
                    .required(false),
            );
        }

        if let Ok(path) = std::env::var("SCDP_CONFIG") {
            builder = builder.add_source(File::new(&path, FileFormat::Json).required(false));
        }

        builder
    }

    /// Loads settings from the default set of sources, falling back to
    /// [`Settings::default`] for any field no source provides.
    pub fn load() -> Result<Self, ::config::ConfigError> {
        Self::default_sources().build()?.try_deserialize()
    }

    /// Loads settings from a specific path, bypassing the default sources.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ::config::ConfigError> {
        ConfigLoader::builder()
            .add_source(File::from(path.as_ref()).format(FileFormat::Json).required(false))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_has_no_connections() {
        let settings = Settings::default();
        assert_eq!(settings.version, 0);
        assert!(settings.connections.is_empty());
        assert!(settings.last_connection_id.is_none());
    }

    #[test]
    fn loading_a_missing_path_yields_defaults() {
        let settings = Settings::load_from("/nonexistent/path/scdp.json").unwrap();
        assert!(settings.connections.is_empty());
    }
}
