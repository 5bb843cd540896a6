//! Default timeouts and settings for the components the session orchestrator
//! composes (§4.1, §4.3, §4.4, §4.5, §5).

use bon::Builder;
use serde::Deserialize;
use serde::Serialize;

/// Defaults for [`SSHTransport`](https://docs.rs/scdp-transport) connections.
#[derive(Builder, Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
#[builder(builder_type = Builder)]
pub struct SshDefaults {
    /// The connect timeout, in seconds (§4.1: default 10).
    #[builder(default = 10)]
    pub connect_timeout_secs: u64,
    /// The keepalive interval, in seconds (§4.1: default 5).
    #[builder(default = 5)]
    pub keepalive_interval_secs: u64,
    /// The number of missed keepalives before the transport is considered
    /// lost (§4.1: default 3).
    #[builder(default = 3)]
    pub keepalive_count: u32,
}

impl Default for SshDefaults {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Defaults for launching the remote browser (§4.3).
#[derive(Builder, Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
#[builder(builder_type = Builder)]
pub struct BrowserDefaults {
    /// Whether to pass `--headless=new`.
    #[builder(default = true)]
    pub headless: bool,
    /// An explicit executable path, bypassing auto-detection.
    #[builder(into)]
    pub executable_path: Option<String>,
    /// The remote user-data directory.
    #[builder(into, default = String::from("/tmp/scdp-chrome-profile"))]
    pub user_data_dir: String,
    /// How long to poll `/json/version` before giving up (§4.3: default 10s).
    #[builder(default = 10)]
    pub launch_timeout_secs: u64,
    /// The poll interval while waiting for the browser to come up (§4.3: 200ms).
    #[builder(default = 200)]
    pub launch_poll_interval_ms: u64,
}

impl Default for BrowserDefaults {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Defaults for the local↔remote port forward (§4.2).
#[derive(Builder, Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
#[builder(builder_type = Builder)]
pub struct PortForwardDefaults {
    /// The local host to bind.
    #[builder(into, default = String::from("127.0.0.1"))]
    pub local_host: String,
    /// The local port to bind.
    #[builder(default = 9222)]
    pub local_port: u16,
    /// The remote port the browser's debugger listens on.
    #[builder(default = 9222)]
    pub remote_port: u16,
}

impl Default for PortForwardDefaults {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Defaults for the CDP multiplexer and page adapter (§4.4, §4.5).
#[derive(Builder, Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
#[builder(builder_type = Builder)]
pub struct CdpDefaults {
    /// The CDP WebSocket connect timeout, in seconds (§4.4: default 5).
    #[builder(default = 5)]
    pub connect_timeout_secs: u64,
    /// The default navigation wait timeout, in seconds (§4.5: default 30).
    #[builder(default = 30)]
    pub nav_timeout_secs: u64,
    /// How long the network must be quiet before `networkidle` is satisfied,
    /// in milliseconds (§4.5: 500).
    #[builder(default = 500)]
    pub networkidle_quiet_ms: u64,
    /// The poll interval for `waitForSelector`, in milliseconds (§4.5: 100).
    #[builder(default = 100)]
    pub selector_poll_interval_ms: u64,
}

impl Default for CdpDefaults {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Defaults for the optional [`ConnectionPool`](https://docs.rs/scdp-engine) (§5).
#[derive(Builder, Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
#[builder(builder_type = Builder)]
pub struct PoolDefaults {
    /// The maximum number of concurrently pooled connections (default 10).
    #[builder(default = 10)]
    pub max_connections: usize,
    /// How long an idle connection is kept before being disconnected, in
    /// seconds (default 5 minutes).
    #[builder(default = 300)]
    pub idle_timeout_secs: u64,
    /// The maximum number of automatic reconnect attempts (default 3).
    #[builder(default = 3)]
    pub reconnect_attempts: u32,
    /// The linear backoff unit between reconnect attempts, in seconds
    /// (default 5; attempt `n` waits `reconnect_delay_secs * n`).
    #[builder(default = 5)]
    pub reconnect_delay_secs: u64,
}

impl Default for PoolDefaults {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let ssh = SshDefaults::default();
        assert_eq!(ssh.connect_timeout_secs, 10);
        assert_eq!(ssh.keepalive_interval_secs, 5);
        assert_eq!(ssh.keepalive_count, 3);

        let pool = PoolDefaults::default();
        assert_eq!(pool.max_connections, 10);
        assert_eq!(pool.idle_timeout_secs, 300);
        assert_eq!(pool.reconnect_attempts, 3);
        assert_eq!(pool.reconnect_delay_secs, 5);
    }
}
