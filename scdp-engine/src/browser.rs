//! [`RemoteBrowser`]: detect, launch, and reap a headless Chromium-family
//! browser on the remote host (§4.3 "RemoteBrowser").
//!
//! Every step of the detect/kill/spawn/poll sequence is issued as an
//! [`SshTransport::exec`] call: the remote host has no agent of its own, so
//! detection, launch, and health polling all go through the same shell.

use std::time::Duration;

use scdp_config::BrowserDefaults;
use scdp_transport::SshTransport;
use thiserror::Error;
use tracing::debug;
use tracing::trace;
use tracing::warn;

/// The candidate Chromium-family binaries to probe for, per OS (§4.3
/// "Launch sequence" step 1).
const LINUX_CANDIDATES: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
    "/snap/bin/chromium",
];

const DARWIN_CANDIDATES: &[&str] = &[
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
];

/// An error from [`RemoteBrowser`].
#[derive(Debug, Error)]
pub enum Error {
    /// No supported browser binary could be found on the remote host.
    #[error("browser/not-found: no Chromium-family binary found on the remote host")]
    NotFound,
    /// The browser failed to launch.
    #[error("browser/launch-failed: {0}")]
    LaunchFailed(String),
    /// The browser did not become reachable before the launch timeout.
    #[error("browser/launch-timeout: no response from /json/version within {0:?}")]
    LaunchTimeout(Duration),
    /// The underlying transport failed.
    #[error(transparent)]
    Transport(#[from] scdp_transport::Error),
}

/// A `Result` specialized to [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// The outcome of [`RemoteBrowser::launch`].
#[derive(Clone, Debug)]
pub struct LaunchInfo {
    /// The remote process id of the spawned browser.
    pub pid: u32,
    /// The remote debug URL (`http://<bind-addr>:<port>`).
    pub debug_url: String,
    /// The `Browser` field from `/json/version`.
    pub version: String,
}

/// A running remote process discovered by [`RemoteBrowser::find_running`].
#[derive(Clone, Debug)]
pub struct RunningInfo {
    /// The process id.
    pub pid: u32,
    /// The full command line, as reported by `ps`.
    pub command: String,
}

/// Launch options for [`RemoteBrowser::launch`].
#[derive(Clone, Debug)]
pub struct LaunchOptions {
    /// An explicit executable path, bypassing auto-detection.
    pub executable_path: Option<String>,
    /// The debug port to bind (and to kill stragglers on).
    pub debug_port: u16,
    /// The address to bind the debugger to.
    pub debug_address: String,
    /// The remote user-data directory.
    pub user_data_dir: String,
    /// Whether to pass `--headless=new`.
    pub headless: bool,
    /// How long to poll `/json/version` before giving up.
    pub launch_timeout: Duration,
    /// The poll interval while waiting for the browser to come up.
    pub poll_interval: Duration,
}

impl LaunchOptions {
    /// Builds launch options from [`BrowserDefaults`] plus a chosen debug
    /// port/address.
    pub fn from_defaults(defaults: &BrowserDefaults, debug_port: u16, debug_address: impl Into<String>) -> Self {
        Self {
            executable_path: defaults.executable_path.clone(),
            debug_port,
            debug_address: debug_address.into(),
            user_data_dir: defaults.user_data_dir.clone(),
            headless: defaults.headless,
            launch_timeout: Duration::from_secs(defaults.launch_timeout_secs),
            poll_interval: Duration::from_millis(defaults.launch_poll_interval_ms),
        }
    }
}

/// Detects, launches, and reaps a headless browser on a remote host reached
/// through an [`SshTransport`] (§4.3).
pub struct RemoteBrowser {
    transport: SshTransport,
}

impl RemoteBrowser {
    /// Constructs a new [`RemoteBrowser`] over `transport`.
    pub fn new(transport: SshTransport) -> Self {
        Self { transport }
    }

    /// Detects the path to a Chromium-family binary on the remote host
    /// (§4.3 "Launch sequence" step 1).
    pub async fn detect_path(&self) -> Result<String> {
        let uname = self
            .transport
            .exec("uname -s", Duration::from_secs(5))
            .await?;
        let os = uname.stdout_string();
        let candidates: &[&str] = if os.trim() == "Darwin" {
            DARWIN_CANDIDATES
        } else {
            LINUX_CANDIDATES
        };

        for candidate in candidates {
            let check = self
                .transport
                .exec(format!("test -x '{candidate}'"), Duration::from_secs(5))
                .await?;
            if check.success() {
                return Ok((*candidate).to_string());
            }
        }

        let which = self
            .transport
            .exec(
                "which google-chrome chromium chromium-browser 2>/dev/null | head -n1",
                Duration::from_secs(5),
            )
            .await?;
        let found = which.stdout_string();
        let found = found.trim();
        if which.success() && !found.is_empty() {
            return Ok(found.to_string());
        }

        Err(Error::NotFound)
    }

    /// Launches a headless browser per `opts`, waiting until it is
    /// reachable (§4.3 "Launch sequence").
    pub async fn launch(&self, opts: LaunchOptions) -> Result<LaunchInfo> {
        let executable = match &opts.executable_path {
            Some(path) => path.clone(),
            None => self.detect_path().await?,
        };

        self.transport
            .exec(format!("mkdir -p '{}'", opts.user_data_dir), Duration::from_secs(5))
            .await?;

        // Kill stragglers on the chosen debug port; ignore nonzero exit.
        let _ = self
            .transport
            .exec(
                format!("pkill -f 'remote-debugging-port={}'", opts.debug_port),
                Duration::from_secs(5),
            )
            .await?;
        tokio::time::sleep(Duration::from_millis(500)).await;

        let command = spawn_command(&executable, &opts);
        trace!(command = %command, "spawning remote browser");
        let spawn = self.transport.exec(command, Duration::from_secs(10)).await?;

        let pid: u32 = spawn
            .stdout_string()
            .trim()
            .parse()
            .map_err(|_| Error::LaunchFailed("could not parse spawned PID".into()))?;

        debug!(pid, "remote browser spawned");

        let version = self.wait_until_reachable(&opts).await?;

        Ok(LaunchInfo {
            pid,
            debug_url: format!("http://{}:{}", opts.debug_address, opts.debug_port),
            version,
        })
    }

    /// Polls `/json/version` (via a remote `curl`, since the local forward
    /// is not yet established when `launch` runs — see §4.7's ordering)
    /// every `opts.poll_interval` until it responds 200 or `opts.launch_timeout`
    /// elapses.
    async fn wait_until_reachable(&self, opts: &LaunchOptions) -> Result<String> {
        let deadline = tokio::time::Instant::now() + opts.launch_timeout;
        let url = format!("http://127.0.0.1:{}/json/version", opts.debug_port);

        loop {
            let probe = self
                .transport
                .exec(format!("curl -fsS '{url}'"), Duration::from_secs(5))
                .await;

            if let Ok(output) = probe {
                if output.success() {
                    let body = output.stdout_string();
                    if let Ok(json) = serde_json::from_str::<serde_json::Value>(&body) {
                        let browser = json
                            .get("Browser")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string();
                        return Ok(browser);
                    }
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(Error::LaunchTimeout(opts.launch_timeout));
            }

            tokio::time::sleep(opts.poll_interval).await;
        }
    }

    /// Lists browser processes currently running on the remote host.
    pub async fn find_running(&self) -> Result<Vec<RunningInfo>> {
        let output = self
            .transport
            .exec(
                "ps -eo pid,args | grep -- 'remote-debugging-port' | grep -v grep",
                Duration::from_secs(5),
            )
            .await?;

        let mut running = Vec::new();
        for line in output.stdout_string().lines() {
            let line = line.trim();
            let Some((pid, command)) = line.split_once(char::is_whitespace) else {
                continue;
            };
            if let Ok(pid) = pid.trim().parse() {
                running.push(RunningInfo {
                    pid,
                    command: command.trim().to_string(),
                });
            }
        }

        Ok(running)
    }

    /// Kills a browser process. Graceful `kill`, a 500ms pause, then a
    /// forced `kill -9`. Idempotent (§4.3 "Stop").
    pub async fn kill(&self, pid: u32) -> Result<()> {
        let _ = self
            .transport
            .exec(format!("kill {pid} 2>/dev/null || true"), Duration::from_secs(5))
            .await?;
        tokio::time::sleep(Duration::from_millis(500)).await;
        let _ = self
            .transport
            .exec(format!("kill -9 {pid} 2>/dev/null || true"), Duration::from_secs(5))
            .await?;
        Ok(())
    }

    /// Kills every running browser process found by [`Self::find_running`]
    /// that this session may have left behind.
    pub async fn cleanup(&self) {
        match self.find_running().await {
            Ok(running) => {
                for info in running {
                    if let Err(err) = self.kill(info.pid).await {
                        warn!(pid = info.pid, error = %err, "failed to clean up remote browser process");
                    }
                }
            }
            Err(err) => warn!(error = %err, "failed to list running browser processes during cleanup"),
        }
    }
}

/// Builds the full shell command used to spawn the browser detached, with
/// stdio redirected to `/dev/null` and the child PID captured via `$!`
/// (§4.3 "Launch sequence" step 4).
fn spawn_command(executable: &str, opts: &LaunchOptions) -> String {
    let mut flags = vec![
        format!("--remote-debugging-port={}", opts.debug_port),
        format!("--remote-debugging-address={}", opts.debug_address),
        format!("--user-data-dir={}", opts.user_data_dir),
    ];

    if opts.headless {
        flags.push("--headless=new".to_string());
    }

    // Required Chromium flags (§4.3 "Required Chromium flags").
    flags.extend(
        [
            "--no-first-run",
            "--no-default-browser-check",
            "--disable-background-networking",
            "--disable-client-side-phishing-detection",
            "--disable-default-apps",
            "--disable-extensions",
            "--disable-hang-monitor",
            "--disable-popup-blocking",
            "--disable-prompt-on-repost",
            "--disable-sync",
            "--disable-translate",
            "--metrics-recording-only",
            "--safebrowsing-disable-auto-update",
        ]
        .iter()
        .map(|flag| flag.to_string()),
    );

    let args = flags.join(" ");
    format!(
        "nohup '{executable}' {args} > /dev/null 2>&1 < /dev/null & echo $!"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> LaunchOptions {
        LaunchOptions {
            executable_path: Some("/usr/bin/google-chrome".into()),
            debug_port: 9222,
            debug_address: "127.0.0.1".into(),
            user_data_dir: "/tmp/scdp-profile".into(),
            headless: true,
            launch_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(200),
        }
    }

    #[test]
    fn spawn_command_backgrounds_and_captures_pid() {
        let command = spawn_command("/usr/bin/google-chrome", &opts());
        assert!(command.starts_with("nohup '/usr/bin/google-chrome'"));
        assert!(command.ends_with("& echo $!"));
        assert!(command.contains("--remote-debugging-port=9222"));
        assert!(command.contains("--headless=new"));
    }

    #[test]
    fn required_flags_are_always_present() {
        let command = spawn_command("/usr/bin/google-chrome", &opts());
        for flag in [
            "--no-first-run",
            "--disable-extensions",
            "--safebrowsing-disable-auto-update",
        ] {
            assert!(command.contains(flag), "missing flag {flag}");
        }
    }

    #[test]
    fn non_headless_launch_omits_the_flag() {
        let mut options = opts();
        options.headless = false;
        let command = spawn_command("/usr/bin/google-chrome", &options);
        assert!(!command.contains("--headless=new"));
    }
}
