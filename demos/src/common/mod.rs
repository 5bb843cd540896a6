//! Shared CLI plumbing for the demo binaries.

use clap::Parser;
use eyre::Context;
use eyre::Result;
use scdp::config::AuthKind;
use scdp::config::ConnectionDescriptor;
use scdp::engine::StartOptions;
use scdp::engine::StartOverrides;

/// Connection and session options shared by every demo.
#[derive(Debug, Parser)]
pub struct ConnectionArgs {
    /// The remote host to SSH into.
    #[arg(long)]
    pub host: String,

    /// The remote SSH port.
    #[arg(long, default_value_t = 22)]
    pub port: u16,

    /// The SSH username.
    #[arg(long)]
    pub username: String,

    /// The SSH password. Mutually exclusive with `--key-path`.
    #[arg(long)]
    pub password: Option<String>,

    /// A private key path. Mutually exclusive with `--password`.
    #[arg(long)]
    pub key_path: Option<String>,

    /// A passphrase for `--key-path`, if the key is encrypted.
    #[arg(long)]
    pub passphrase: Option<String>,

    /// Overrides the remote browser's `--headless` setting.
    #[arg(long)]
    pub headless: Option<bool>,

    /// Overrides the local forward port.
    #[arg(long)]
    pub local_port: Option<u16>,

    /// Overrides the remote debug port.
    #[arg(long)]
    pub remote_port: Option<u16>,
}

impl ConnectionArgs {
    /// Builds a [`StartOptions`] from these CLI arguments, using the
    /// library defaults for anything not overridden.
    pub fn into_start_options(self) -> Result<StartOptions> {
        let (auth_kind, secret) = match (self.password, self.key_path) {
            (Some(password), None) => (AuthKind::Password, password),
            (None, Some(key_path)) => (AuthKind::PrivateKey, key_path),
            _ => {
                return Err(eyre::eyre!(
                    "exactly one of --password or --key-path must be supplied"
                ));
            }
        };

        let mut builder = ConnectionDescriptor::builder()
            .id("demo")
            .name("demo")
            .host(self.host)
            .port(self.port)
            .username(self.username)
            .auth_kind(auth_kind)
            .secret(secret);
        if let Some(passphrase) = self.passphrase {
            builder = builder.passphrase(passphrase);
        }
        let connection = builder.build();

        let overrides = StartOverrides {
            headless: self.headless,
            local_port: self.local_port,
            remote_port: self.remote_port,
        };

        Ok(StartOptions::builder()
            .connection(connection)
            .ssh_defaults(Default::default())
            .browser_defaults(Default::default())
            .port_forward_defaults(Default::default())
            .cdp_defaults(Default::default())
            .overrides(overrides)
            .build())
    }
}

/// Installs the `tracing` subscriber every demo shares.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();
}

/// Starts a session and reports errors with `eyre`'s chained context.
pub async fn start_session(
    orchestrator: &scdp::SessionOrchestrator,
    args: ConnectionArgs,
) -> Result<()> {
    let options = args.into_start_options()?;
    orchestrator
        .start(options)
        .await
        .map_err(|err| eyre::eyre!(err))
        .context("starting session")
}
