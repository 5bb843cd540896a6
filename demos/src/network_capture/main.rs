//! Starts a session, records `Network.*` traffic while navigating to a URL,
//! and writes the capture out as a HAR v1.2 document.
//!
//! `cargo run --bin network-capture -- --host example.com --username root --password hunter2 https://example.org`

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use demos::common::ConnectionArgs;
use eyre::Context;
use eyre::Result;
use scdp::SessionOrchestrator;
use scdp::engine::NavigateOptions;
use scdp::engine::WaitUntil;

#[derive(Debug, Parser)]
struct Args {
    /// Connection and session options.
    #[command(flatten)]
    connection: ConnectionArgs,

    /// The URL to navigate to while recording.
    url: String,

    /// Where to write the HAR document.
    #[arg(long, default_value = "capture.har")]
    out: PathBuf,
}

/// The main function.
#[tokio::main]
async fn main() -> Result<()> {
    demos::common::init_tracing();
    let args = Args::parse();

    let orchestrator = SessionOrchestrator::new();
    demos::common::start_session(&orchestrator, args.connection).await?;

    let page = orchestrator
        .page()
        .await
        .ok_or_else(|| eyre::eyre!("session started but no page adapter is available"))?;
    let network = orchestrator
        .network()
        .await
        .ok_or_else(|| eyre::eyre!("session started but no network recorder is available"))?;

    network.start().await.context("enabling network recording")?;

    page.navigate(
        &args.url,
        NavigateOptions {
            wait_until: WaitUntil::NetworkIdle,
            timeout: Duration::from_secs(30),
        },
    )
    .await
    .context("navigating")?;

    let har = network.export_har().await;
    network.stop().await.context("disabling network recording")?;

    let json = serde_json::to_string_pretty(&har).context("serializing HAR document")?;
    std::fs::write(&args.out, &json).with_context(|| format!("writing {}", args.out.display()))?;
    println!(
        "wrote {} ({} entries)",
        args.out.display(),
        har.log.entries.len()
    );

    orchestrator.stop().await.context("stopping session")?;
    Ok(())
}
