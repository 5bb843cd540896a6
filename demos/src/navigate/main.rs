//! Starts a session, navigates the remote page to a URL, and writes out a
//! screenshot.
//!
//! `cargo run --bin navigate -- --host example.com --username root --password hunter2 https://example.org`

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use demos::common::ConnectionArgs;
use eyre::Context;
use eyre::Result;
use scdp::SessionOrchestrator;
use scdp::engine::ImageFormat;
use scdp::engine::NavigateOptions;
use scdp::engine::ScreenshotOptions;
use scdp::engine::WaitUntil;

#[derive(Debug, Parser)]
struct Args {
    /// Connection and session options.
    #[command(flatten)]
    connection: ConnectionArgs,

    /// The URL to navigate to.
    url: String,

    /// Where to write the PNG screenshot.
    #[arg(long, default_value = "screenshot.png")]
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

    page.navigate(
        &args.url,
        NavigateOptions {
            wait_until: WaitUntil::NetworkIdle,
            timeout: Duration::from_secs(30),
        },
    )
    .await
    .context("navigating")?;

    let image = page
        .screenshot(ScreenshotOptions {
            format: ImageFormat::Png,
            quality: None,
            full_page: false,
        })
        .await
        .context("capturing screenshot")?;

    std::fs::write(&args.out, &image).with_context(|| format!("writing {}", args.out.display()))?;
    println!("wrote {} ({} bytes)", args.out.display(), image.len());

    orchestrator.stop().await.context("stopping session")?;
    Ok(())
}
