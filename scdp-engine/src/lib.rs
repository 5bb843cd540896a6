//! The session orchestrator: remote browser launch, CDP multiplexing,
//! page/network adapters, and the connection pool (§4.3–§4.7).

pub mod browser;
pub mod cdp;
pub mod orchestrator;
pub mod pool;

pub use browser::LaunchInfo;
pub use browser::LaunchOptions;
pub use browser::RemoteBrowser;
pub use browser::RunningInfo;
pub use cdp::CdpEvent;
pub use cdp::CdpMux;
pub use cdp::Har;
pub use cdp::HarLog;
pub use cdp::ImageFormat;
pub use cdp::NavigateOptions;
pub use cdp::NetworkRecorder;
pub use cdp::PageAdapter;
pub use cdp::ScreenshotOptions;
pub use cdp::WaitUntil;
pub use orchestrator::SessionOrchestrator;
pub use orchestrator::StartOptions;
pub use orchestrator::StartOverrides;
pub use pool::ConnectionPool;
