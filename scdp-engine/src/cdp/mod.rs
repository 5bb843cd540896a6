//! Chrome DevTools Protocol layer: multiplexer, page adapter, network
//! recorder (§4.4, §4.5, §4.6).

pub mod mux;
pub mod network;
pub mod page;

pub use mux::CdpEvent;
pub use mux::CdpMux;
pub use mux::DEFAULT_CONNECT_TIMEOUT;
pub use mux::resolve_target;
pub use network::Har;
pub use network::HarLog;
pub use network::NetworkRecorder;
pub use page::ImageFormat;
pub use page::NavigateOptions;
pub use page::PageAdapter;
pub use page::ScreenshotOptions;
pub use page::WaitUntil;
