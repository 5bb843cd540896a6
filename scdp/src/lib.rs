//! Facade crate: re-exports the configuration, transport, engine, and event
//! crates behind feature flags, plus the GUI-boundary JSON data shapes (§6).

#[cfg(feature = "config")]
#[doc(inline)]
pub use scdp_config as config;
#[cfg(feature = "config")]
#[doc(inline)]
pub use scdp_config::ConnectionDescriptor;
#[cfg(feature = "transport")]
#[doc(inline)]
pub use scdp_transport as transport;
#[cfg(feature = "transport")]
#[doc(inline)]
pub use scdp_transport::SshTransport;
#[cfg(feature = "engine")]
#[doc(inline)]
pub use scdp_engine as engine;
#[cfg(feature = "engine")]
#[doc(inline)]
pub use scdp_engine::SessionOrchestrator;
#[cfg(feature = "events")]
#[doc(inline)]
pub use scdp_events as events;

pub mod gui;
