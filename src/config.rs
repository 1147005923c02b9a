//! Ambient configuration and logging initialization (SPEC_FULL §A.2, §A.3).

use tracing_subscriber::EnvFilter;

pub use crate::cosim::CoSimLinkConfig;
pub use crate::engine::EngineConfig;
pub use crate::hardware::HardwareLinkConfig;

/// Initializes a `tracing` subscriber reading `RUST_LOG` (default `info`).
/// Call once, near the start of `main`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
