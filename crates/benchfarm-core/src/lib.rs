/*!
 * Benchfarm Core
 *
 * This crate provides the shared foundation for the benchfarm workspace:
 * configuration, logging, the typed event bus, common value types and the
 * timeout/backoff helpers used by the connection layer.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod prelude;
pub mod types;
pub mod utils;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use chrono;
    pub use serde;
    pub use tokio;
    pub use tracing;
    pub use uuid;
}

/// Benchfarm core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization with the default logging setup
pub fn init() -> Result<(), error::Error> {
    logging::init()?;
    tracing::info!("Benchfarm Core {} initialized", VERSION);
    Ok(())
}
