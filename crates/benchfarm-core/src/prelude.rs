/*!
 * Prelude module for Benchfarm Core.
 *
 * Re-exports the types and helpers most crates in the workspace need.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{Id, Metadata, Value};

// Re-export event types
pub use crate::event::{EventBus, EventReceiver, SharedEventBus};

// Re-export config types
pub use crate::config::{Config, ConfigBuilder, SharedConfig};

// Re-export utility functions
pub use crate::utils::{with_backoff, with_timeout, RetryPolicy};

// Re-export logging helpers and macros
pub use crate::logging::{device_span, phase_span};
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
