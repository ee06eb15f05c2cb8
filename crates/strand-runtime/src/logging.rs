//! Logging initialization
//!
//! The runtime logs through the `log` facade. Embedders that already own a
//! logger keep it; otherwise [`initialize`] starts a `flexi_logger` backend
//! configured from `RUST_LOG`.

use flexi_logger::Logger;
use std::sync::Once;

static INIT_LOG: Once = Once::new();

/// Initialize logging once per process.
///
/// Safe to call from multiple threads and multiple times; only the first
/// call has any effect, and an already-installed logger is left in place.
pub fn initialize() {
    INIT_LOG.call_once(|| {
        if let Ok(logger) = Logger::try_with_env_or_str("info") {
            let _ = logger.start();
        }
    });
}
