//! Logging utilities

pub use log::{debug, error, info, trace, warn};

/// Initialize the logging system from the environment (`RUST_LOG`)
pub fn init() {
    let _ = env_logger::try_init();
}
