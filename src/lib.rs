// phxload - Synthetic load generator for Phoenix-style realtime channels

pub mod client;
pub mod config;
pub mod metrics;
pub mod protocol;
pub mod report;
pub mod scheduler;
pub mod utils;

// Re-export commonly used types
pub use utils::error::{PhxLoadError, Result};
