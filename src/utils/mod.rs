//! Utils Module
pub mod cancel;
pub mod retry;
pub mod telemetry;
pub mod truncate;

pub use cancel::CancellationToken;
pub use retry::PhaseRetry;
pub use truncate::{truncate_chars, truncate_middle};
