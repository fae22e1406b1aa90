//! 错误处理（C5）

pub mod handler;
pub mod pattern;
pub mod record;
pub mod store;

pub use handler::{ErrorHandler, ErrorsConfig, ERROR_HANDLER_SOURCE};
pub use pattern::{DetectedPattern, PatternConfig, PatternDetector};
pub use record::{AggregateKey, ErrorRecord, ErrorReport, ErrorStatistics};
pub use store::{ErrorStore, InMemoryErrorStore, JsonFileErrorStore};
