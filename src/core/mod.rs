//! 核心类型：错误分类、生命周期状态、优雅关闭

pub mod error;
pub mod shutdown;
pub mod state;

pub use error::{ErrorKind, RuntimeError, Severity};
pub use shutdown::{
    ShutdownManager, ShutdownReason, ShutdownReport, ShutdownSequence, ShutdownStep, StepOutcome,
};
pub use state::Status;
