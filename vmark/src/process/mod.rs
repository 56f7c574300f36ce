//! External process execution.

pub mod display;
pub mod lines;
pub mod progress;
pub mod supervisor;

pub use display::{DisplayLine, ProgressDisplay};
pub use progress::ProgressPredicate;
pub use supervisor::{ProcessSupervisor, RunOptions, RunOutput};
