//! Resumable batch watermarking pipeline.
//!
//! Source videos are processed once per recipient through a chain of external
//! tools. Completion is recorded per recipient so an interrupted batch picks up
//! where it stopped on the next run.

pub mod config;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod process;
pub mod state;
pub mod storage;

pub use config::AppConfig;
pub use error::{Error, Result};
