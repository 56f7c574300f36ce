//! Item pipeline: stages, pools and per-recipient orchestration.

pub mod commands;
pub mod gate;
pub mod layout;
pub mod media;
pub mod metadata;
pub mod orchestrator;
pub mod recover;
pub mod stage;
pub mod tools;

pub use gate::{ConcurrencyGate, PoolKind};
pub use layout::Layout;
pub use media::MediaItemProcessor;
pub use metadata::ItemMetadata;
pub use orchestrator::{
    ItemProcessor, PipelineOrchestrator, RecipientOutcome, RecipientReport, ResultSink, RunReport,
};
pub use recover::{Recovery, RecoveryReport};
pub use stage::{Stage, StageRunner, SuccessPolicy};
