// Leadforge Core - domain types and rules for the lead-magnet worker
//
// Modules:
// - records: Job, Submission, Workflow, ExecutionStep, Artifact, UsageRecord, LiveStep
// - error: worker error taxonomy + provider-message classification
// - tools: tool registry, normalization, cleaning, validation/filtering
// - models: model capability profiles
// - cost: per-model token pricing
// - context: submission labeling and previous-context assembly
// - config: environment-derived worker configuration

pub mod config;
pub mod context;
pub mod cost;
pub mod error;
pub mod models;
pub mod records;
pub mod tools;

pub use error::{Result, WorkerError};
