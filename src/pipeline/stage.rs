//! Pipeline stage trait
//!
//! Defines the interface implemented by every worker stage; the coordinator
//! spawns each stage as its own task and supervises the outcome.

use anyhow::Result;
use async_trait::async_trait;

/// Trait for pipeline stages that process media data
///
/// A stage runs until its input is exhausted or the pipeline is cancelled.
/// Returning `Err` marks a fatal condition: the coordinator reacts by
/// tearing the whole pipeline down. Cancellation is a normal exit, not an
/// error.
#[async_trait]
pub trait PipelineStage: Send {
    /// Run the stage, processing data until shutdown
    async fn run(&mut self) -> Result<()>;

    /// Get the name of this stage for logging
    fn name(&self) -> &'static str;
}
