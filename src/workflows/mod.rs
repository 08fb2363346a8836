//! Workflow definitions.
//!
//! Each workflow is a plain async function over a
//! [`WorkflowContext`](crate::core::WorkflowContext); the context makes it
//! durable.

pub mod causal_chain;
pub mod pipeline;
pub mod rebalancer;
pub mod scheduler;

pub use causal_chain::{CausalChainProcessor, CausalOutcome, ProcessorState, ProcessorStats, SignalSender};
pub use pipeline::PipelineOutcome;
pub use rebalancer::RebalanceOutcome;
pub use scheduler::{CycleReport, IngestionScheduler};
