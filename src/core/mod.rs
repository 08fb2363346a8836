//! Core orchestration logic.
//!
//! This module contains:
//! - Journal: Append-only per-run event logging and replay
//! - Activities: Typed activity declarations and the handler registry
//! - Context: Activity execution with retry, timeout and cancellation
//! - Host: Run identity, child starts and lifecycle
//! - Inbox: Durable signal delivery for the causal processor

pub mod activities;
pub mod context;
pub mod host;
pub mod inbox;
pub mod journal;
pub mod retry;
pub mod shutdown;

// Re-export commonly used types
pub use activities::{Activity, ActivityError, ActivityRegistry, Collaborators};
pub use context::{WorkflowContext, WorkflowError};
pub use host::{HostSettings, StartOutcome, WorkflowHost};
pub use inbox::{Delivery, DeliveryStatus, InboxError, SignalInbox};
pub use journal::{generate_idempotency_key, hash_input, Journal};
pub use retry::{ActivityOptions, RetryPolicy};
pub use shutdown::{ShutdownSignal, ShutdownTrigger};
