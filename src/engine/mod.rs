//! The Workflow Engine (§4.1): the Catalog Store, Work Queue, stage
//! executors, retry policy, and the `WorkflowEngine` state machine that
//! ties them together.

pub mod queue;
pub mod retry;
pub mod stages;
pub mod storage;
pub mod sweeper;
pub mod workflow_engine;

pub use queue::{InMemoryWorkQueue, TriggerMessage, WorkQueue};
pub use storage::{CatalogStore, InMemoryCatalogStore};
pub use sweeper::run_sweeper;
pub use workflow_engine::{TriggerOptions, TriggerOutcome, WorkflowEngine};
