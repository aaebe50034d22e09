//! Procflow Execution Engine
//!
//! The runtime of the Procflow workflow engine: it advances runs
//! through template graphs in response to inbound events. The engine
//! holds templates and run state; tasks, directory lookups, and
//! notification delivery belong to collaborators handed in at
//! construction.
//!
//! # Module Map
//!
//! - [`engine`]: The [`WorkflowEngine`] facade — templates, runs,
//!   events, timeout sweeps behind one handle.
//! - [`state_machine`]: Cursor advancement and event routing; chains
//!   through control nodes until something waits.
//! - [`fork_join`]: Parallel branch activation and join evaluation.
//! - [`validation_gate`]: Approval gates, trigger eligibility,
//!   approver resolution.
//! - [`condition`]: The `field op literal` expression evaluator.
//! - [`effects`]: The side-effect emitter — task writes and
//!   notification fan-out, logged before dispatch.
//! - [`registry`]: Versioned template storage with a publish
//!   lifecycle.
//! - [`timeouts`]: SLA reminders, validation expiry, join deadlines,
//!   driven by an external tick.
//! - [`collaborators`]: The task-store/directory/sender boundaries
//!   plus in-memory implementations.
//!
//! # Concurrency
//!
//! Every run lives behind its own mutex. Events against one run
//! serialize; runs advance independently. The engine spawns no threads
//! and keeps no clock.

#![deny(unsafe_code)]

pub mod collaborators;
pub mod condition;
pub mod effects;
pub mod engine;
pub mod fork_join;
pub mod registry;
pub mod state_machine;
pub mod timeouts;
pub mod validation_gate;

pub use collaborators::{
    Directory, DirectoryScope, InMemoryDirectory, InMemoryTaskStore, NotificationSender,
    RecordingSender, TaskStore,
};
pub use condition::ConditionEvaluator;
pub use effects::Effects;
pub use engine::{AdvanceOutcome, WorkflowEngine};
pub use fork_join::{ForkJoinCoordinator, JoinEvaluation, JoinOutcome};
pub use registry::TemplateRegistry;
pub use state_machine::StateMachine;
pub use timeouts::{TimeoutDecision, TimeoutSweeper};
pub use validation_gate::{DecisionRouting, ValidationGate};
