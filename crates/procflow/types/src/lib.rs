//! Procflow Domain Types
//!
//! The domain model of the Procflow workflow execution engine.
//! Templates are immutable directed graphs of typed nodes; runs are
//! event-driven executions of one template version against a trigger
//! task.
//!
//! # Key Concepts
//!
//! - **WorkflowTemplate**: A versioned graph of Nodes and Edges.
//!   Frozen once published; edits create new versions.
//! - **Run**: One execution of a template, with its cursor(s), context
//!   bag, branch and validation state, and an append-only execution log.
//! - **BranchInstance**: A parallel lane spawned by a fork node, with
//!   its own cursor and status.
//! - **ValidationInstance**: An approval gate awaiting (or past) its
//!   decision; manual gates exist only as a computed view until
//!   triggered.
//! - **NotificationRequest**: An outward message built by the engine
//!   and handed to the external sender exactly once.
//! - **RunEvent**: The only way a run moves — an inbound event.
//!
//! # Design Principles
//!
//! 1. Node behavior is a tagged union; the compiler enforces that
//!    every node type is handled.
//! 2. All run state mutates through methods, never field writes, so
//!    the branch-disjointness and log-append-only invariants hold by
//!    construction.
//! 3. The engine coordinates and records; collaborators own tasks,
//!    directories, and delivery.

#![deny(unsafe_code)]

mod branch;
mod edge;
mod errors;
mod event;
mod node;
mod notification;
mod run;
mod task;
mod template;
mod validation;

pub use branch::*;
pub use edge::*;
pub use errors::*;
pub use event::*;
pub use node::*;
pub use notification::*;
pub use run::*;
pub use task::*;
pub use template::*;
pub use validation::*;
