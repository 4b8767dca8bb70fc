//! taskweave: a shared task board with dependency tracking and background work.
//!
//! Tasks live as JSON records in one directory, each guarded by its own lock
//! file so several processes can share the board. Background work runs on
//! detached threads and reports completion through a notification bus that a
//! coordinating loop drains between decisions.

pub mod config;
pub mod coordination;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod store;
pub mod task;
pub mod task_manager;

pub use config::Config;
pub use coordination::{DependencyEngine, MessageType, NotificationBus, NotificationEvent, TeamManager};
pub use coordinator::{Coordinator, Decision, DecisionMaker, Outcome};
pub use error::{Error, Result};
pub use executor::{BackgroundExecutor, BackgroundKind, BackgroundSnapshot, BackgroundStatus, StopToken};
pub use store::TaskStore;
pub use task::{Task, TaskId, TaskPatch, TaskStatus, TaskSummary};
pub use task_manager::{TaskManager, UpdateOutcome};
