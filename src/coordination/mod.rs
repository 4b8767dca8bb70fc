//! Coordination primitives shared by every process using the board.
//!
//! - Locks: per-record file locks with bounded wait
//! - Dependency engine: keeps blocks/blockedBy mirrored, releases dependents
//! - Notifications: completion queue drained by the coordinating loop
//! - Teams: named agents exchanging messages through drained inboxes

pub mod dependency;
pub mod locks;
pub mod notifications;
pub mod team;

pub use dependency::DependencyEngine;
pub use locks::{LockManager, RecordLock};
pub use notifications::{NotificationBus, NotificationEvent, render_injection};
pub use team::{MessageType, Team, TeamManager, TeamMessage};
