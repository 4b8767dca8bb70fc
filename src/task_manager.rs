//! Task manager combining the file store with the dependency engine.
//!
//! This is the surface callers use. Field updates go to the record under its
//! lock; edge changes and completion fallout go through the engine.

use std::path::PathBuf;

use crate::config::{Config, StoreSettings};
use crate::coordination::dependency::DependencyEngine;
use crate::error::Result;
use crate::store::TaskStore;
use crate::task::{Task, TaskId, TaskPatch, TaskStatus, TaskSummary, render_list};

/// Result of an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// The task as stored after the update.
    pub task: Task,
    /// Dependents that became executable because this update completed the task.
    pub unblocked: Vec<TaskId>,
}

/// Manages the shared task board.
#[derive(Debug, Clone)]
pub struct TaskManager {
    store: TaskStore,
    engine: DependencyEngine,
    agent_name: String,
}

impl TaskManager {
    /// Open (creating if needed) the board stored in `dir`.
    pub fn open(dir: impl Into<PathBuf>, settings: &StoreSettings, agent_name: impl Into<String>) -> Result<Self> {
        let store = TaskStore::open(dir, settings)?;
        Ok(Self {
            engine: DependencyEngine::new(store.clone()),
            store,
            agent_name: agent_name.into(),
        })
    }

    /// Open the board described by a loaded config.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::open(config.tasks_dir(), &config.store, config.agent_name.clone())
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn engine(&self) -> &DependencyEngine {
        &self.engine
    }

    /// Identity that claims tasks moved to `in_progress` without an owner.
    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    /// Create a new pending task.
    pub fn create_task(&self, subject: &str, description: &str, active_form: Option<&str>) -> Result<Task> {
        self.store.create(subject, description, active_form)
    }

    /// Get a task by ID.
    pub fn get_task(&self, id: &TaskId) -> Result<Task> {
        self.store.get(id)
    }

    /// Apply a partial update.
    ///
    /// Edge additions are checked up front, so a patch naming a missing task
    /// or closing a cycle is rejected before anything is written. Fields are
    /// written first, then edges. If the task ends up completed, its
    /// dependents are released and reported in the outcome.
    pub fn update(&self, id: &TaskId, patch: &TaskPatch) -> Result<UpdateOutcome> {
        if !patch.add_blocked_by.is_empty() || !patch.add_blocks.is_empty() {
            self.engine.check_additions(id, &patch.add_blocked_by, &patch.add_blocks)?;
        }

        if patch.has_field_changes() {
            let (task, previous) = self.store.update_fields(id, patch, &self.agent_name)?;
            if task.status == TaskStatus::InProgress && previous != TaskStatus::InProgress && !task.is_executable() {
                log::warn!(
                    "Task #{} started while still blocked by {:?}",
                    task.id,
                    task.blocked_by.iter().map(|b| b.as_ref()).collect::<Vec<_>>()
                );
            }
        } else {
            // Surface NotFound even for edge-only patches
            self.store.get(id)?;
        }

        if !patch.add_blocked_by.is_empty() {
            self.engine.add_blocked_by(id, &patch.add_blocked_by)?;
        }
        if !patch.add_blocks.is_empty() {
            self.engine.add_blocks(id, &patch.add_blocks)?;
        }
        if !patch.remove_blocked_by.is_empty() {
            self.engine.remove_blocked_by(id, &patch.remove_blocked_by)?;
        }
        if !patch.remove_blocks.is_empty() {
            self.engine.remove_blocks(id, &patch.remove_blocks)?;
        }

        let task = self.store.get(id)?;
        // Keyed on the resulting state so a retried update finishes a
        // propagation that failed part way
        let unblocked = if task.status == TaskStatus::Completed && !task.blocks.is_empty() {
            self.engine.on_completed(id)?
        } else {
            Vec::new()
        };

        let task = if unblocked.is_empty() { task } else { self.store.get(id)? };
        Ok(UpdateOutcome { task, unblocked })
    }

    /// Shorthand for a status-only update.
    pub fn set_status(&self, id: &TaskId, status: TaskStatus) -> Result<UpdateOutcome> {
        self.update(id, &TaskPatch::new().status(status))
    }

    /// Make `blocked_id` wait for `blocker_id`.
    pub fn add_dependency(&self, blocked_id: &TaskId, blocker_id: &TaskId) -> Result<()> {
        self.engine.add_blocked_by(blocked_id, std::slice::from_ref(blocker_id))?;
        Ok(())
    }

    /// Remove the dependency between two tasks.
    pub fn remove_dependency(&self, blocked_id: &TaskId, blocker_id: &TaskId) -> Result<()> {
        self.engine.remove_blocked_by(blocked_id, std::slice::from_ref(blocker_id))?;
        Ok(())
    }

    /// Delete a task, severing its edges. Returns dependents it was the last blocker of.
    pub fn delete_task(&self, id: &TaskId) -> Result<Vec<TaskId>> {
        self.engine.detach(id)
    }

    /// All tasks in creation order, without descriptions.
    pub fn list_tasks(&self) -> Result<Vec<TaskSummary>> {
        self.store.list()
    }

    /// Pending tasks with nothing blocking them.
    pub fn ready_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.store.load_all()?.into_iter().filter(Task::is_ready).collect())
    }

    /// Tasks with at least one open prerequisite.
    pub fn blocked_tasks(&self) -> Result<Vec<Task>> {
        Ok(self
            .store
            .load_all()?
            .into_iter()
            .filter(|t| !t.is_executable())
            .collect())
    }

    /// Get the number of tasks by status.
    pub fn task_counts(&self) -> Result<TaskCounts> {
        let mut counts = TaskCounts::default();
        for task in self.store.list()? {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::InProgress => counts.in_progress += 1,
                TaskStatus::Completed => counts.completed += 1,
            }
        }
        Ok(counts)
    }

    /// The board as text, one line per task.
    pub fn render_list(&self) -> Result<String> {
        Ok(render_list(&self.store.list()?))
    }

    /// Full detail of one task.
    pub fn render_task(&self, id: &TaskId) -> Result<String> {
        Ok(self.store.get(id)?.render_detail())
    }

    /// Check that every edge is recorded on both ends.
    pub fn verify(&self) -> Result<()> {
        self.engine.verify()
    }
}

/// Task counts by status.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TaskCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
}

impl TaskCounts {
    /// Tasks not yet completed.
    pub fn open(&self) -> usize {
        self.pending + self.in_progress
    }

    pub fn total(&self) -> usize {
        self.open() + self.completed
    }
}
