//! Task types for taskweave.
//!
//! A [`Task`] is one record on the shared board. Field names on disk follow the
//! camelCase record format (`activeForm`, `blockedBy`) so that any process
//! reading the directory sees the same shape.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};

/// Unique identifier for a task.
///
/// Ids are decimal sequence numbers kept as strings. Ordering is numeric so
/// that `"10"` sorts after `"9"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Build the id for a sequence number.
    pub fn from_seq(seq: u64) -> Self {
        Self(seq.to_string())
    }

    /// Numeric sequence number, if the id is well formed.
    pub fn seq(&self) -> Option<u64> {
        self.0.parse().ok()
    }

    fn sort_key(&self) -> (u64, &str) {
        (self.seq().unwrap_or(u64::MAX), self.0.as_str())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.trim_start_matches('#').to_string())
    }
}

impl From<u64> for TaskId {
    fn from(seq: u64) -> Self {
        Self::from_seq(seq)
    }
}

impl Ord for TaskId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for TaskId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Callers (and models) are sloppy about quoting ids, so accept `3` as well as `"3"`.
impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) => TaskId::from(s.as_str()),
            Raw::Number(n) => TaskId::from_seq(n),
        })
    }
}

/// Task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not started
    Pending,
    /// Being worked on
    InProgress,
    /// Finished
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
        }
    }

    /// Checkbox marker used when rendering the board.
    pub fn marker(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "[ ]",
            TaskStatus::InProgress => "[>]",
            TaskStatus::Completed => "[x]",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            other => Err(Error::Validation(format!(
                "unknown status '{}' (expected pending, in_progress or completed)",
                other
            ))),
        }
    }
}

/// A task on the board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique id, assigned at creation
    pub id: TaskId,
    /// Short imperative description
    pub subject: String,
    /// Free-form detail
    #[serde(default)]
    pub description: String,
    /// Current status
    pub status: TaskStatus,
    /// Present-progressive label shown while in progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_form: Option<String>,
    /// Responsible agent, empty until claimed
    #[serde(default)]
    pub owner: String,
    /// Tasks this one unblocks once completed
    #[serde(default)]
    pub blocks: BTreeSet<TaskId>,
    /// Tasks that must complete before this one is executable
    #[serde(default)]
    pub blocked_by: BTreeSet<TaskId>,
}

impl Task {
    /// Create a new pending task.
    pub fn new(id: TaskId, subject: impl Into<String>, description: impl Into<String>, active_form: Option<String>) -> Self {
        Self {
            id,
            subject: subject.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            active_form,
            owner: String::new(),
            blocks: BTreeSet::new(),
            blocked_by: BTreeSet::new(),
        }
    }

    /// Executable means nothing is left in `blocked_by`.
    pub fn is_executable(&self) -> bool {
        self.blocked_by.is_empty()
    }

    /// Whether the task could be picked up right now.
    pub fn is_ready(&self) -> bool {
        self.status == TaskStatus::Pending && self.is_executable()
    }

    /// Apply the non-edge fields of a patch, returning the previous status.
    ///
    /// The first transition into `in_progress` claims the task for `claimant`
    /// when no owner is set. Callers run this under the record lock, which is
    /// what makes the claim a compare-and-set.
    pub fn apply_fields(&mut self, patch: &TaskPatch, claimant: &str) -> TaskStatus {
        let previous = self.status;

        if let Some(description) = &patch.description {
            self.description = description.clone();
        }
        if let Some(active_form) = &patch.active_form {
            self.active_form = if active_form.is_empty() {
                None
            } else {
                Some(active_form.clone())
            };
        }
        if let Some(owner) = &patch.owner {
            self.owner = owner.clone();
        }
        if let Some(status) = patch.status {
            if status == TaskStatus::InProgress && previous != TaskStatus::InProgress && self.owner.is_empty() {
                self.owner = claimant.to_string();
            }
            self.status = status;
        }

        previous
    }

    /// Compact view without the description.
    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            id: self.id.clone(),
            subject: self.subject.clone(),
            status: self.status,
            active_form: self.active_form.clone(),
            owner: self.owner.clone(),
            blocks: self.blocks.clone(),
            blocked_by: self.blocked_by.clone(),
        }
    }

    /// Multi-line detail view.
    pub fn render_detail(&self) -> String {
        let mut out = format!("#{}: {}\nStatus: {}", self.id, self.subject, self.status);
        if !self.owner.is_empty() {
            out.push_str(&format!("\nOwner: {}", self.owner));
        }
        if let Some(active_form) = &self.active_form {
            out.push_str(&format!("\nActive form: {}", active_form));
        }
        if !self.blocked_by.is_empty() {
            out.push_str(&format!("\nBlocked by: {}", join_ids(&self.blocked_by)));
        }
        if !self.blocks.is_empty() {
            out.push_str(&format!("\nBlocks: {}", join_ids(&self.blocks)));
        }
        if !self.description.is_empty() {
            out.push_str(&format!("\n\n{}", self.description));
        }
        out
    }
}

/// A task without its description, as returned by listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub id: TaskId,
    pub subject: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_form: Option<String>,
    pub owner: String,
    pub blocks: BTreeSet<TaskId>,
    pub blocked_by: BTreeSet<TaskId>,
}

impl TaskSummary {
    /// One board line, e.g. `[ ] #3: Write tests blocked by: #1, #2`.
    pub fn render_line(&self) -> String {
        let mut line = format!("{} #{}: {}", self.status.marker(), self.id, self.subject);
        if !self.owner.is_empty() {
            line.push_str(&format!(" ({})", self.owner));
        }
        if self.status == TaskStatus::InProgress
            && let Some(active_form) = &self.active_form
        {
            line.push_str(&format!(" <{}>", active_form));
        }
        if !self.blocked_by.is_empty() {
            line.push_str(&format!(" blocked by: {}", join_ids(&self.blocked_by)));
        }
        line
    }
}

/// Render a whole board listing.
pub fn render_list(tasks: &[TaskSummary]) -> String {
    if tasks.is_empty() {
        return "No tasks.".to_string();
    }
    tasks.iter().map(TaskSummary::render_line).collect::<Vec<_>>().join("\n")
}

fn join_ids(ids: &BTreeSet<TaskId>) -> String {
    ids.iter().map(|id| format!("#{}", id)).collect::<Vec<_>>().join(", ")
}

/// Partial update of a task.
///
/// Field changes are applied to the record under its lock; edge changes are
/// routed through the dependency engine so both sides stay in step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub owner: Option<String>,
    pub description: Option<String>,
    pub active_form: Option<String>,
    pub add_blocked_by: Vec<TaskId>,
    pub add_blocks: Vec<TaskId>,
    pub remove_blocked_by: Vec<TaskId>,
    pub remove_blocks: Vec<TaskId>,
}

impl TaskPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn active_form(mut self, active_form: impl Into<String>) -> Self {
        self.active_form = Some(active_form.into());
        self
    }

    pub fn add_blocked_by<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.add_blocked_by.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn add_blocks<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.add_blocks.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn remove_blocked_by<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.remove_blocked_by.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn remove_blocks<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.remove_blocks.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Whether any record field (as opposed to an edge) changes.
    pub fn has_field_changes(&self) -> bool {
        self.status.is_some() || self.owner.is_some() || self.description.is_some() || self.active_form.is_some()
    }
}
