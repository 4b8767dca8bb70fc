//! Tools the coordinator exposes to its decision maker.
//!
//! Task board tools go to the [`TaskManager`]; background tools go to the
//! [`BackgroundExecutor`]; team tools, when enabled, go to the
//! [`TeamManager`]. Failures come back as error results so the loop keeps
//! going and the decision maker can react.

use std::path::PathBuf;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::coordination::team::{MessageType, TeamManager};
use crate::error::{Error, Result};
use crate::executor::BackgroundExecutor;
use crate::task::{TaskId, TaskPatch};
use crate::task_manager::TaskManager;

/// Definition of a tool available to the decision maker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    /// Tool name (used in tool calls).
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON schema for the tool's parameters.
    pub parameters: Value,
}

/// A tool call made by the decision maker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier for this call.
    pub id: String,
    /// Name of the tool to invoke.
    pub name: String,
    /// Arguments as JSON.
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Result of executing a tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    /// Output shown to the decision maker.
    pub output: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            output: message.into(),
            is_error: true,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateArgs {
    subject: String,
    #[serde(default)]
    description: String,
    active_form: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskIdArgs {
    task_id: TaskId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateArgs {
    task_id: TaskId,
    #[serde(flatten)]
    patch: TaskPatch,
}

#[derive(Deserialize)]
struct RunArgs {
    command: String,
}

#[derive(Deserialize)]
struct OutputArgs {
    task_id: String,
    block: Option<bool>,
    /// Milliseconds.
    timeout: Option<u64>,
}

#[derive(Deserialize)]
struct StopArgs {
    task_id: String,
}

#[derive(Deserialize)]
struct TeamCreateArgs {
    name: String,
    #[serde(default)]
    members: Vec<String>,
}

#[derive(Deserialize)]
struct TeamArgs {
    team: String,
}

#[derive(Deserialize)]
struct TeamStatusArgs {
    team: Option<String>,
}

#[derive(Deserialize)]
struct SendArgs {
    team: String,
    to: Option<String>,
    #[serde(rename = "type", default = "default_message_type")]
    kind: String,
    content: String,
}

fn default_message_type() -> String {
    MessageType::Message.as_str().to_string()
}

/// Executes tool calls against the board and the background executor.
#[derive(Debug, Clone)]
pub struct ToolDispatcher {
    tasks: TaskManager,
    background: BackgroundExecutor,
    teams: Option<TeamManager>,
    default_wait: Duration,
    working_dir: Option<PathBuf>,
    tools: Vec<Tool>,
}

impl ToolDispatcher {
    pub fn new(tasks: TaskManager, background: BackgroundExecutor, default_wait: Duration) -> Self {
        Self {
            tasks,
            background,
            teams: None,
            default_wait,
            working_dir: None,
            tools: Self::default_tools(),
        }
    }

    /// Run background commands in `dir` instead of the process's cwd.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Enable the team tools. The configured agent name sends and reads as a member.
    pub fn with_teams(mut self, teams: TeamManager) -> Self {
        self.teams = Some(teams);
        self.tools.extend(Self::team_tools());
        self
    }

    /// Get available tools.
    pub fn available_tools(&self) -> &[Tool] {
        &self.tools
    }

    /// Execute a tool call. Never fails; errors become error results.
    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        let result = match call.name.as_str() {
            "task_create" => self.task_create(&call.arguments),
            "task_get" => self.task_get(&call.arguments),
            "task_update" => self.task_update(&call.arguments),
            "task_list" => self.tasks.render_list().map(ToolResult::success),
            "task_delete" => self.task_delete(&call.arguments),
            "background_run" => self.background_run(&call.arguments),
            "task_output" => self.task_output(&call.arguments).await,
            "task_stop" => self.task_stop(&call.arguments),
            "team_create" | "team_delete" | "team_status" | "send_message" | "read_inbox" => {
                match &self.teams {
                    Some(teams) => self.team_tool(teams, call),
                    None => Ok(ToolResult::error(format!("Unknown tool: {}", call.name))),
                }
            }
            _ => Ok(ToolResult::error(format!("Unknown tool: {}", call.name))),
        };

        result.unwrap_or_else(|e| {
            log::debug!("Tool {} failed: {}", call.name, e);
            ToolResult::error(format!("Error: {}", e))
        })
    }

    fn task_create(&self, args: &Value) -> Result<ToolResult> {
        let args: CreateArgs = parse(args)?;
        let task = self
            .tasks
            .create_task(&args.subject, &args.description, args.active_form.as_deref())?;
        Ok(ToolResult::success(format!(
            "Task #{} created successfully: {}",
            task.id, task.subject
        )))
    }

    fn task_get(&self, args: &Value) -> Result<ToolResult> {
        let args: TaskIdArgs = parse(args)?;
        Ok(ToolResult::success(self.tasks.render_task(&args.task_id)?))
    }

    fn task_update(&self, args: &Value) -> Result<ToolResult> {
        let args: UpdateArgs = parse(args)?;
        let outcome = self.tasks.update(&args.task_id, &args.patch)?;

        let mut output = format!("Updated task #{}: {}", outcome.task.id, outcome.task.summary().render_line());
        if !outcome.unblocked.is_empty() {
            output.push_str(&format!("\nNow unblocked: {}", join_ids(&outcome.unblocked)));
        }
        Ok(ToolResult::success(output))
    }

    fn task_delete(&self, args: &Value) -> Result<ToolResult> {
        let args: TaskIdArgs = parse(args)?;
        let unblocked = self.tasks.delete_task(&args.task_id)?;

        let mut output = format!("Deleted task #{}", args.task_id);
        if !unblocked.is_empty() {
            output.push_str(&format!("\nNow unblocked: {}", join_ids(&unblocked)));
        }
        Ok(ToolResult::success(output))
    }

    fn background_run(&self, args: &Value) -> Result<ToolResult> {
        let args: RunArgs = parse(args)?;
        let id = self.background.run_command(&args.command, self.working_dir.as_deref())?;
        Ok(ToolResult::success(format!(
            "Started background task {}. You will be notified when it finishes.",
            id
        )))
    }

    async fn task_output(&self, args: &Value) -> Result<ToolResult> {
        let args: OutputArgs = parse(args)?;
        let timeout = args.timeout.map(Duration::from_millis).unwrap_or(self.default_wait);
        let snapshot = self
            .background
            .get_output(&args.task_id, args.block.unwrap_or(true), timeout)
            .await?;
        Ok(ToolResult::success(snapshot.render()))
    }

    fn task_stop(&self, args: &Value) -> Result<ToolResult> {
        let args: StopArgs = parse(args)?;
        let snapshot = self.background.stop(&args.task_id)?;
        Ok(ToolResult::success(format!(
            "Background task {} is {}",
            snapshot.task_id, snapshot.status
        )))
    }

    fn team_tool(&self, teams: &TeamManager, call: &ToolCall) -> Result<ToolResult> {
        let me = self.tasks.agent_name();
        match call.name.as_str() {
            "team_create" => {
                let args: TeamCreateArgs = parse(&call.arguments)?;
                teams.create_team(&args.name)?;
                let mut team = teams.add_member(&args.name, me)?;
                for member in &args.members {
                    team = teams.add_member(&args.name, member)?;
                }
                Ok(ToolResult::success(format!(
                    "Team {} created with {} member(s)",
                    team.name,
                    team.members.len()
                )))
            }
            "team_delete" => {
                let args: TeamArgs = parse(&call.arguments)?;
                teams.delete_team(&args.team)?;
                Ok(ToolResult::success(format!("Team {} deleted", args.team)))
            }
            "team_status" => {
                let args: TeamStatusArgs = parse(&call.arguments)?;
                Ok(ToolResult::success(teams.status(args.team.as_deref())?))
            }
            "send_message" => {
                let args: SendArgs = parse(&call.arguments)?;
                let kind: MessageType = args.kind.parse()?;
                let to = teams.send_message(&args.team, me, args.to.as_deref(), kind, &args.content)?;
                Ok(ToolResult::success(format!("Sent {} to {}", kind, to.join(", "))))
            }
            _ => {
                let args: TeamArgs = parse(&call.arguments)?;
                let messages = teams.check_inbox(&args.team, me)?;
                if messages.is_empty() {
                    return Ok(ToolResult::success("No new messages."));
                }
                Ok(ToolResult::success(
                    messages.iter().map(|m| m.render()).collect::<Vec<_>>().join("\n"),
                ))
            }
        }
    }

    fn team_tools() -> Vec<Tool> {
        let types: Vec<&str> = MessageType::ALL.iter().map(MessageType::as_str).collect();
        vec![
            Tool {
                name: "team_create".to_string(),
                description: "Create a team with you as a member, plus any named members.".to_string(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "members": {"type": "array", "items": {"type": "string"}}
                    },
                    "required": ["name"]
                }),
            },
            Tool {
                name: "team_delete".to_string(),
                description: "Delete a team and every unread message.".to_string(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {"team": {"type": "string"}},
                    "required": ["team"]
                }),
            },
            Tool {
                name: "team_status".to_string(),
                description: "Show members and unread counts for one team or all.".to_string(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {"team": {"type": "string"}}
                }),
            },
            Tool {
                name: "send_message".to_string(),
                description: "Send a message to a team member, or broadcast to all of them.".to_string(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "team": {"type": "string"},
                        "to": {"type": "string", "description": "Recipient; ignored for broadcast"},
                        "type": {"type": "string", "enum": types},
                        "content": {"type": "string"}
                    },
                    "required": ["team", "content"]
                }),
            },
            Tool {
                name: "read_inbox".to_string(),
                description: "Take every unread message addressed to you.".to_string(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {"team": {"type": "string"}},
                    "required": ["team"]
                }),
            },
        ]
    }

    /// Define default tools.
    fn default_tools() -> Vec<Tool> {
        let id_list = serde_json::json!({"type": "array", "items": {"type": "string"}});
        vec![
            Tool {
                name: "task_create".to_string(),
                description: "Create a task on the shared board.".to_string(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "subject": {"type": "string", "description": "Short imperative title"},
                        "description": {"type": "string", "description": "Details"},
                        "activeForm": {"type": "string", "description": "Label shown while in progress, e.g. 'Running tests'"}
                    },
                    "required": ["subject"]
                }),
            },
            Tool {
                name: "task_get".to_string(),
                description: "Show one task in full.".to_string(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {"taskId": {"type": "string"}},
                    "required": ["taskId"]
                }),
            },
            Tool {
                name: "task_update".to_string(),
                description: "Change a task's status, owner, description or dependencies.".to_string(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "taskId": {"type": "string"},
                        "status": {"type": "string", "enum": ["pending", "in_progress", "completed"]},
                        "owner": {"type": "string"},
                        "description": {"type": "string"},
                        "activeForm": {"type": "string"},
                        "addBlockedBy": id_list,
                        "addBlocks": id_list,
                        "removeBlockedBy": id_list,
                        "removeBlocks": id_list
                    },
                    "required": ["taskId"]
                }),
            },
            Tool {
                name: "task_list".to_string(),
                description: "List every task with its status and blockers.".to_string(),
                parameters: serde_json::json!({"type": "object", "properties": {}}),
            },
            Tool {
                name: "task_delete".to_string(),
                description: "Delete a task and drop its dependency edges.".to_string(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {"taskId": {"type": "string"}},
                    "required": ["taskId"]
                }),
            },
            Tool {
                name: "background_run".to_string(),
                description: "Run a shell command in the background. Returns a task id immediately.".to_string(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {"command": {"type": "string", "description": "The command to run"}},
                    "required": ["command"]
                }),
            },
            Tool {
                name: "task_output".to_string(),
                description: "Read a background task's status and output, optionally waiting for it.".to_string(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "task_id": {"type": "string"},
                        "block": {"type": "boolean", "description": "Wait for completion (default true)"},
                        "timeout": {"type": "integer", "description": "Maximum wait in milliseconds"}
                    },
                    "required": ["task_id"]
                }),
            },
            Tool {
                name: "task_stop".to_string(),
                description: "Ask a background task to stop.".to_string(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {"task_id": {"type": "string"}},
                    "required": ["task_id"]
                }),
            },
        ]
    }
}

fn parse<T: DeserializeOwned>(args: &Value) -> Result<T> {
    serde_json::from_value(args.clone()).map_err(|e| Error::Validation(format!("Invalid arguments: {}", e)))
}

fn join_ids(ids: &[TaskId]) -> String {
    ids.iter().map(|id| format!("#{}", id)).collect::<Vec<_>>().join(", ")
}
