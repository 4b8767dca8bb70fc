//! CLI argument parsing for taskweave.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "taskweave",
    about = "Shared task board with dependency tracking and background work",
    version,
    after_help = "Logs are written to: <data_dir>/logs/taskweave.log"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create a new task
    Create {
        /// Short imperative title
        subject: String,

        /// Longer description
        #[arg(short, long, default_value = "")]
        description: String,

        /// Label shown while the task is in progress
        #[arg(short, long)]
        active_form: Option<String>,

        /// Tasks that must complete first
        #[arg(short, long = "blocked-by", num_args = 1..)]
        blocked_by: Vec<String>,
    },

    /// Show one task in full
    Show { id: String },

    /// List all tasks
    #[command(alias = "ls")]
    List,

    /// List pending tasks with nothing blocking them
    Ready,

    /// List tasks waiting on prerequisites
    Blocked,

    /// Move a task to in_progress
    Start {
        id: String,

        /// Owner to record instead of the configured agent name
        #[arg(short, long)]
        owner: Option<String>,
    },

    /// Mark a task completed
    Complete { id: String },

    /// Move a task back to pending
    Reopen { id: String },

    /// Make a task wait for one or more prerequisites
    Depend {
        task: String,
        #[arg(required = true)]
        prerequisites: Vec<String>,
    },

    /// Remove dependencies
    Undepend {
        task: String,
        #[arg(required = true)]
        prerequisites: Vec<String>,
    },

    /// Delete a task and its edges
    Delete { id: String },

    /// Verify that every dependency edge is recorded on both tasks
    Check,

    /// Run a shell command in the background and report its notification
    Run {
        command: String,

        /// Milliseconds to wait for completion
        #[arg(short, long)]
        wait: Option<u64>,
    },

    /// Manage teams and their inboxes
    #[command(subcommand)]
    Team(TeamCommand),
}

#[derive(Subcommand)]
pub enum TeamCommand {
    /// Create a team, joining it as the configured agent
    Create {
        name: String,

        /// Other members to add
        members: Vec<String>,
    },

    /// Delete a team and every unread message
    Delete { name: String },

    /// Add a member to a team
    Join { team: String, member: String },

    /// Send a message as the configured agent
    Send {
        team: String,
        content: String,

        /// Recipient (not needed for broadcast)
        #[arg(short, long)]
        to: Option<String>,

        /// message, broadcast, shutdown_request, shutdown_response or plan_approval_response
        #[arg(short = 'k', long = "type", default_value = "message")]
        kind: String,
    },

    /// Read and clear an inbox
    Inbox {
        team: String,

        /// Whose inbox (defaults to the configured agent)
        #[arg(short, long)]
        member: Option<String>,
    },

    /// Show members and unread counts
    Status { team: Option<String> },
}
