//! Teams of named agents talking through file-backed inboxes.
//!
//! Each team is a directory under the teams root:
//!
//! ```text
//! <root>/<team>/team.json              members and creation time
//! <root>/<team>/inbox/<member>.jsonl   one JSON message per line
//! ```
//!
//! Sending appends to the recipient's inbox and reading drains it, both under
//! the inbox's lock file, so every message is handed out exactly once even
//! when the senders and the reader are different processes.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::StoreSettings;
use crate::coordination::locks::{LockManager, RecordLock};
use crate::error::{Error, Result};
use crate::store::write_atomic;

const TEAM_FILE: &str = "team.json";
const INBOX_DIR: &str = "inbox";
const MAX_NAME_LEN: usize = 64;

/// Kind of a team message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Direct message to one member
    Message,
    /// Sent to every member except the sender
    Broadcast,
    /// Ask a member to wind down
    ShutdownRequest,
    /// Answer to a shutdown request
    ShutdownResponse,
    /// Approve or reject a member's plan
    PlanApprovalResponse,
}

impl MessageType {
    pub const ALL: [MessageType; 5] = [
        MessageType::Message,
        MessageType::Broadcast,
        MessageType::ShutdownRequest,
        MessageType::ShutdownResponse,
        MessageType::PlanApprovalResponse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Message => "message",
            MessageType::Broadcast => "broadcast",
            MessageType::ShutdownRequest => "shutdown_request",
            MessageType::ShutdownResponse => "shutdown_response",
            MessageType::PlanApprovalResponse => "plan_approval_response",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s).ok_or_else(|| {
            let valid: Vec<&str> = Self::ALL.iter().map(MessageType::as_str).collect();
            Error::Validation(format!("invalid message type '{}' (expected one of: {})", s, valid.join(", ")))
        })
    }
}

/// One line of an inbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub from: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl TeamMessage {
    pub fn render(&self) -> String {
        format!("[{}] {}: {}", self.kind, self.from, self.content)
    }
}

/// Team membership as stored in `team.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
    pub name: String,
    pub members: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

/// Creates teams and carries messages between their members.
#[derive(Debug, Clone)]
pub struct TeamManager {
    root: PathBuf,
    locks: LockManager,
}

impl TeamManager {
    /// Open (creating if needed) the teams directory.
    pub fn open(root: impl Into<PathBuf>, settings: &StoreSettings) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| Error::storage(&root, e))?;
        Ok(Self {
            locks: LockManager::new(&root, settings),
            root,
        })
    }

    /// Create an empty team. Fails if the name is taken.
    pub fn create_team(&self, name: &str) -> Result<Team> {
        check_name("team", name)?;
        let dir = self.team_dir(name);

        // Directory creation is the atomic claim on the name
        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::Validation(format!("team '{}' already exists", name)));
            }
            Err(e) => return Err(Error::storage(&dir, e)),
        }
        let inbox = dir.join(INBOX_DIR);
        fs::create_dir(&inbox).map_err(|e| Error::storage(&inbox, e))?;

        let team = Team {
            name: name.to_string(),
            members: BTreeSet::new(),
            created_at: Utc::now(),
        };
        self.write_team(&team)?;

        log::info!("Created team {}", name);
        Ok(team)
    }

    /// Remove a team with its inboxes, read or not.
    pub fn delete_team(&self, name: &str) -> Result<()> {
        check_name("team", name)?;
        let _guard = self.locks.acquire_named(&format!("{}.team", name), name)?;
        self.get_team(name)?;

        let dir = self.team_dir(name);
        fs::remove_dir_all(&dir).map_err(|e| Error::storage(&dir, e))?;
        log::info!("Deleted team {}", name);
        Ok(())
    }

    pub fn get_team(&self, name: &str) -> Result<Team> {
        check_name("team", name)?;
        let path = self.team_dir(name).join(TEAM_FILE);
        let json = match fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(Error::TeamNotFound { name: name.to_string() }),
            Err(e) => return Err(Error::storage(&path, e)),
        };
        Ok(serde_json::from_str(&json)?)
    }

    /// Every team, by name.
    pub fn list_teams(&self) -> Result<Vec<Team>> {
        let entries = fs::read_dir(&self.root).map_err(|e| Error::storage(&self.root, e))?;

        let mut teams = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::storage(&self.root, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            match self.get_team(&name) {
                Ok(team) => teams.push(team),
                // Half-created or removed under us
                Err(Error::TeamNotFound { .. }) => {}
                Err(e) => log::warn!("Skipping unreadable team {}: {}", name, e),
            }
        }
        teams.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(teams)
    }

    /// Add a member. Adding an existing member changes nothing.
    pub fn add_member(&self, team: &str, member: &str) -> Result<Team> {
        check_name("team", team)?;
        check_name("member", member)?;
        let _guard = self.locks.acquire_named(&format!("{}.team", team), team)?;

        let mut record = self.get_team(team)?;
        if record.members.insert(member.to_string()) {
            self.write_team(&record)?;
            log::debug!("Added {} to team {}", member, team);
        }
        Ok(record)
    }

    /// Deliver `content` from `from`.
    ///
    /// A broadcast goes to every member except the sender and ignores `to`;
    /// every other type needs a `to` that is a member. Returns the recipients.
    pub fn send_message(
        &self,
        team: &str,
        from: &str,
        to: Option<&str>,
        kind: MessageType,
        content: &str,
    ) -> Result<Vec<String>> {
        let record = self.get_team(team)?;

        let recipients: Vec<String> = if kind == MessageType::Broadcast {
            record.members.iter().filter(|m| m.as_str() != from).cloned().collect()
        } else {
            let to = to.ok_or_else(|| Error::Validation(format!("a {} needs a recipient", kind)))?;
            if !record.members.contains(to) {
                return Err(not_a_member(to, team));
            }
            vec![to.to_string()]
        };

        let message = TeamMessage {
            kind,
            from: from.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
        };
        let mut line = serde_json::to_string(&message)?;
        line.push('\n');

        for recipient in &recipients {
            let _guard = self.lock_inbox(team, recipient)?;
            let path = self.inbox_path(team, recipient);
            let mut contents = match fs::read_to_string(&path) {
                Ok(existing) => existing,
                Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
                Err(e) => return Err(Error::storage(&path, e)),
            };
            contents.push_str(&line);
            write_atomic(&path, contents.as_bytes())?;
        }

        log::debug!("{} sent {} to {:?} in team {}", from, kind, recipients, team);
        Ok(recipients)
    }

    /// Take every pending message for `member`, oldest first, leaving the inbox empty.
    pub fn check_inbox(&self, team: &str, member: &str) -> Result<Vec<TeamMessage>> {
        if !self.get_team(team)?.members.contains(member) {
            return Err(not_a_member(member, team));
        }

        let _guard = self.lock_inbox(team, member)?;
        let path = self.inbox_path(team, member);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::storage(&path, e)),
        };
        fs::remove_file(&path).map_err(|e| Error::storage(&path, e))?;

        let messages = contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<TeamMessage>(line) {
                Ok(message) => Some(message),
                Err(e) => {
                    log::warn!("Dropping malformed message in {}: {}", path.display(), e);
                    None
                }
            })
            .collect();
        Ok(messages)
    }

    /// Human-readable summary of one team, or all of them.
    pub fn status(&self, team: Option<&str>) -> Result<String> {
        let teams = match team {
            Some(name) => vec![self.get_team(name)?],
            None => self.list_teams()?,
        };
        if teams.is_empty() {
            return Ok("No teams.".to_string());
        }

        let mut lines = Vec::new();
        for team in &teams {
            lines.push(format!("Team {}: {} member(s)", team.name, team.members.len()));
            for member in &team.members {
                lines.push(format!("  - {} ({} unread)", member, self.unread(&team.name, member)));
            }
        }
        Ok(lines.join("\n"))
    }

    fn unread(&self, team: &str, member: &str) -> usize {
        fs::read_to_string(self.inbox_path(team, member))
            .map(|s| s.lines().filter(|l| !l.trim().is_empty()).count())
            .unwrap_or(0)
    }

    fn write_team(&self, team: &Team) -> Result<()> {
        let json = serde_json::to_string_pretty(team)?;
        write_atomic(&self.team_dir(&team.name).join(TEAM_FILE), json.as_bytes())
    }

    fn lock_inbox(&self, team: &str, member: &str) -> Result<RecordLock> {
        self.locks
            .acquire_named(&format!("{}/{}/{}", team, INBOX_DIR, member), &format!("{}/{}", team, member))
    }

    fn team_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn inbox_path(&self, team: &str, member: &str) -> PathBuf {
        self.team_dir(team).join(INBOX_DIR).join(format!("{}.jsonl", member))
    }
}

/// Names become path components, so keep them to a safe alphabet.
fn check_name(what: &str, name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "invalid {} name '{}': use letters, digits, '-' or '_'",
            what, name
        )))
    }
}

fn not_a_member(member: &str, team: &str) -> Error {
    Error::Validation(format!("'{}' is not a member of team '{}'", member, team))
}
