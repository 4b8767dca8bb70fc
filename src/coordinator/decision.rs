//! Decision-maker abstraction for the coordinating loop.
//!
//! The collaborator that chooses what to do next (in practice a language
//! model) sits behind [`DecisionMaker`]. The loop hands it the conversation
//! and the tools on offer; it answers with text and zero or more tool calls.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::coordinator::tools::{Tool, ToolCall};
use crate::error::Result;

/// Role of a message in the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    /// Tool result.
    Tool,
}

/// A single message in the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    /// Tool calls made in this message (assistant messages).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Tool call this message answers (tool messages).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }
}

/// One answer from the decision maker.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Text content of the response.
    pub content: String,
    /// Tool calls to execute before the next cycle.
    pub tool_calls: Vec<ToolCall>,
}

impl Decision {
    /// A final answer with no further actions.
    pub fn reply(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    /// An answer that asks for tools to run.
    pub fn with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            content: content.into(),
            tool_calls,
        }
    }
}

/// The collaborator that decides the coordinator's next step.
#[async_trait]
pub trait DecisionMaker: Send + Sync {
    async fn decide(&self, messages: &[Message], tools: &[Tool]) -> Result<Decision>;
}

/// Scripted decision maker for testing.
#[cfg(test)]
pub struct MockDecisionMaker {
    /// Decisions to return in order.
    pub decisions: std::sync::Mutex<Vec<Decision>>,
    /// Conversation passed to each call.
    pub seen: std::sync::Mutex<Vec<Vec<Message>>>,
}

#[cfg(test)]
impl MockDecisionMaker {
    pub fn new(decisions: Vec<Decision>) -> Self {
        Self {
            decisions: std::sync::Mutex::new(decisions),
            seen: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Conversation as it looked on call `n` (zero based).
    pub fn seen(&self, n: usize) -> Vec<Message> {
        self.seen.lock().unwrap()[n].clone()
    }
}

#[cfg(test)]
#[async_trait]
impl DecisionMaker for MockDecisionMaker {
    async fn decide(&self, messages: &[Message], _tools: &[Tool]) -> Result<Decision> {
        self.seen.lock().unwrap().push(messages.to_vec());
        let mut decisions = self.decisions.lock().unwrap();
        if decisions.is_empty() {
            Ok(Decision::reply("No more mock decisions"))
        } else {
            Ok(decisions.remove(0))
        }
    }
}
