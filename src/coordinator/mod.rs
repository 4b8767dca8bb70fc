//! Coordinating loop.
//!
//! Drives a [`DecisionMaker`] over the task board and background executor:
//! 1. Drain the notification bus and inject any completions as a user message
//! 2. Ask the decision maker what to do
//! 3. Run the tool calls it asked for and record their results
//!
//! Background completions are never pushed into the loop mid-cycle. They wait
//! on the bus until the next drain at the top of a cycle.

pub mod decision;
pub mod tools;

pub use decision::{Decision, DecisionMaker, Message, MessageRole};
pub use tools::{Tool, ToolCall, ToolDispatcher, ToolResult};

use crate::config::CoordinatorSettings;
use crate::coordination::notifications::{NotificationBus, render_injection};
use crate::error::Result;

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The decision maker answered without asking for tools.
    Finished { reply: String, cycles: u32 },
    /// The cycle budget ran out first.
    LimitReached { cycles: u32 },
}

/// The drain-and-inject loop.
pub struct Coordinator<D: DecisionMaker> {
    decider: D,
    tools: ToolDispatcher,
    bus: NotificationBus,
    messages: Vec<Message>,
    max_cycles: u32,
}

impl<D: DecisionMaker> Coordinator<D> {
    /// `bus` must be the one the dispatcher's executor publishes on.
    pub fn new(decider: D, tools: ToolDispatcher, bus: NotificationBus, settings: &CoordinatorSettings) -> Self {
        Self {
            decider,
            tools,
            bus,
            messages: Vec::new(),
            max_cycles: settings.max_cycles,
        }
    }

    /// Conversation so far.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn decider(&self) -> &D {
        &self.decider
    }

    /// Run until the decision maker stops calling tools or the budget is spent.
    pub async fn run(&mut self, prompt: &str) -> Result<Outcome> {
        self.messages.push(Message::user(prompt));

        for cycle in 1..=self.max_cycles {
            self.inject_notifications();

            let decision = self
                .decider
                .decide(&self.messages, self.tools.available_tools())
                .await?;
            self.messages
                .push(Message::assistant(decision.content.clone(), decision.tool_calls.clone()));

            if decision.tool_calls.is_empty() {
                log::debug!("Coordinator finished after {} cycle(s)", cycle);
                return Ok(Outcome::Finished {
                    reply: decision.content,
                    cycles: cycle,
                });
            }

            for call in &decision.tool_calls {
                let result = self.tools.execute(call).await;
                if result.is_error {
                    log::debug!("Tool call {} ({}) returned an error", call.id, call.name);
                }
                self.messages.push(Message::tool(call.id.clone(), result.output));
            }
        }

        log::warn!("Coordinator hit its limit of {} cycles", self.max_cycles);
        Ok(Outcome::LimitReached { cycles: self.max_cycles })
    }

    /// Fold pending completions into the conversation. Returns how many were injected.
    pub fn inject_notifications(&mut self) -> usize {
        let events = self.bus.drain();
        if let Some(block) = render_injection(&events) {
            log::info!("Injecting {} background notification(s)", events.len());
            self.messages.push(Message::user(block));
        }
        events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackgroundSettings, StoreSettings};
    use crate::coordinator::decision::MockDecisionMaker;
    use crate::executor::{BackgroundExecutor, BackgroundKind};
    use crate::task::TaskId;
    use crate::task_manager::TaskManager;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        _temp: TempDir,
        tasks: TaskManager,
        background: BackgroundExecutor,
    }

    fn harness() -> Harness {
        let temp = TempDir::new().unwrap();
        let tasks = TaskManager::open(temp.path().join("tasks"), &StoreSettings::default(), "lead").unwrap();
        let background = BackgroundExecutor::new(NotificationBus::new(), BackgroundSettings::default());
        Harness {
            _temp: temp,
            tasks,
            background,
        }
    }

    fn coordinator(h: &Harness, decisions: Vec<Decision>, max_cycles: u32) -> Coordinator<MockDecisionMaker> {
        let tools = ToolDispatcher::new(h.tasks.clone(), h.background.clone(), Duration::from_secs(5));
        Coordinator::new(
            MockDecisionMaker::new(decisions),
            tools,
            h.background.bus().clone(),
            &CoordinatorSettings { max_cycles },
        )
    }

    fn call(id: &str, name: &str, arguments: serde_json::Value) -> ToolCall {
        ToolCall::new(id, name, arguments)
    }

    fn notification_messages(messages: &[Message]) -> usize {
        messages
            .iter()
            .filter(|m| m.role == MessageRole::User && m.content.contains("<task-notification>"))
            .count()
    }

    #[tokio::test]
    async fn test_finishes_without_tools() {
        let h = harness();
        let mut coord = coordinator(&h, vec![Decision::reply("Nothing to do")], 10);

        let outcome = coord.run("hello").await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Finished {
                reply: "Nothing to do".to_string(),
                cycles: 1
            }
        );
        assert_eq!(coord.messages().len(), 2);
    }

    #[tokio::test]
    async fn test_tool_calls_update_board() {
        let h = harness();
        let decisions = vec![
            Decision::with_tool_calls(
                "Planning",
                vec![
                    call("c1", "task_create", json!({"subject": "Design"})),
                    call("c2", "task_create", json!({"subject": "Build"})),
                ],
            ),
            Decision::with_tool_calls(
                "Linking",
                vec![call("c3", "task_update", json!({"taskId": "2", "addBlockedBy": ["1"]}))],
            ),
            Decision::reply("Planned"),
        ];
        let mut coord = coordinator(&h, decisions, 10);

        let outcome = coord.run("plan it").await.unwrap();
        assert!(matches!(outcome, Outcome::Finished { cycles: 3, .. }));
        assert_eq!(h.tasks.list_tasks().unwrap().len(), 2);
        assert!(h.tasks.get_task(&TaskId::from_seq(2)).unwrap().blocked_by.contains(&TaskId::from_seq(1)));

        let tool_messages: Vec<&Message> = coord.messages().iter().filter(|m| m.role == MessageRole::Tool).collect();
        assert_eq!(tool_messages.len(), 3);
        assert_eq!(tool_messages[2].tool_call_id.as_deref(), Some("c3"));
    }

    #[tokio::test]
    async fn test_tool_error_does_not_abort() {
        let h = harness();
        let decisions = vec![
            Decision::with_tool_calls("Look", vec![call("c1", "task_get", json!({"taskId": "99"}))]),
            Decision::reply("It does not exist"),
        ];
        let mut coord = coordinator(&h, decisions, 10);

        let outcome = coord.run("find 99").await.unwrap();
        assert!(matches!(outcome, Outcome::Finished { cycles: 2, .. }));
        let seen = coord.decider().seen(1);
        assert!(seen.last().unwrap().content.contains("task not found"));
    }

    #[tokio::test]
    async fn test_notifications_injected_once() {
        let h = harness();
        let id = h
            .background
            .launch(BackgroundKind::Shell, "build", |_| Ok("build ok".to_string()))
            .unwrap();
        h.background.get_output(&id, true, Duration::from_secs(5)).await.unwrap();

        let decisions = vec![
            Decision::with_tool_calls("Check", vec![call("c1", "task_list", json!({}))]),
            Decision::reply("Done"),
        ];
        let mut coord = coordinator(&h, decisions, 10);
        coord.run("status?").await.unwrap();

        let first = coord.decider().seen(0);
        let injected = first.last().unwrap();
        assert_eq!(injected.role, MessageRole::User);
        assert!(injected.content.contains(&format!("<task-id>{}</task-id>", id)));
        assert!(injected.content.contains("<status>completed</status>"));
        assert!(injected.content.contains("build ok"));

        // The second cycle must not see it again
        assert_eq!(notification_messages(&coord.decider().seen(1)), 1);
        assert_eq!(notification_messages(coord.messages()), 1);
    }

    #[tokio::test]
    async fn test_cycle_limit() {
        let h = harness();
        let looping: Vec<Decision> = (0..10)
            .map(|i| Decision::with_tool_calls("again", vec![call(&format!("c{}", i), "task_list", json!({}))]))
            .collect();
        let mut coord = coordinator(&h, looping, 3);

        assert_eq!(coord.run("loop").await.unwrap(), Outcome::LimitReached { cycles: 3 });
        assert_eq!(coord.decider().seen.lock().unwrap().len(), 3);
    }
}
