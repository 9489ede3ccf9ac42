//! Per-session activity interception.
//!
//! Every store action runs through the same fixed chain:
//!
//! 1. reasoning extraction from completed thought annotations on typing activities
//! 2. typing suppression
//! 3. host-context enrichment of outbound user messages
//! 4. reply capture for programmatic sends
//! 5. plan event consumption
//! 6. pass-through
//!
//! Activities synthesized by stages 1 and 5 re-enter the chain from the top
//! once and are appended after whatever the triggering activity produced.

use std::sync::{Arc, Mutex, MutexGuard};

use copilot_host_activity_schema::{Activity, PlanEvent, CONTEXT_KEY, ROLE_BOT, ROLE_USER};

use crate::host::{HostBinding, HostContext, HostFlag};
use crate::plan::{PlanRegistry, ToolCallDisplay};

/// Actions accepted by a session store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreAction {
    /// Outbound activity on its way to the connection.
    PostActivity(Activity),
    /// Inbound activity on its way to the renderer.
    IncomingActivity(Activity),
    /// Text typed by the user or queued by the host.
    SendMessage { text: String },
}

/// Mutable conversation state owned by exactly one session.
#[derive(Debug, Default)]
pub struct ConversationState {
    pub awaiting_reply: bool,
    pub plans: PlanRegistry,
}

impl ConversationState {
    pub fn reset(&mut self) {
        self.awaiting_reply = false;
        self.plans.clear();
    }
}

#[derive(Clone)]
pub struct ActivityPipeline {
    session_id: String,
    host: Arc<dyn HostBinding>,
    state: Arc<Mutex<ConversationState>>,
}

impl std::fmt::Debug for ActivityPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityPipeline")
            .field("session_id", &self.session_id)
            .finish()
    }
}

impl ActivityPipeline {
    pub fn new(session_id: impl Into<String>, host: Arc<dyn HostBinding>) -> Self {
        Self {
            session_id: session_id.into(),
            host,
            state: Arc::new(Mutex::new(ConversationState::default())),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Marks the session as waiting for the agent's answer to a programmatic send.
    pub fn begin_awaiting_reply(&self) {
        self.lock().awaiting_reply = true;
    }

    pub fn is_awaiting_reply(&self) -> bool {
        self.lock().awaiting_reply
    }

    pub fn plan_count(&self) -> usize {
        self.lock().plans.len()
    }

    pub fn with_plans<R>(&self, f: impl FnOnce(&PlanRegistry) -> R) -> R {
        f(&self.lock().plans)
    }

    /// Discards reply tracking and every plan record.
    pub fn reset(&self) {
        self.lock().reset();
    }

    /// Runs one action through the chain and returns what survives, in order.
    pub fn process(&self, action: StoreAction) -> Vec<StoreAction> {
        match action {
            StoreAction::SendMessage { text } => {
                let activity = Activity {
                    timestamp: Some(now()),
                    ..Activity::message(ROLE_USER, text)
                };
                vec![StoreAction::PostActivity(self.outbound(activity))]
            }
            StoreAction::PostActivity(activity) => {
                vec![StoreAction::PostActivity(self.outbound(activity))]
            }
            StoreAction::IncomingActivity(activity) => {
                let mut survivors = Vec::new();
                self.inbound(activity, true, &mut survivors);
                survivors
                    .into_iter()
                    .map(StoreAction::IncomingActivity)
                    .collect()
            }
        }
    }

    fn outbound(&self, activity: Activity) -> Activity {
        let is_user_message =
            activity.is_message() && matches!(activity.sender_role(), None | Some(ROLE_USER));
        if !is_user_message || !self.host.flag(HostFlag::SendContext) {
            return activity;
        }

        let context = HostContext::snapshot(self.host.as_ref());
        match serde_json::to_value(&context) {
            Ok(value) => {
                tracing::debug!(session_id = %self.session_id, "pipeline: attached host context");
                activity.with_channel_data(CONTEXT_KEY, value)
            }
            Err(err) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    error = %err,
                    "pipeline: failed to serialize host context"
                );
                activity
            }
        }
    }

    fn inbound(&self, activity: Activity, may_inject: bool, survivors: &mut Vec<Activity>) {
        let mut injected = Vec::new();

        if activity.is_typing() {
            if may_inject && self.host.flag(HostFlag::ShowThoughts) {
                injected.extend(reasoning_bubbles(&activity));
            }
            tracing::debug!(
                session_id = %self.session_id,
                bubbles = injected.len(),
                "pipeline: suppressed typing activity"
            );
        } else if activity.is_event() {
            if let Some(summary) = self.consume_event(&activity) {
                if may_inject {
                    injected.push(summary);
                }
            }
        } else {
            self.capture_reply(&activity);
            survivors.push(activity);
        }

        for synthesized in injected {
            self.inbound(synthesized, false, survivors);
        }
    }

    fn capture_reply(&self, activity: &Activity) {
        if !activity.is_message() || !activity.is_from_bot() || activity.is_reasoning() {
            return;
        }
        let Some(text) = activity.text() else {
            return;
        };

        let captured = {
            let mut state = self.lock();
            std::mem::replace(&mut state.awaiting_reply, false)
        };
        if captured {
            tracing::info!(
                session_id = %self.session_id,
                chars = text.len(),
                "pipeline: captured agent reply"
            );
            self.host.raise_agent_response(text);
        }
    }

    fn consume_event(&self, activity: &Activity) -> Option<Activity> {
        let event = match PlanEvent::from_activity(activity) {
            Ok(Some(event)) => event,
            Ok(None) => {
                tracing::debug!(
                    session_id = %self.session_id,
                    name = ?activity.name,
                    "pipeline: consumed unrecognized event"
                );
                return None;
            }
            Err(err) => {
                tracing::debug!(
                    session_id = %self.session_id,
                    name = ?activity.name,
                    error = %err,
                    "pipeline: consumed malformed plan event"
                );
                return None;
            }
        };

        let display = ToolCallDisplay {
            show_tool_calls: self.host.flag(HostFlag::ShowToolCalls),
            show_thoughts: self.host.flag(HostFlag::ShowThoughts),
        };
        let summary = self.lock().plans.apply(event, display)?;
        Some(Activity {
            timestamp: Some(now()),
            ..summary
        })
    }

    fn lock(&self) -> MutexGuard<'_, ConversationState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn reasoning_bubbles(typing: &Activity) -> Vec<Activity> {
    typing
        .entities()
        .iter()
        .filter_map(|entity| entity.completed_thought_text())
        .map(|text| {
            Activity {
                timestamp: Some(now()),
                ..Activity::message(ROLE_BOT, format!("💭 {text}"))
            }
            .tagged_as_reasoning()
        })
        .collect()
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}
