//! Dynamic-plan correlation.
//!
//! Each plan identifier moves `Unregistered -> Registered -> CardEmitted`.
//! Step events keep rewriting tool reasoning after the card is out; the card
//! itself is emitted at most once per plan.

use std::collections::HashMap;

use copilot_host_activity_schema::{
    Activity, Attachment, DynamicPlanReceived, DynamicPlanStepTriggered, PlanEvent, ROLE_BOT,
};
use serde_json::{json, Value};

pub const PLACEHOLDER_REASONING: &str = "Waiting for agent reasoning...";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallEntry {
    pub index: usize,
    pub prefix: String,
    pub description: String,
    pub identifier: Option<String>,
    pub reasoning: String,
}

impl ToolCallEntry {
    pub fn has_reasoning(&self) -> bool {
        self.reasoning != PLACEHOLDER_REASONING && !self.reasoning.is_empty()
    }

    /// Correlation is a substring join: the step's task dialog id embeds the
    /// tool identifier.
    fn matches(&self, task_dialog_id: &str) -> bool {
        self.identifier
            .as_deref()
            .is_some_and(|identifier| !identifier.is_empty() && task_dialog_id.contains(identifier))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanRecord {
    pub tools: Vec<ToolCallEntry>,
    pub card_emitted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanPhase {
    Unregistered,
    Registered,
    CardEmitted,
}

/// Host switches read when a step arrives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ToolCallDisplay {
    pub show_tool_calls: bool,
    /// Per-step reasoning bubbles are on; the summary is flattened to text.
    pub show_thoughts: bool,
}

#[derive(Debug, Default)]
pub struct PlanRegistry {
    plans: HashMap<String, PlanRecord>,
}

impl PlanRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self, plan_id: &str) -> PlanPhase {
        match self.plans.get(plan_id) {
            None => PlanPhase::Unregistered,
            Some(record) if record.card_emitted => PlanPhase::CardEmitted,
            Some(_) => PlanPhase::Registered,
        }
    }

    pub fn get(&self, plan_id: &str) -> Option<&PlanRecord> {
        self.plans.get(plan_id)
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    pub fn clear(&mut self) {
        self.plans.clear();
    }

    /// Applies a decoded plan event and returns the summary activity to
    /// inject, if this event is the one that emits it.
    pub fn apply(&mut self, event: PlanEvent, mode: ToolCallDisplay) -> Option<Activity> {
        match event {
            PlanEvent::Received(plan) => {
                self.register(plan);
                None
            }
            PlanEvent::StepTriggered(step) => self.record_step(&step, mode),
        }
    }

    /// Registers a plan. The first registration for an identifier wins;
    /// returns `false` when the plan was already known.
    pub fn register(&mut self, plan: DynamicPlanReceived) -> bool {
        if self.plans.contains_key(&plan.plan_identifier) {
            tracing::debug!(plan_id = %plan.plan_identifier, "plan: duplicate registration ignored");
            return false;
        }

        let tools = plan
            .tool_definitions
            .iter()
            .enumerate()
            .map(|(index, tool)| ToolCallEntry {
                index,
                prefix: tool.display_prefix().to_string(),
                description: tool.description.clone().unwrap_or_default(),
                identifier: tool.identifier.clone(),
                reasoning: PLACEHOLDER_REASONING.to_string(),
            })
            .collect::<Vec<_>>();

        tracing::info!(
            plan_id = %plan.plan_identifier,
            tools = tools.len(),
            "plan: registered"
        );
        self.plans.insert(
            plan.plan_identifier,
            PlanRecord {
                tools,
                card_emitted: false,
            },
        );
        true
    }

    pub fn record_step(
        &mut self,
        step: &DynamicPlanStepTriggered,
        mode: ToolCallDisplay,
    ) -> Option<Activity> {
        let Some(record) = self.plans.get_mut(&step.plan_identifier) else {
            tracing::debug!(plan_id = %step.plan_identifier, "plan: step for unknown plan");
            return None;
        };

        let thought = step.thought.clone().unwrap_or_default();
        if let Some(task_dialog_id) = step.task_dialog_id.as_deref() {
            for tool in record.tools.iter_mut().filter(|tool| tool.matches(task_dialog_id)) {
                tool.reasoning = thought.clone();
            }
        }

        if record.card_emitted || record.tools.is_empty() || !mode.show_tool_calls {
            tracing::debug!(plan_id = %step.plan_identifier, thought = %thought, "plan: step recorded");
            return None;
        }

        record.card_emitted = true;
        let flattened = mode.show_thoughts;
        tracing::info!(
            plan_id = %step.plan_identifier,
            tools = record.tools.len(),
            flattened,
            "plan: emitting tool-call summary"
        );

        let summary = if mode.show_thoughts {
            Activity::message(ROLE_BOT, tool_call_text(&record.tools))
        } else {
            Activity {
                attachments: Some(vec![Attachment::adaptive_card(tool_call_card(
                    &record.tools,
                ))]),
                text: None,
                ..Activity::message(ROLE_BOT, "")
            }
        };
        Some(summary.tagged_as_reasoning())
    }
}

/// Adaptive Card with one collapsible reasoning section per tool.
pub fn tool_call_card(tools: &[ToolCallEntry]) -> Value {
    let mut body = vec![json!({
        "type": "TextBlock",
        "text": "🔧 Tool Call",
        "weight": "Bolder",
        "size": "Small"
    })];

    body.extend(tools.iter().map(|tool| {
        json!({
            "type": "Container",
            "spacing": "Small",
            "separator": true,
            "items": [
                {
                    "type": "ColumnSet",
                    "columns": [
                        {
                            "type": "Column",
                            "width": "auto",
                            "items": [{"type": "TextBlock", "text": "⚡", "size": "Small"}]
                        },
                        {
                            "type": "Column",
                            "width": "stretch",
                            "items": [
                                {
                                    "type": "TextBlock",
                                    "text": tool.prefix,
                                    "weight": "Bolder",
                                    "wrap": true,
                                    "size": "Small"
                                },
                                {
                                    "type": "TextBlock",
                                    "text": tool.description,
                                    "isSubtle": true,
                                    "spacing": "None",
                                    "wrap": true,
                                    "size": "Small"
                                }
                            ]
                        }
                    ]
                },
                {
                    "type": "ActionSet",
                    "spacing": "Small",
                    "actions": [{
                        "type": "Action.ShowCard",
                        "title": "💭 Show Thoughts",
                        "card": {
                            "type": "AdaptiveCard",
                            "body": [{
                                "type": "TextBlock",
                                "text": tool.reasoning,
                                "wrap": true,
                                "size": "Small",
                                "isSubtle": true
                            }]
                        }
                    }]
                }
            ]
        })
    }));

    json!({
        "$schema": "https://adaptivecards.io/schemas/adaptive-card.json",
        "type": "AdaptiveCard",
        "version": "1.6",
        "body": body
    })
}

/// Markdown summary used instead of the card when reasoning bubbles are on.
pub fn tool_call_text(tools: &[ToolCallEntry]) -> String {
    let mut paragraphs = vec!["🔧 **Tool Call**".to_string()];
    for tool in tools {
        paragraphs.push(format!("⚡ **{}** — {}", tool.prefix, tool.description));
        if tool.has_reasoning() {
            paragraphs.push(format!("💭 {}", tool.reasoning));
        }
    }
    paragraphs.join("\n\n")
}
