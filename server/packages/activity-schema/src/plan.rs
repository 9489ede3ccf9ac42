use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Activity;

pub const PLAN_RECEIVED: &str = "DynamicPlanReceived";
pub const PLAN_STEP_TRIGGERED: &str = "DynamicPlanStepTriggered";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_identifier_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ToolDefinition {
    /// Label shown for the tool: the model-facing prefix, else the display name.
    pub fn display_prefix(&self) -> &str {
        self.llm_identifier_prefix
            .as_deref()
            .or(self.display_name.as_deref())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DynamicPlanReceived {
    pub plan_identifier: String,
    #[serde(default)]
    pub tool_definitions: Vec<ToolDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DynamicPlanStepTriggered {
    pub plan_identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_dialog_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlanEvent {
    Received(DynamicPlanReceived),
    StepTriggered(DynamicPlanStepTriggered),
}

impl PlanEvent {
    /// Decodes a dynamic-plan event activity.
    ///
    /// Returns `Ok(None)` for anything that is not a recognized plan event with
    /// a value, and an error when a recognized event carries a malformed value.
    pub fn from_activity(activity: &Activity) -> Result<Option<Self>, serde_json::Error> {
        if !activity.is_event() {
            return Ok(None);
        }
        let Some(value) = activity.value.clone() else {
            return Ok(None);
        };
        match activity.name.as_deref() {
            Some(PLAN_RECEIVED) => Ok(Some(Self::Received(serde_json::from_value(value)?))),
            Some(PLAN_STEP_TRIGGERED) => {
                Ok(Some(Self::StepTriggered(serde_json::from_value(value)?)))
            }
            _ => Ok(None),
        }
    }

    pub fn plan_identifier(&self) -> &str {
        match self {
            Self::Received(plan) => &plan.plan_identifier,
            Self::StepTriggered(step) => &step.plan_identifier,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn decodes_plan_received() {
        let activity = Activity::event(
            PLAN_RECEIVED,
            json!({
                "planIdentifier": "p1",
                "toolDefinitions": [
                    {"identifier": "t1", "displayName": "Lookup", "description": "look up record"}
                ]
            }),
        );
        let Some(PlanEvent::Received(plan)) =
            PlanEvent::from_activity(&activity).expect("decode")
        else {
            panic!("expected plan received");
        };
        assert_eq!(plan.plan_identifier, "p1");
        assert_eq!(plan.tool_definitions[0].display_prefix(), "Lookup");
    }

    #[test]
    fn unrelated_events_and_missing_values_are_ignored() {
        let other = Activity::event("startConversation", json!({}));
        assert_eq!(PlanEvent::from_activity(&other).expect("decode"), None);

        let mut no_value = Activity::event(PLAN_STEP_TRIGGERED, json!({}));
        no_value.value = None;
        assert_eq!(PlanEvent::from_activity(&no_value).expect("decode"), None);
    }

    #[test]
    fn malformed_plan_values_are_errors() {
        let activity = Activity::event(PLAN_STEP_TRIGGERED, json!({"thought": "x"}));
        assert!(PlanEvent::from_activity(&activity).is_err());
    }
}
