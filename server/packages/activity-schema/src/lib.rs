//! Wire shapes of the streamed conversation protocol.
//!
//! Activities are kept close to the JSON the agent backend emits: unknown
//! top-level fields survive a deserialize/serialize cycle untouched so that
//! pass-through activities reach the renderer exactly as they arrived.

use std::fmt;

use schemars::gen::SchemaGenerator;
use schemars::schema::{RootSchema, Schema};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod plan;

pub use plan::{
    DynamicPlanReceived, DynamicPlanStepTriggered, PlanEvent, ToolDefinition, PLAN_RECEIVED,
    PLAN_STEP_TRIGGERED,
};

pub const ROLE_BOT: &str = "bot";
pub const ROLE_USER: &str = "user";

pub const ENTITY_THOUGHT: &str = "thought";
pub const THOUGHT_STATUS_COMPLETE: &str = "complete";

/// `channelData` key marking synthesized reasoning output.
pub const REASONING_TAG: &str = "isToolThought";
/// `channelData` key carrying the host context snapshot on outbound messages.
pub const CONTEXT_KEY: &str = "context";

pub const ADAPTIVE_CARD_CONTENT_TYPE: &str = "application/vnd.microsoft.card.adaptive";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActivityType {
    Message,
    Typing,
    Event,
    Other(String),
}

impl ActivityType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Message => "message",
            Self::Typing => "typing",
            Self::Event => "event",
            Self::Other(value) => value.as_str(),
        }
    }
}

impl From<String> for ActivityType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "message" => Self::Message,
            "typing" => Self::Typing,
            "event" => Self::Event,
            _ => Self::Other(value),
        }
    }
}

impl From<ActivityType> for String {
    fn from(value: ActivityType) -> Self {
        match value {
            ActivityType::Other(value) => value,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl JsonSchema for ActivityType {
    fn schema_name() -> String {
        "ActivityType".to_string()
    }

    fn json_schema(gen: &mut SchemaGenerator) -> Schema {
        String::json_schema(gen)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ChannelAccount {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl ChannelAccount {
    pub fn with_role(role: &str) -> Self {
        Self {
            role: Some(role.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Entity {
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten, default)]
    pub extra: Map<String, Value>,
}

impl Entity {
    /// A finished reasoning annotation with something to show.
    pub fn completed_thought_text(&self) -> Option<&str> {
        if self.entity_type != ENTITY_THOUGHT {
            return None;
        }
        if self.status.as_deref() != Some(THOUGHT_STATUS_COMPLETE) {
            return None;
        }
        self.text.as_deref().filter(|text| !text.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Attachment {
    pub fn adaptive_card(content: Value) -> Self {
        Self {
            content_type: ADAPTIVE_CARD_CONTENT_TYPE.to_string(),
            content,
            name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    #[serde(rename = "type")]
    pub activity_type: ActivityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<ChannelAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entities: Option<Vec<Entity>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_data: Option<Map<String, Value>>,
    #[serde(flatten, default)]
    pub extra: Map<String, Value>,
}

impl Activity {
    pub fn new(activity_type: ActivityType) -> Self {
        Self {
            activity_type,
            id: None,
            timestamp: None,
            from: None,
            text: None,
            name: None,
            value: None,
            entities: None,
            attachments: None,
            channel_data: None,
            extra: Map::new(),
        }
    }

    pub fn message(role: &str, text: impl Into<String>) -> Self {
        Self {
            from: Some(ChannelAccount::with_role(role)),
            text: Some(text.into()),
            ..Self::new(ActivityType::Message)
        }
    }

    pub fn event(name: impl Into<String>, value: Value) -> Self {
        Self {
            from: Some(ChannelAccount::with_role(ROLE_BOT)),
            name: Some(name.into()),
            value: Some(value),
            ..Self::new(ActivityType::Event)
        }
    }

    pub fn typing(entities: Vec<Entity>) -> Self {
        Self {
            from: Some(ChannelAccount::with_role(ROLE_BOT)),
            entities: Some(entities),
            ..Self::new(ActivityType::Typing)
        }
    }

    pub fn is_message(&self) -> bool {
        self.activity_type == ActivityType::Message
    }

    pub fn is_typing(&self) -> bool {
        self.activity_type == ActivityType::Typing
    }

    pub fn is_event(&self) -> bool {
        self.activity_type == ActivityType::Event
    }

    pub fn sender_role(&self) -> Option<&str> {
        self.from.as_ref().and_then(|from| from.role.as_deref())
    }

    pub fn is_from_bot(&self) -> bool {
        self.sender_role() == Some(ROLE_BOT)
    }

    /// Non-empty message text, if any.
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref().filter(|text| !text.is_empty())
    }

    pub fn is_reasoning(&self) -> bool {
        self.channel_data
            .as_ref()
            .and_then(|data| data.get(REASONING_TAG))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn tagged_as_reasoning(mut self) -> Self {
        self.channel_data
            .get_or_insert_with(Map::new)
            .insert(REASONING_TAG.to_string(), Value::Bool(true));
        self
    }

    pub fn entities(&self) -> &[Entity] {
        self.entities.as_deref().unwrap_or(&[])
    }

    /// Copy of this activity with `key` set in its side-channel data.
    pub fn with_channel_data(&self, key: &str, value: Value) -> Self {
        let mut copy = self.clone();
        copy.channel_data
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value);
        copy
    }
}

pub fn activity_json_schema() -> RootSchema {
    schemars::schema_for!(Activity)
}
