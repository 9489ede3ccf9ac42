//! The host form's binding surface.
//!
//! The host exposes read-only fields, boolean switches that are read at the
//! moment a decision is made, one observed `PendingMessage` field and one
//! outbound callback slot for captured agent replies.

use std::collections::HashMap;
use std::sync::RwLock;

use copilot_host_error::HostError;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostField {
    AppClientId,
    TenantId,
    EnvironmentId,
    AgentIdentifier,
    UserId,
    UserLanguage,
    UserTimeZone,
    CallingMethod,
    LegalEntity,
    CurrentFormName,
    CurrentMenuItem,
    FormMode,
    TableName,
    NaturalKey,
    NaturalValue,
}

impl HostField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AppClientId => "AppClientId",
            Self::TenantId => "TenantId",
            Self::EnvironmentId => "EnvironmentId",
            Self::AgentIdentifier => "AgentIdentifier",
            Self::UserId => "UserId",
            Self::UserLanguage => "UserLanguage",
            Self::UserTimeZone => "UserTimeZone",
            Self::CallingMethod => "CallingMethod",
            Self::LegalEntity => "LegalEntity",
            Self::CurrentFormName => "CurrentFormName",
            Self::CurrentMenuItem => "CurrentMenuItem",
            Self::FormMode => "FormMode",
            Self::TableName => "TableName",
            Self::NaturalKey => "NaturalKey",
            Self::NaturalValue => "NaturalValue",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostFlag {
    SendContext,
    ShowToolCalls,
    ShowThoughts,
    KeepConnectionAlive,
}

/// Binding between the component and the host form.
pub trait HostBinding: Send + Sync + 'static {
    fn peek(&self, field: HostField) -> Option<String>;

    fn flag(&self, flag: HostFlag) -> bool;

    /// Observes `PendingMessage`. An empty string means nothing is pending.
    fn pending_messages(&self) -> watch::Receiver<String>;

    /// Takes a non-blank `PendingMessage` and resets the field in one step,
    /// so the host can queue the next send. Of several concurrent callers
    /// only one receives a given message.
    fn take_pending_message(&self) -> Option<String>;

    /// The `RaiseAgentResponse` callback slot.
    fn raise_agent_response(&self, text: &str);
}

/// Validated `{appClientId, tenantId, environmentId, agentId}` tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlParameters {
    pub app_client_id: String,
    pub tenant_id: String,
    pub environment_id: String,
    pub agent_id: String,
}

impl ControlParameters {
    pub fn read(host: &dyn HostBinding) -> Result<Self, HostError> {
        let mut missing = Vec::new();
        let mut required = |field: HostField| match host.peek(field) {
            Some(value) if !value.trim().is_empty() => value,
            _ => {
                missing.push(field.as_str().to_string());
                String::new()
            }
        };

        let params = Self {
            app_client_id: required(HostField::AppClientId),
            tenant_id: required(HostField::TenantId),
            environment_id: required(HostField::EnvironmentId),
            agent_id: required(HostField::AgentIdentifier),
        };

        if !missing.is_empty() {
            tracing::warn!(missing = ?missing, "host: required control parameters are missing");
            return Err(HostError::Validation { missing });
        }
        Ok(params)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentRecord {
    pub table_name: Option<String>,
    pub natural_key: Option<String>,
    pub natural_value: Option<String>,
}

/// Snapshot of the host context attached to outbound user messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostContext {
    pub current_user: Option<String>,
    pub user_language: Option<String>,
    pub user_time_zone: Option<String>,
    pub calling_method: Option<String>,
    pub legal_entity: Option<String>,
    pub current_form: Option<String>,
    pub current_menu_item: Option<String>,
    pub form_mode: Option<String>,
    pub current_record: CurrentRecord,
}

impl HostContext {
    pub fn snapshot(host: &dyn HostBinding) -> Self {
        Self {
            current_user: host.peek(HostField::UserId),
            user_language: host.peek(HostField::UserLanguage),
            user_time_zone: host.peek(HostField::UserTimeZone),
            calling_method: host.peek(HostField::CallingMethod),
            legal_entity: host.peek(HostField::LegalEntity),
            current_form: host.peek(HostField::CurrentFormName),
            current_menu_item: host.peek(HostField::CurrentMenuItem),
            form_mode: host.peek(HostField::FormMode),
            current_record: CurrentRecord {
                table_name: host.peek(HostField::TableName),
                natural_key: host.peek(HostField::NaturalKey),
                natural_value: host.peek(HostField::NaturalValue),
            },
        }
    }
}

/// Thread-safe binding backed by plain memory, used by the bridge server.
#[derive(Debug)]
pub struct InMemoryHostBinding {
    fields: RwLock<HashMap<HostField, String>>,
    flags: RwLock<HashMap<HostFlag, bool>>,
    pending: watch::Sender<String>,
    responses: broadcast::Sender<String>,
}

impl Default for InMemoryHostBinding {
    fn default() -> Self {
        let (pending, _rx) = watch::channel(String::new());
        let (responses, _rx) = broadcast::channel(64);
        Self {
            fields: RwLock::new(HashMap::new()),
            flags: RwLock::new(HashMap::new()),
            pending,
            responses,
        }
    }
}

impl InMemoryHostBinding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parameters(params: &ControlParameters) -> Self {
        let binding = Self::new();
        binding.set_field(HostField::AppClientId, &params.app_client_id);
        binding.set_field(HostField::TenantId, &params.tenant_id);
        binding.set_field(HostField::EnvironmentId, &params.environment_id);
        binding.set_field(HostField::AgentIdentifier, &params.agent_id);
        binding
    }

    pub fn set_field(&self, field: HostField, value: &str) {
        self.fields
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(field, value.to_string());
    }

    pub fn set_flag(&self, flag: HostFlag, value: bool) {
        self.flags
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(flag, value);
    }

    /// Host side of `PendingMessage`: queue a programmatic send.
    pub fn set_pending_message(&self, text: &str) {
        self.pending.send_replace(text.to_string());
    }

    pub fn pending_message(&self) -> String {
        self.pending.borrow().clone()
    }

    pub fn subscribe_responses(&self) -> broadcast::Receiver<String> {
        self.responses.subscribe()
    }
}

impl HostBinding for InMemoryHostBinding {
    fn peek(&self, field: HostField) -> Option<String> {
        self.fields
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&field)
            .cloned()
    }

    fn flag(&self, flag: HostFlag) -> bool {
        self.flags
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&flag)
            .copied()
            .unwrap_or(false)
    }

    fn pending_messages(&self) -> watch::Receiver<String> {
        self.pending.subscribe()
    }

    fn take_pending_message(&self) -> Option<String> {
        let mut taken = None;
        self.pending.send_if_modified(|pending| {
            if pending.trim().is_empty() {
                return false;
            }
            taken = Some(std::mem::take(pending));
            true
        });
        taken
    }

    fn raise_agent_response(&self, text: &str) {
        tracing::info!(chars = text.len(), "host: raising agent response");
        let _ = self.responses.send(text.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_complete_parameters() {
        let host = InMemoryHostBinding::new();
        host.set_field(HostField::AppClientId, "app");
        host.set_field(HostField::TenantId, "tenant");
        host.set_field(HostField::EnvironmentId, "env");
        host.set_field(HostField::AgentIdentifier, "agent");

        let params = ControlParameters::read(&host).expect("params");
        assert_eq!(params.agent_id, "agent");
    }

    #[test]
    fn blank_parameters_count_as_missing() {
        let host = InMemoryHostBinding::new();
        host.set_field(HostField::AppClientId, "app");
        host.set_field(HostField::TenantId, "   ");

        match ControlParameters::read(&host) {
            Err(HostError::Validation { missing }) => {
                assert_eq!(missing, vec!["TenantId", "EnvironmentId", "AgentIdentifier"]);
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn context_snapshot_uses_wire_names() {
        let host = InMemoryHostBinding::new();
        host.set_field(HostField::UserId, "admin");
        host.set_field(HostField::LegalEntity, "USMF");
        host.set_field(HostField::TableName, "CustTable");

        let value = serde_json::to_value(HostContext::snapshot(&host)).expect("serialize");
        assert_eq!(value["currentUser"], "admin");
        assert_eq!(value["legalEntity"], "USMF");
        assert_eq!(value["currentRecord"]["tableName"], "CustTable");
        assert!(value["currentRecord"]["naturalKey"].is_null());
    }

    #[test]
    fn pending_message_is_taken_once() {
        let host = InMemoryHostBinding::new();
        let rx = host.pending_messages();
        host.set_pending_message("post the invoice");
        assert_eq!(*rx.borrow(), "post the invoice");

        assert_eq!(host.take_pending_message().as_deref(), Some("post the invoice"));
        assert_eq!(host.pending_message(), "");
        assert_eq!(host.take_pending_message(), None);
    }

    #[test]
    fn blank_pending_message_is_left_in_place() {
        let host = InMemoryHostBinding::new();
        host.set_pending_message("   ");
        assert_eq!(host.take_pending_message(), None);
        assert_eq!(host.pending_message(), "   ");
    }
}
