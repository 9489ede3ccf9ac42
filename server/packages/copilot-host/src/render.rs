//! Seam to the chat-rendering collaborator.

use std::sync::{Arc, Mutex};

use copilot_host_error::HostError;
use serde::{Deserialize, Serialize};

use crate::connection::AgentConnection;
use crate::store::SessionStore;

/// Message placed in a tab whose bootstrap failed.
pub const BOOTSTRAP_FAILED_MESSAGE: &str =
    "The Copilot chat could not be started. Close this tab and try again.";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TargetState {
    pub visible: bool,
    pub mounted: bool,
    pub error: Option<String>,
}

/// The area a session paints into. Cloning shares the same underlying target.
#[derive(Debug, Clone)]
pub struct RenderTarget {
    id: String,
    state: Arc<Mutex<TargetState>>,
}

impl RenderTarget {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: Arc::new(Mutex::new(TargetState::default())),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> TargetState {
        self.lock().clone()
    }

    pub fn set_visible(&self, visible: bool) {
        self.lock().visible = visible;
    }

    pub fn is_visible(&self) -> bool {
        self.lock().visible
    }

    pub fn set_mounted(&self, mounted: bool) {
        self.lock().mounted = mounted;
    }

    pub fn is_mounted(&self) -> bool {
        self.lock().mounted
    }

    pub fn show_error(&self, message: &str) {
        self.lock().error = Some(message.to_string());
    }

    pub fn clear_error(&self) {
        self.lock().error = None;
    }

    pub fn error(&self) -> Option<String> {
        self.lock().error.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TargetState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Visual overrides handed to the renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StyleOptions {
    pub accent: String,
    pub background_color: String,
    pub bubble_background: String,
    pub bubble_border_color: String,
    pub bubble_border_radius: u32,
    pub bubble_text_color: String,
    pub bubble_from_user_background: String,
    pub bubble_from_user_border_color: String,
    pub bubble_from_user_border_radius: u32,
    pub bubble_from_user_text_color: String,
    pub bubble_max_width: u32,
    pub bubble_min_width: u32,
    pub bubble_min_height: u32,
    pub send_box_background: String,
    pub send_box_border_radius: u32,
    pub send_box_button_color: String,
    pub send_box_button_color_on_disabled: String,
    pub send_box_height: u32,
    pub send_box_placeholder_color: String,
    pub suggested_action_border_color: String,
    pub suggested_action_border_radius: u32,
    pub suggested_action_text_color: String,
    pub suggested_action_layout: String,
    pub padding_regular: u32,
    pub padding_wide: u32,
    pub group_timestamp: bool,
    pub subtle_color: String,
    pub timestamp_color: String,
    pub root_height: String,
    pub root_width: String,
    pub hide_upload_button: bool,
    pub hide_scroll_to_end_button: bool,
    #[serde(rename = "markdownRenderHTML")]
    pub markdown_render_html: bool,
    pub emoji_set: bool,
}

impl Default for StyleOptions {
    fn default() -> Self {
        Self {
            accent: "#7B68EE".to_string(),
            background_color: "#FFFFFF".to_string(),
            bubble_background: "#F5F5F5".to_string(),
            bubble_border_color: "#E0E0E0".to_string(),
            bubble_border_radius: 12,
            bubble_text_color: "#1A1A1A".to_string(),
            bubble_from_user_background: "#E8E0FF".to_string(),
            bubble_from_user_border_color: "#D4C8FF".to_string(),
            bubble_from_user_border_radius: 12,
            bubble_from_user_text_color: "#1A1A1A".to_string(),
            bubble_max_width: 980,
            bubble_min_width: 120,
            bubble_min_height: 40,
            send_box_background: "#F5F5F5".to_string(),
            send_box_border_radius: 24,
            send_box_button_color: "#7B68EE".to_string(),
            send_box_button_color_on_disabled: "#CCCCCC".to_string(),
            send_box_height: 50,
            send_box_placeholder_color: "#767676".to_string(),
            suggested_action_border_color: "#7B68EE".to_string(),
            suggested_action_border_radius: 20,
            suggested_action_text_color: "#7B68EE".to_string(),
            suggested_action_layout: "flow".to_string(),
            padding_regular: 12,
            padding_wide: 16,
            group_timestamp: false,
            subtle_color: "#767676".to_string(),
            timestamp_color: "#767676".to_string(),
            root_height: "100%".to_string(),
            root_width: "100%".to_string(),
            hide_upload_button: false,
            hide_scroll_to_end_button: false,
            markdown_render_html: true,
            emoji_set: true,
        }
    }
}

pub struct RenderRequest {
    pub target: RenderTarget,
    pub style: StyleOptions,
    pub store: SessionStore,
    pub connection: Arc<dyn AgentConnection>,
}

/// A mounted conversation view. Unmounting releases whatever the renderer
/// holds for the target (timers, store subscriptions).
pub trait RenderedView: Send + Sync {
    /// Called once the session commits this view as its live render. A view
    /// from an abandoned attempt is unmounted without ever being committed.
    fn committed(&self) {}

    fn unmount(self: Box<Self>);
}

pub trait Renderer: Send + Sync + 'static {
    fn render(&self, request: RenderRequest) -> Result<Box<dyn RenderedView>, HostError>;

    fn is_ready(&self) -> bool {
        true
    }
}
