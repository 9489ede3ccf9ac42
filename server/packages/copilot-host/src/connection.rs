use std::pin::Pin;
use std::sync::Arc;

use copilot_host_activity_schema::Activity;
use copilot_host_error::HostError;
use futures::Stream;

use crate::BoxFuture;

/// Inbound activities in arrival order.
pub type ActivityStream = Pin<Box<dyn Stream<Item = Activity> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub token: String,
    pub environment_id: String,
    pub agent_identifier: String,
    /// Ask the backend not to synthesize its own typing indicators.
    pub show_typing: bool,
}

/// Bidirectional activity stream to the agent backend.
pub trait AgentConnection: Send + Sync + 'static {
    fn send(&self, activity: Activity) -> BoxFuture<'_, Result<(), HostError>>;

    /// Subscribes to inbound activities. The stream ends when the connection does.
    fn activities(&self) -> ActivityStream;

    /// Releases server-side resources. Safe to call more than once.
    fn end(&self);
}

pub trait ConnectionFactory: Send + Sync + 'static {
    fn connect(
        &self,
        settings: ConnectionSettings,
    ) -> BoxFuture<'_, Result<Arc<dyn AgentConnection>, HostError>>;
}
