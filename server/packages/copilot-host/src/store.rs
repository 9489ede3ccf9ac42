//! Reducer-style store shared by a session, its renderer and its inbound pump.

use std::sync::Arc;

use copilot_host_activity_schema::Activity;
use copilot_host_error::HostError;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::connection::AgentConnection;
use crate::pipeline::{ActivityPipeline, StoreAction};

const RENDER_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    pipeline: ActivityPipeline,
    connection: Arc<dyn AgentConnection>,
    rendered: broadcast::Sender<Activity>,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("session_id", &self.inner.pipeline.session_id())
            .field("subscribers", &self.inner.rendered.receiver_count())
            .finish()
    }
}

impl SessionStore {
    pub fn new(pipeline: ActivityPipeline, connection: Arc<dyn AgentConnection>) -> Self {
        let (rendered, _rx) = broadcast::channel(RENDER_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(StoreInner {
                pipeline,
                connection,
                rendered,
            }),
        }
    }

    pub fn pipeline(&self) -> &ActivityPipeline {
        &self.inner.pipeline
    }

    /// Activities that survived the pipeline on their way to the renderer.
    pub fn subscribe(&self) -> broadcast::Receiver<Activity> {
        self.inner.rendered.subscribe()
    }

    pub async fn dispatch(&self, action: StoreAction) -> Result<(), HostError> {
        for survivor in self.inner.pipeline.process(action) {
            match survivor {
                StoreAction::PostActivity(activity) => {
                    self.inner.connection.send(activity).await?;
                }
                StoreAction::IncomingActivity(activity) => {
                    let _ = self.inner.rendered.send(activity);
                }
                StoreAction::SendMessage { .. } => {}
            }
        }
        Ok(())
    }

    /// Feeds the connection's inbound stream through the pipeline in arrival
    /// order until the stream ends or the returned pump is dropped.
    pub fn spawn_inbound_pump(&self) -> InboundPump {
        let store = self.clone();
        let mut activities = store.inner.connection.activities();
        let task = tokio::spawn(async move {
            let session_id = store.pipeline().session_id().to_string();
            while let Some(activity) = activities.next().await {
                if let Err(err) = store.dispatch(StoreAction::IncomingActivity(activity)).await {
                    tracing::warn!(session_id = %session_id, error = %err, "pipeline: inbound dispatch failed");
                }
            }
            tracing::debug!(session_id = %session_id, "pipeline: inbound stream ended");
        });
        InboundPump { task }
    }
}

/// Running inbound pump. Dropping it stops the pump.
#[derive(Debug)]
pub struct InboundPump {
    task: JoinHandle<()>,
}

impl Drop for InboundPump {
    fn drop(&mut self) {
        self.task.abort();
    }
}
