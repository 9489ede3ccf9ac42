//! Agent connection over plain HTTP: JSON posts out, server-sent events in.
//!
//! ```text
//! POST   {endpoint}/v1/conversations                    -> {"conversationId": "..."}
//! POST   {endpoint}/v1/conversations/{id}/activities    (activity JSON)
//! GET    {endpoint}/v1/conversations/{id}/activities    text/event-stream of activity JSON
//! DELETE {endpoint}/v1/conversations/{id}
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use copilot_host_activity_schema::Activity;
use copilot_host_error::HostError;
use futures::StreamExt;
use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_stream::wrappers::ReceiverStream;
use url::Url;

use crate::connection::{ActivityStream, AgentConnection, ConnectionFactory, ConnectionSettings};
use crate::BoxFuture;

const INBOUND_BUFFER: usize = 64;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateConversation<'a> {
    environment_id: &'a str,
    agent_identifier: &'a str,
    show_typing: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversationCreated {
    conversation_id: String,
}

#[derive(Debug, Clone)]
pub struct HttpConnectionFactory {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpConnectionFactory {
    pub fn new(endpoint: Url) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint)
    }

    pub fn with_client(client: reqwest::Client, endpoint: Url) -> Self {
        Self { client, endpoint }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn open(&self, settings: ConnectionSettings) -> Result<HttpAgentConnection, HostError> {
        let url = extend(&self.endpoint, &["v1", "conversations"])?;
        let response = self
            .client
            .post(url)
            .bearer_auth(&settings.token)
            .json(&CreateConversation {
                environment_id: &settings.environment_id,
                agent_identifier: &settings.agent_identifier,
                show_typing: settings.show_typing,
            })
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(connection_failed)?;
        let created: ConversationCreated = response.json().await.map_err(connection_failed)?;

        let conversation = extend(
            &self.endpoint,
            &["v1", "conversations", &created.conversation_id],
        )?;
        tracing::info!(
            conversation_id = %created.conversation_id,
            agent_id = %settings.agent_identifier,
            "connection: conversation opened"
        );
        Ok(HttpAgentConnection {
            client: self.client.clone(),
            activities: extend(&conversation, &["activities"])?,
            conversation,
            token: settings.token,
            ended: AtomicBool::new(false),
            readers: Mutex::new(Vec::new()),
        })
    }
}

impl ConnectionFactory for HttpConnectionFactory {
    fn connect(
        &self,
        settings: ConnectionSettings,
    ) -> BoxFuture<'_, Result<Arc<dyn AgentConnection>, HostError>> {
        Box::pin(async move {
            let connection = self.open(settings).await?;
            Ok(Arc::new(connection) as Arc<dyn AgentConnection>)
        })
    }
}

#[derive(Debug)]
pub struct HttpAgentConnection {
    client: reqwest::Client,
    conversation: Url,
    activities: Url,
    token: String,
    ended: AtomicBool,
    readers: Mutex<Vec<AbortHandle>>,
}

impl HttpAgentConnection {
    pub fn conversation_url(&self) -> &Url {
        &self.conversation
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }
}

impl AgentConnection for HttpAgentConnection {
    fn send(&self, activity: Activity) -> BoxFuture<'_, Result<(), HostError>> {
        Box::pin(async move {
            if self.is_ended() {
                return Err(HostError::ConnectionFailed {
                    message: "connection already ended".to_string(),
                });
            }
            self.client
                .post(self.activities.clone())
                .bearer_auth(&self.token)
                .json(&activity)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(connection_failed)?;
            Ok(())
        })
    }

    fn activities(&self) -> ActivityStream {
        if self.is_ended() {
            return Box::pin(futures::stream::empty());
        }

        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        let request = self
            .client
            .get(self.activities.clone())
            .bearer_auth(&self.token)
            .header(ACCEPT, "text/event-stream");
        let url = self.activities.clone();
        let reader = tokio::spawn(async move {
            let response = match request
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
            {
                Ok(response) => response,
                Err(err) => {
                    tracing::warn!(url = %url, error = %err, "connection: failed to open activity stream");
                    return;
                }
            };

            let mut frames = SseFrames::default();
            let mut body = response.bytes_stream();
            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        tracing::warn!(url = %url, error = %err, "connection: activity stream broke");
                        break;
                    }
                };
                for data in frames.push(&chunk) {
                    match serde_json::from_str::<Activity>(&data) {
                        Ok(activity) => {
                            if tx.send(activity).await.is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            tracing::debug!(error = %err, "connection: skipping undecodable activity");
                        }
                    }
                }
            }
        });
        self.readers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(reader.abort_handle());

        Box::pin(ReceiverStream::new(rx))
    }

    fn end(&self) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        for reader in self
            .readers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
        {
            reader.abort();
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(url = %self.conversation, "connection: no runtime to close conversation");
            return;
        };
        let request = self
            .client
            .delete(self.conversation.clone())
            .bearer_auth(&self.token);
        let url = self.conversation.clone();
        runtime.spawn(async move {
            match request
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
            {
                Ok(_) => tracing::debug!(url = %url, "connection: conversation closed"),
                Err(err) => tracing::warn!(url = %url, error = %err, "connection: close failed"),
            }
        });
    }
}

impl Drop for HttpAgentConnection {
    fn drop(&mut self) {
        for reader in self
            .readers
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
        {
            reader.abort();
        }
    }
}

/// Incremental `text/event-stream` decoder yielding each event's data payload.
#[derive(Debug, Default)]
pub struct SseFrames {
    buffer: Vec<u8>,
}

impl SseFrames {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut payloads = Vec::new();
        while let Some((idx, delimiter_len)) = self.next_boundary() {
            let block = self.buffer.drain(..idx + delimiter_len).collect::<Vec<_>>();
            let text = String::from_utf8_lossy(&block);
            let data = text
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|value| value.strip_prefix(' ').unwrap_or(value))
                .collect::<Vec<_>>()
                .join("\n");
            if !data.is_empty() {
                payloads.push(data);
            }
        }
        payloads
    }

    fn next_boundary(&self) -> Option<(usize, usize)> {
        let lf = self
            .buffer
            .windows(2)
            .position(|window| window == b"\n\n")
            .map(|idx| (idx, 2));
        let crlf = self
            .buffer
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
            .map(|idx| (idx, 4));
        match (lf, crlf) {
            (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
            (a, b) => a.or(b),
        }
    }
}

fn extend(base: &Url, segments: &[&str]) -> Result<Url, HostError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| HostError::InvalidRequest {
            message: format!("agent endpoint {base} cannot be a base URL"),
        })?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn connection_failed(err: reqwest::Error) -> HostError {
    HostError::ConnectionFailed {
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_split_across_chunks() {
        let mut frames = SseFrames::default();
        assert!(frames.push(b"event: message\ndata: {\"type\":").is_empty());
        let payloads = frames.push(b"\"typing\"}\n\n: keep-alive\n\ndata:{\"type\":\"message\"}\r\n\r\n");
        assert_eq!(
            payloads,
            vec![
                "{\"type\":\"typing\"}".to_string(),
                "{\"type\":\"message\"}".to_string()
            ]
        );
    }

    #[test]
    fn multi_line_data_is_joined() {
        let mut frames = SseFrames::default();
        let payloads = frames.push(b"data: {\"a\":\ndata: 1}\n\n");
        assert_eq!(payloads, vec!["{\"a\":\n1}".to_string()]);
    }

    #[test]
    fn conversation_urls_keep_base_path() {
        let base = Url::parse("https://agents.example.com/copilot/").expect("url");
        let url = extend(&base, &["v1", "conversations", "a b"]).expect("extend");
        assert_eq!(
            url.as_str(),
            "https://agents.example.com/copilot/v1/conversations/a%20b"
        );
    }
}
