//! Renderer that keeps each target's conversation as a replayable transcript
//! instead of painting it. The bridge server streams it to headless hosts.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use copilot_host_activity_schema::Activity;
use copilot_host_error::HostError;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::render::{RenderRequest, RenderedView, Renderer};

const RING_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptEntry {
    pub sequence: u64,
    pub activity: Activity,
}

#[derive(Debug)]
struct Transcript {
    ring: Mutex<VecDeque<TranscriptEntry>>,
    sender: broadcast::Sender<TranscriptEntry>,
    sequence: AtomicU64,
}

impl Transcript {
    fn new() -> Self {
        let (sender, _rx) = broadcast::channel(256);
        Self {
            ring: Mutex::new(VecDeque::with_capacity(RING_BUFFER_SIZE)),
            sender,
            sequence: AtomicU64::new(0),
        }
    }

    fn ring(&self) -> MutexGuard<'_, VecDeque<TranscriptEntry>> {
        self.ring
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, activity: Activity) {
        let entry = TranscriptEntry {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            activity,
        };
        let mut ring = self.ring();
        ring.push_back(entry.clone());
        while ring.len() > RING_BUFFER_SIZE {
            ring.pop_front();
        }
        // Sent under the ring lock so a subscriber never sees an entry both
        // replayed and live.
        let _ = self.sender.send(entry);
    }

    /// Starts a new conversation. Sequence numbers keep increasing so
    /// reconnecting clients never confuse the two.
    fn clear(&self) {
        self.ring().clear();
    }

    fn subscribe(
        &self,
        after: Option<u64>,
    ) -> (Vec<TranscriptEntry>, broadcast::Receiver<TranscriptEntry>) {
        let ring = self.ring();
        let replay = ring
            .iter()
            .filter(|entry| after.map_or(true, |after| entry.sequence > after))
            .cloned()
            .collect();
        (replay, self.sender.subscribe())
    }
}

#[derive(Debug, Default)]
pub struct TranscriptRenderer {
    transcripts: Mutex<HashMap<String, Arc<Transcript>>>,
}

impl TranscriptRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries recorded after `after` plus a receiver for what follows.
    /// Subscribing before the target is rendered waits for its first render.
    pub fn subscribe(
        &self,
        target_id: &str,
        after: Option<u64>,
    ) -> (Vec<TranscriptEntry>, broadcast::Receiver<TranscriptEntry>) {
        self.transcript(target_id).subscribe(after)
    }

    pub fn entries(&self, target_id: &str) -> Vec<TranscriptEntry> {
        self.lock()
            .get(target_id)
            .map(|transcript| transcript.subscribe(None).0)
            .unwrap_or_default()
    }

    /// Drops a closed tab's transcript.
    pub fn forget(&self, target_id: &str) {
        self.lock().remove(target_id);
    }

    fn transcript(&self, target_id: &str) -> Arc<Transcript> {
        self.lock()
            .entry(target_id.to_string())
            .or_insert_with(|| Arc::new(Transcript::new()))
            .clone()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Transcript>>> {
        self.transcripts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Renderer for TranscriptRenderer {
    fn render(&self, request: RenderRequest) -> Result<Box<dyn RenderedView>, HostError> {
        let target_id = request.target.id().to_string();
        let transcript = self.transcript(&target_id);

        let mut rx = request.store.subscribe();
        let recorder = transcript.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(activity) => recorder.record(activity),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "transcript: renderer lagged behind store");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Box::new(TranscriptView {
            target_id,
            transcript,
            forwarder,
        }))
    }
}

struct TranscriptView {
    target_id: String,
    transcript: Arc<Transcript>,
    forwarder: JoinHandle<()>,
}

impl RenderedView for TranscriptView {
    fn committed(&self) {
        self.transcript.clear();
        tracing::debug!(target_id = %self.target_id, "transcript: mounted");
    }

    fn unmount(self: Box<Self>) {
        self.forwarder.abort();
        tracing::debug!(target_id = %self.target_id, "transcript: unmounted");
    }
}
