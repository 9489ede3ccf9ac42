//! Scripted collaborators for exercising sessions without a real identity
//! provider, agent backend or chat renderer.
//!
//! Each mock can hold its asynchronous step open behind a [`Gate`] so tests
//! can interleave disposes and restarts with in-flight bootstraps.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use copilot_host_activity_schema::Activity;
use copilot_host_error::HostError;
use futures::StreamExt;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::connection::{ActivityStream, AgentConnection, ConnectionFactory, ConnectionSettings};
use crate::render::{RenderRequest, RenderedView, Renderer};
use crate::token_cache::{
    Account, IdentityClient, IdentityClientConfig, IdentityClientFactory, IdentityError,
    TokenRequest,
};
use crate::BoxFuture;

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const POLL_BUDGET: Duration = Duration::from_secs(2);

/// Polls `condition` until it holds or two seconds pass. Returns whether it held.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + POLL_BUDGET;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// One-shot barrier. Every waiter is released together.
#[derive(Debug, Clone)]
pub struct Gate {
    open: Arc<watch::Sender<bool>>,
}

impl Default for Gate {
    fn default() -> Self {
        let (open, _rx) = watch::channel(false);
        Self {
            open: Arc::new(open),
        }
    }
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn release(&self) {
        self.open.send_replace(true);
    }

    pub async fn wait(&self) {
        let mut rx = self.open.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

async fn pass(gate: Option<Gate>) {
    if let Some(gate) = gate {
        gate.wait().await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
pub struct MockIdentityScript {
    pub initialize: Result<(), IdentityError>,
    pub accounts: Vec<Account>,
    pub silent: Result<String, IdentityError>,
    pub interactive: Result<String, IdentityError>,
}

impl Default for MockIdentityScript {
    fn default() -> Self {
        Self {
            initialize: Ok(()),
            accounts: vec![Account {
                home_account_id: "user.tenant".to_string(),
                username: Some("user@contoso.com".to_string()),
            }],
            silent: Ok("silent-token".to_string()),
            interactive: Ok("interactive-token".to_string()),
        }
    }
}

#[derive(Debug, Default)]
struct IdentityCounters {
    initializations: AtomicUsize,
    silent_calls: AtomicUsize,
    interactive_calls: AtomicUsize,
}

#[derive(Debug)]
pub struct MockIdentityFactory {
    script: Mutex<MockIdentityScript>,
    init_gate: Mutex<Option<Gate>>,
    token_gate: Arc<Mutex<Option<Gate>>>,
    authorities: Mutex<Vec<String>>,
    created: AtomicUsize,
    ready: AtomicBool,
    counters: Arc<IdentityCounters>,
}

impl MockIdentityFactory {
    pub fn new(script: MockIdentityScript) -> Self {
        Self {
            script: Mutex::new(script),
            init_gate: Mutex::new(None),
            token_gate: Arc::new(Mutex::new(None)),
            authorities: Mutex::new(Vec::new()),
            created: AtomicUsize::new(0),
            ready: AtomicBool::new(true),
            counters: Arc::new(IdentityCounters::default()),
        }
    }

    /// Script used by clients created from now on.
    pub fn set_script(&self, script: MockIdentityScript) {
        *lock(&self.script) = script;
    }

    /// Holds `initialize` on clients created from now on until the gate opens.
    pub fn hold_initialization(&self) -> Gate {
        let gate = Gate::new();
        *lock(&self.init_gate) = Some(gate.clone());
        gate
    }

    /// Holds every token acquisition, including on clients already cached,
    /// until the gate opens.
    pub fn hold_tokens(&self) -> Gate {
        let gate = Gate::new();
        *lock(&self.token_gate) = Some(gate.clone());
        gate
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn initializations(&self) -> usize {
        self.counters.initializations.load(Ordering::SeqCst)
    }

    pub fn silent_calls(&self) -> usize {
        self.counters.silent_calls.load(Ordering::SeqCst)
    }

    pub fn interactive_calls(&self) -> usize {
        self.counters.interactive_calls.load(Ordering::SeqCst)
    }

    pub fn authorities(&self) -> Vec<String> {
        lock(&self.authorities).clone()
    }
}

impl IdentityClientFactory for MockIdentityFactory {
    fn create(&self, config: &IdentityClientConfig) -> Arc<dyn IdentityClient> {
        self.created.fetch_add(1, Ordering::SeqCst);
        lock(&self.authorities).push(config.authority.clone());
        Arc::new(MockIdentityClient {
            script: lock(&self.script).clone(),
            init_gate: lock(&self.init_gate).clone(),
            token_gate: self.token_gate.clone(),
            counters: self.counters.clone(),
        })
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

struct MockIdentityClient {
    script: MockIdentityScript,
    init_gate: Option<Gate>,
    token_gate: Arc<Mutex<Option<Gate>>>,
    counters: Arc<IdentityCounters>,
}

impl IdentityClient for MockIdentityClient {
    fn initialize(&self) -> BoxFuture<'_, Result<(), IdentityError>> {
        Box::pin(async move {
            self.counters.initializations.fetch_add(1, Ordering::SeqCst);
            pass(self.init_gate.clone()).await;
            self.script.initialize.clone()
        })
    }

    fn accounts(&self) -> Vec<Account> {
        self.script.accounts.clone()
    }

    fn acquire_token_silent<'a>(
        &'a self,
        _request: &'a TokenRequest,
        _account: &'a Account,
    ) -> BoxFuture<'a, Result<String, IdentityError>> {
        Box::pin(async move {
            self.counters.silent_calls.fetch_add(1, Ordering::SeqCst);
            let gate = lock(&self.token_gate).clone();
            pass(gate).await;
            self.script.silent.clone()
        })
    }

    fn acquire_token_interactive<'a>(
        &'a self,
        _request: &'a TokenRequest,
    ) -> BoxFuture<'a, Result<String, IdentityError>> {
        Box::pin(async move {
            self.counters.interactive_calls.fetch_add(1, Ordering::SeqCst);
            let gate = lock(&self.token_gate).clone();
            pass(gate).await;
            self.script.interactive.clone()
        })
    }
}

#[derive(Debug, Default)]
pub struct MockConnectionFactory {
    settings: Mutex<Vec<ConnectionSettings>>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
    gate: Mutex<Option<Gate>>,
    failure: Mutex<Option<HostError>>,
}

impl MockConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Holds every `connect` until the gate opens.
    pub fn hold_connections(&self) -> Gate {
        let gate = Gate::new();
        *lock(&self.gate) = Some(gate.clone());
        gate
    }

    pub fn fail_with(&self, error: HostError) {
        *lock(&self.failure) = Some(error);
    }

    pub fn succeed(&self) {
        *lock(&self.failure) = None;
    }

    /// Settings of every `connect` call, including failed ones.
    pub fn settings(&self) -> Vec<ConnectionSettings> {
        lock(&self.settings).clone()
    }

    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        lock(&self.connections).clone()
    }

    pub fn last_connection(&self) -> Option<Arc<MockConnection>> {
        lock(&self.connections).last().cloned()
    }
}

impl ConnectionFactory for MockConnectionFactory {
    fn connect(
        &self,
        settings: ConnectionSettings,
    ) -> BoxFuture<'_, Result<Arc<dyn AgentConnection>, HostError>> {
        Box::pin(async move {
            lock(&self.settings).push(settings);
            let gate = lock(&self.gate).clone();
            pass(gate).await;
            if let Some(error) = lock(&self.failure).clone() {
                return Err(error);
            }
            let connection = Arc::new(MockConnection::new());
            lock(&self.connections).push(connection.clone());
            Ok(connection as Arc<dyn AgentConnection>)
        })
    }
}

/// In-memory agent connection. Inbound activities are pushed by the test;
/// outbound ones are recorded.
#[derive(Debug)]
pub struct MockConnection {
    inbound: Mutex<Option<broadcast::Sender<Activity>>>,
    sent: Mutex<Vec<Activity>>,
    ends: AtomicUsize,
}

impl Default for MockConnection {
    fn default() -> Self {
        let (inbound, _rx) = broadcast::channel(64);
        Self {
            inbound: Mutex::new(Some(inbound)),
            sent: Mutex::new(Vec::new()),
            ends: AtomicUsize::new(0),
        }
    }
}

impl MockConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers an activity to current subscribers. Returns how many received it.
    pub fn push(&self, activity: Activity) -> usize {
        lock(&self.inbound)
            .as_ref()
            .and_then(|sender| sender.send(activity).ok())
            .unwrap_or(0)
    }

    pub fn subscribers(&self) -> usize {
        lock(&self.inbound)
            .as_ref()
            .map(broadcast::Sender::receiver_count)
            .unwrap_or(0)
    }

    pub fn sent(&self) -> Vec<Activity> {
        lock(&self.sent).clone()
    }

    pub fn is_ended(&self) -> bool {
        self.ends.load(Ordering::SeqCst) > 0
    }

    pub fn end_calls(&self) -> usize {
        self.ends.load(Ordering::SeqCst)
    }
}

impl AgentConnection for MockConnection {
    fn send(&self, activity: Activity) -> BoxFuture<'_, Result<(), HostError>> {
        Box::pin(async move {
            if self.is_ended() {
                return Err(HostError::ConnectionFailed {
                    message: "connection ended".to_string(),
                });
            }
            lock(&self.sent).push(activity);
            Ok(())
        })
    }

    fn activities(&self) -> ActivityStream {
        match lock(&self.inbound).as_ref() {
            Some(sender) => Box::pin(
                BroadcastStream::new(sender.subscribe())
                    .filter_map(|item| async move { item.ok() }),
            ),
            None => Box::pin(futures::stream::empty()),
        }
    }

    fn end(&self) {
        self.ends.fetch_add(1, Ordering::SeqCst);
        lock(&self.inbound).take();
    }
}

#[derive(Debug, Default)]
struct RenderLog {
    renders: AtomicUsize,
    unmounts: AtomicUsize,
    rendered: Mutex<Vec<Activity>>,
    targets: Mutex<Vec<String>>,
}

/// Renderer that records what reaches it instead of painting anything.
#[derive(Debug)]
pub struct RecordingRenderer {
    log: Arc<RenderLog>,
    fail: AtomicBool,
    ready: AtomicBool,
}

impl Default for RecordingRenderer {
    fn default() -> Self {
        Self {
            log: Arc::new(RenderLog::default()),
            fail: AtomicBool::new(false),
            ready: AtomicBool::new(true),
        }
    }
}

impl RecordingRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_renders(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn renders(&self) -> usize {
        self.log.renders.load(Ordering::SeqCst)
    }

    pub fn unmounts(&self) -> usize {
        self.log.unmounts.load(Ordering::SeqCst)
    }

    /// Renders currently mounted.
    pub fn mounted(&self) -> usize {
        self.renders().saturating_sub(self.unmounts())
    }

    pub fn targets(&self) -> Vec<String> {
        lock(&self.log.targets).clone()
    }

    /// Every activity that reached a mounted view, across all targets.
    pub fn rendered(&self) -> Vec<Activity> {
        lock(&self.log.rendered).clone()
    }
}

impl Renderer for RecordingRenderer {
    fn render(&self, request: RenderRequest) -> Result<Box<dyn RenderedView>, HostError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(HostError::RenderFailed {
                message: "scripted render failure".to_string(),
            });
        }
        self.log.renders.fetch_add(1, Ordering::SeqCst);
        lock(&self.log.targets).push(request.target.id().to_string());

        let log = self.log.clone();
        let mut rx = request.store.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(activity) => lock(&log.rendered).push(activity),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Box::new(RecordingView {
            log: self.log.clone(),
            task,
        }))
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

struct RecordingView {
    log: Arc<RenderLog>,
    task: JoinHandle<()>,
}

impl RenderedView for RecordingView {
    fn unmount(self: Box<Self>) {
        self.task.abort();
        self.log.unmounts.fetch_add(1, Ordering::SeqCst);
    }
}
