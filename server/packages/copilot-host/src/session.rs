//! One conversation tab.
//!
//! A session moves `Idle -> Authenticating -> Connecting -> Rendering -> Live`
//! and back to `Idle` through `Disposing`. Every bootstrap attempt and every
//! dispose bumps the generation counter; an attempt that finds the counter
//! moved after one of its suspension points drops its results and reports
//! [`HostError::StaleAttempt`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use copilot_host_error::HostError;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::connection::{AgentConnection, ConnectionFactory, ConnectionSettings};
use crate::host::{ControlParameters, HostBinding, HostFlag};
use crate::pipeline::{ActivityPipeline, StoreAction};
use crate::render::{
    RenderRequest, RenderTarget, RenderedView, Renderer, StyleOptions, BOOTSTRAP_FAILED_MESSAGE,
};
use crate::store::{InboundPump, SessionStore};
use crate::token_cache::TokenCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Idle,
    Authenticating,
    Connecting,
    Rendering,
    Live,
    Disposing,
}

/// Collaborators shared by every session of a control.
#[derive(Clone)]
pub struct SessionDeps {
    pub token_cache: Arc<TokenCache>,
    pub connections: Arc<dyn ConnectionFactory>,
    pub renderer: Arc<dyn Renderer>,
    pub host: Arc<dyn HostBinding>,
    pub style: StyleOptions,
}

#[derive(Default)]
struct SessionInner {
    phase: Option<SessionPhase>,
    connection: Option<Arc<dyn AgentConnection>>,
    store: Option<SessionStore>,
    view: Option<Box<dyn RenderedView>>,
    pump: Option<InboundPump>,
    subscription: Option<PendingMessageSubscription>,
    keep_alive_on_dispose: bool,
    initialized: bool,
}

pub struct Session {
    id: String,
    name: Mutex<String>,
    params: ControlParameters,
    target: RenderTarget,
    deps: SessionDeps,
    pipeline: ActivityPipeline,
    active: watch::Receiver<Option<String>>,
    generation: AtomicU64,
    restarting: AtomicBool,
    inner: Mutex<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("phase", &self.phase())
            .field("generation", &self.generation())
            .finish()
    }
}

impl Session {
    /// `active` carries the id of the registry's active session; pending
    /// messages are only consumed while it names this session.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        params: ControlParameters,
        deps: SessionDeps,
        active: watch::Receiver<Option<String>>,
    ) -> Self {
        let id = id.into();
        Self {
            pipeline: ActivityPipeline::new(id.clone(), deps.host.clone()),
            target: RenderTarget::new(id.clone()),
            name: Mutex::new(name.into()),
            id,
            params,
            deps,
            active,
            generation: AtomicU64::new(0),
            restarting: AtomicBool::new(false),
            inner: Mutex::new(SessionInner::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> String {
        self.name
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn set_name(&self, name: String) {
        *self
            .name
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = name;
    }

    pub fn params(&self) -> &ControlParameters {
        &self.params
    }

    pub fn target(&self) -> &RenderTarget {
        &self.target
    }

    pub fn pipeline(&self) -> &ActivityPipeline {
        &self.pipeline
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> SessionPhase {
        self.lock().phase.unwrap_or(SessionPhase::Idle)
    }

    pub fn is_live(&self) -> bool {
        self.phase() == SessionPhase::Live
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().initialized
    }

    pub fn is_restarting(&self) -> bool {
        self.restarting.load(Ordering::SeqCst)
    }

    pub fn keep_alive_on_dispose(&self) -> bool {
        self.lock().keep_alive_on_dispose
    }

    pub fn connection(&self) -> Option<Arc<dyn AgentConnection>> {
        self.lock().connection.clone()
    }

    pub fn store(&self) -> Option<SessionStore> {
        self.lock().store.clone()
    }

    /// Acquires a token, opens a connection, renders and subscribes to
    /// pending messages. Failures leave the session non-Live; a concurrent
    /// dispose or newer bootstrap turns this attempt into `StaleAttempt`.
    ///
    /// An initialized session is torn down first, ending its connection.
    pub async fn bootstrap(&self) -> Result<(), HostError> {
        if self.is_initialized() {
            tracing::debug!(session_id = %self.id, "session: replacing live conversation");
            self.teardown(false);
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let started = Instant::now();
        tracing::info!(session_id = %self.id, generation, "session: bootstrap started");
        self.enter(generation, SessionPhase::Authenticating)?;

        let token = self
            .deps
            .token_cache
            .acquire_token(&self.params.app_client_id, &self.params.tenant_id)
            .await;
        self.ensure_current(generation)?;
        let token = token.map_err(|err| self.failed(generation, err))?;

        self.enter(generation, SessionPhase::Connecting)?;
        let connection = self
            .deps
            .connections
            .connect(ConnectionSettings {
                token,
                environment_id: self.params.environment_id.clone(),
                agent_identifier: self.params.agent_id.clone(),
                show_typing: false,
            })
            .await;
        if let Err(stale) = self.ensure_current(generation) {
            if let Ok(connection) = connection {
                connection.end();
            }
            return Err(stale);
        }
        let connection = connection.map_err(|err| self.failed(generation, err))?;

        self.enter(generation, SessionPhase::Rendering)?;
        let store = SessionStore::new(self.pipeline.clone(), connection.clone());
        let view = match self.deps.renderer.render(RenderRequest {
            target: self.target.clone(),
            style: self.deps.style.clone(),
            store: store.clone(),
            connection: connection.clone(),
        }) {
            Ok(view) => view,
            Err(err) => {
                connection.end();
                let err = match err {
                    HostError::RenderFailed { .. } => err,
                    other => HostError::RenderFailed {
                        message: other.to_string(),
                    },
                };
                return Err(self.failed(generation, err));
            }
        };

        let mut inner = self.lock();
        if self.generation() != generation {
            drop(inner);
            view.unmount();
            connection.end();
            return Err(self.stale(generation));
        }
        view.committed();
        inner.pump = Some(store.spawn_inbound_pump());
        inner.subscription = Some(PendingMessageSubscription::spawn(
            self.id.clone(),
            self.deps.host.clone(),
            self.active.clone(),
            store.clone(),
        ));
        inner.connection = Some(connection);
        inner.store = Some(store);
        inner.view = Some(view);
        inner.keep_alive_on_dispose = self.deps.host.flag(HostFlag::KeepConnectionAlive);
        inner.initialized = true;
        inner.phase = Some(SessionPhase::Live);
        drop(inner);

        self.target.set_mounted(true);
        self.target.clear_error();
        tracing::info!(
            session_id = %self.id,
            generation,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "session: live"
        );
        Ok(())
    }

    /// Tears the session down in order: pending-message subscription,
    /// generation, mounted view, connection, conversation state.
    ///
    /// Returns the connection when `KeepConnectionAlive` was set as the
    /// session went live; it is detached but not ended.
    pub fn dispose(&self) -> Option<Arc<dyn AgentConnection>> {
        self.teardown(true)
    }

    /// Tears down and bootstraps again. The connection is always ended.
    ///
    /// Concurrent restarts fail with `RestartInProgress`; a failed restart
    /// leaves the fixed failure message in the target.
    pub async fn restart(&self) -> Result<(), HostError> {
        let Some(_guard) = RestartGuard::acquire(&self.restarting) else {
            tracing::debug!(session_id = %self.id, "session: restart already in progress");
            return Err(HostError::RestartInProgress {
                session_id: self.id.clone(),
            });
        };

        tracing::info!(session_id = %self.id, "session: restarting");
        self.teardown(false);
        self.target.clear_error();
        match self.bootstrap().await {
            Ok(()) => Ok(()),
            Err(err) if err.is_silent() => Err(err),
            Err(err) => {
                tracing::error!(session_id = %self.id, error = %err, "session: restart failed");
                self.target.show_error(BOOTSTRAP_FAILED_MESSAGE);
                Err(err)
            }
        }
    }

    fn teardown(&self, honor_keep_alive: bool) -> Option<Arc<dyn AgentConnection>> {
        let mut inner = self.lock();
        inner.phase = Some(SessionPhase::Disposing);

        inner.subscription.take();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        inner.pump.take();
        if let Some(view) = inner.view.take() {
            view.unmount();
        }
        self.target.set_mounted(false);

        let keep_alive = honor_keep_alive && inner.keep_alive_on_dispose;
        let detached = match inner.connection.take() {
            Some(connection) if keep_alive => Some(connection),
            Some(connection) => {
                connection.end();
                None
            }
            None => None,
        };
        inner.store = None;
        self.pipeline.reset();

        inner.initialized = false;
        inner.keep_alive_on_dispose = false;
        inner.phase = Some(SessionPhase::Idle);
        tracing::info!(
            session_id = %self.id,
            generation,
            detached = detached.is_some(),
            "session: disposed"
        );
        detached
    }

    fn enter(&self, generation: u64, phase: SessionPhase) -> Result<(), HostError> {
        let mut inner = self.lock();
        if self.generation() != generation {
            drop(inner);
            return Err(self.stale(generation));
        }
        inner.phase = Some(phase);
        Ok(())
    }

    fn ensure_current(&self, generation: u64) -> Result<(), HostError> {
        if self.generation() == generation {
            Ok(())
        } else {
            Err(self.stale(generation))
        }
    }

    fn stale(&self, generation: u64) -> HostError {
        tracing::debug!(
            session_id = %self.id,
            generation,
            current = self.generation(),
            "session: abandoning stale bootstrap"
        );
        HostError::StaleAttempt { generation }
    }

    fn failed(&self, generation: u64, err: HostError) -> HostError {
        let mut inner = self.lock();
        if self.generation() == generation {
            inner.phase = Some(SessionPhase::Idle);
        }
        drop(inner);
        tracing::warn!(session_id = %self.id, generation, error = %err, "session: bootstrap failed");
        err
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Clears the restart flag on every exit path.
struct RestartGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RestartGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for RestartGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Observer of the host's `PendingMessage` field. Dropping it unsubscribes.
struct PendingMessageSubscription {
    task: JoinHandle<()>,
}

impl PendingMessageSubscription {
    fn spawn(
        session_id: String,
        host: Arc<dyn HostBinding>,
        mut active: watch::Receiver<Option<String>>,
        store: SessionStore,
    ) -> Self {
        let task = tokio::spawn(async move {
            let mut pending = host.pending_messages();
            loop {
                let has_text = !pending.borrow_and_update().trim().is_empty();
                let is_active = active.borrow_and_update().as_deref() == Some(session_id.as_str());
                // Another tab may win the take after an active switch.
                if let Some(text) = (is_active && has_text)
                    .then(|| host.take_pending_message())
                    .flatten()
                {
                    store.pipeline().begin_awaiting_reply();
                    tracing::info!(session_id = %session_id, "session: sending pending message");
                    if let Err(err) = store.dispatch(StoreAction::SendMessage { text }).await {
                        tracing::warn!(session_id = %session_id, error = %err, "session: pending message send failed");
                    }
                }
                let woke = tokio::select! {
                    changed = pending.changed() => changed,
                    changed = active.changed() => changed,
                };
                if woke.is_err() {
                    break;
                }
            }
        });
        Self { task }
    }
}

impl Drop for PendingMessageSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}
