//! Ordered set of tabs with exactly one active session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use copilot_host_error::HostError;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::connection::AgentConnection;
use crate::host::ControlParameters;
use crate::render::BOOTSTRAP_FAILED_MESSAGE;
use crate::session::{Session, SessionDeps, SessionPhase};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TabInfo {
    pub id: String,
    pub name: String,
    pub active: bool,
    pub phase: SessionPhase,
    pub initialized: bool,
    pub restarting: bool,
}

/// A freshly created tab and its running bootstrap.
#[derive(Debug)]
pub struct SessionHandle {
    pub id: String,
    pub bootstrap: JoinHandle<Result<(), HostError>>,
}

pub enum CloseOutcome {
    /// Removed. Carries the connection if the session kept it alive.
    Closed {
        detached: Option<Arc<dyn AgentConnection>>,
    },
    LastSession,
    NotFound,
}

impl std::fmt::Debug for CloseOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed { detached } => f
                .debug_struct("Closed")
                .field("detached", &detached.is_some())
                .finish(),
            Self::LastSession => f.write_str("LastSession"),
            Self::NotFound => f.write_str("NotFound"),
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<String, Arc<Session>>,
    order: Vec<String>,
    next_number: u64,
}

pub struct TabRegistry {
    deps: SessionDeps,
    max_sessions: usize,
    active: watch::Sender<Option<String>>,
    inner: Mutex<RegistryInner>,
}

impl std::fmt::Debug for TabRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TabRegistry")
            .field("max_sessions", &self.max_sessions)
            .field("tabs", &self.len())
            .field("active", &self.active_id())
            .finish()
    }
}

impl TabRegistry {
    pub fn new(deps: SessionDeps, max_sessions: usize) -> Self {
        let (active, _rx) = watch::channel(None);
        Self {
            deps,
            max_sessions: max_sessions.max(1),
            active,
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_id(&self) -> Option<String> {
        self.active.borrow().clone()
    }

    pub fn active_session(&self) -> Option<Arc<Session>> {
        let id = self.active_id()?;
        self.session(&id)
    }

    pub fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.lock().sessions.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.lock().order.clone()
    }

    pub fn list(&self) -> Vec<TabInfo> {
        let active = self.active_id();
        let inner = self.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.sessions.get(id))
            .map(|session| TabInfo {
                id: session.id().to_string(),
                name: session.name(),
                active: active.as_deref() == Some(session.id()),
                phase: session.phase(),
                initialized: session.is_initialized(),
                restarting: session.is_restarting(),
            })
            .collect()
    }

    /// Opens a new tab, makes it active and starts its bootstrap in the
    /// background. Returns `None` at the session ceiling.
    pub fn create_session(&self, params: ControlParameters) -> Option<SessionHandle> {
        let session = {
            let mut inner = self.lock();
            if inner.order.len() >= self.max_sessions {
                tracing::warn!(
                    tab_count = inner.order.len(),
                    limit = self.max_sessions,
                    "registry: session limit reached"
                );
                return None;
            }
            inner.next_number += 1;
            let number = inner.next_number;
            let session = Arc::new(Session::new(
                format!("tab-{number}"),
                format!("Chat {number}"),
                params,
                self.deps.clone(),
                self.active.subscribe(),
            ));
            inner.order.push(session.id().to_string());
            inner
                .sessions
                .insert(session.id().to_string(), session.clone());
            tracing::info!(
                session_id = %session.id(),
                tab_count = inner.order.len(),
                "registry: created tab"
            );
            self.activate(&inner, session.id());
            session
        };

        let id = session.id().to_string();
        let bootstrap = tokio::spawn(async move {
            let result = session.bootstrap().await;
            match &result {
                Ok(()) => {}
                Err(err) if err.is_silent() => {}
                Err(err) => {
                    tracing::error!(session_id = %session.id(), error = %err, "registry: tab failed to start");
                    session.target().show_error(BOOTSTRAP_FAILED_MESSAGE);
                }
            }
            result
        });
        Some(SessionHandle { id, bootstrap })
    }

    /// Makes `id` the active, and only visible, tab. Unknown ids are ignored.
    pub fn switch_active(&self, id: &str) -> bool {
        let inner = self.lock();
        if !inner.sessions.contains_key(id) {
            return false;
        }
        self.activate(&inner, id);
        true
    }

    /// Active id and visibility only change under the registry lock.
    fn activate(&self, inner: &RegistryInner, id: &str) {
        for (session_id, session) in &inner.sessions {
            session.target().set_visible(session_id == id);
        }
        self.active.send_replace(Some(id.to_string()));
        tracing::debug!(session_id = %id, "registry: switched active tab");
    }

    /// Disposes and removes a tab. The last remaining tab is never closed.
    pub fn close_session(&self, id: &str) -> CloseOutcome {
        let (session, neighbor) = {
            let mut inner = self.lock();
            let Some(index) = inner.order.iter().position(|existing| existing == id) else {
                return CloseOutcome::NotFound;
            };
            if inner.order.len() == 1 {
                tracing::debug!(session_id = %id, "registry: refusing to close last tab");
                return CloseOutcome::LastSession;
            }
            inner.order.remove(index);
            let session = inner.sessions.remove(id);
            let neighbor = inner.order[index.min(inner.order.len() - 1)].clone();
            (session, neighbor)
        };

        let detached = session.and_then(|session| session.dispose());
        {
            let inner = self.lock();
            if self.active_id().as_deref() == Some(id) && inner.sessions.contains_key(&neighbor) {
                self.activate(&inner, &neighbor);
            }
        }
        tracing::info!(session_id = %id, tab_count = self.len(), "registry: closed tab");
        CloseOutcome::Closed { detached }
    }

    /// Renames a tab and returns the name in effect. Blank names keep the
    /// previous one.
    pub fn rename(&self, id: &str, name: &str) -> Result<String, HostError> {
        let session = self.session(id).ok_or_else(|| HostError::SessionNotFound {
            session_id: id.to_string(),
        })?;
        let trimmed = name.trim();
        if !trimmed.is_empty() {
            session.set_name(trimmed.to_string());
        }
        Ok(session.name())
    }

    pub async fn restart_session(&self, id: &str) -> Result<(), HostError> {
        let session = self.session(id).ok_or_else(|| HostError::SessionNotFound {
            session_id: id.to_string(),
        })?;
        session.restart().await
    }

    /// Disposes every tab. Used when the control itself goes away.
    pub fn dispose_all(&self) -> Vec<Arc<dyn AgentConnection>> {
        let sessions = {
            let mut inner = self.lock();
            let order = std::mem::take(&mut inner.order);
            let mut sessions = std::mem::take(&mut inner.sessions);
            self.active.send_replace(None);
            order
                .into_iter()
                .filter_map(|id| sessions.remove(&id))
                .collect::<Vec<_>>()
        };
        tracing::info!(tab_count = sessions.len(), "registry: disposing all tabs");
        sessions
            .into_iter()
            .filter_map(|session| session.dispose())
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
