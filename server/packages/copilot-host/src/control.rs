//! Entry point the host form drives: wait for collaborators, validate the
//! control parameters, open the first tab.

use std::sync::Arc;

use copilot_host_error::HostError;

use crate::config::HostConfig;
use crate::host::ControlParameters;
use crate::readiness::wait_until_ready;
use crate::registry::{SessionHandle, TabRegistry};
use crate::session::SessionDeps;

#[derive(Debug)]
pub struct CopilotHostControl {
    params: ControlParameters,
    registry: Arc<TabRegistry>,
    initial: Option<SessionHandle>,
}

impl CopilotHostControl {
    pub async fn init(config: &HostConfig, deps: SessionDeps) -> Result<Self, HostError> {
        let renderer = deps.renderer.clone();
        let token_cache = deps.token_cache.clone();
        wait_until_ready(
            || renderer.is_ready() && token_cache.factory().is_ready(),
            config.readiness,
        )
        .await?;

        let params = ControlParameters::read(deps.host.as_ref())?;
        let registry = Arc::new(TabRegistry::new(deps, config.max_sessions));
        let initial = registry.create_session(params.clone());
        tracing::info!(
            environment_id = %params.environment_id,
            agent_id = %params.agent_id,
            max_sessions = registry.max_sessions(),
            "control: initialized"
        );
        Ok(Self {
            params,
            registry,
            initial,
        })
    }

    pub fn params(&self) -> &ControlParameters {
        &self.params
    }

    pub fn registry(&self) -> &Arc<TabRegistry> {
        &self.registry
    }

    /// The first tab's bootstrap, available once.
    pub fn take_initial_bootstrap(&mut self) -> Option<SessionHandle> {
        self.initial.take()
    }

    /// Opens another tab with the control's parameters.
    pub fn create_tab(&self) -> Result<SessionHandle, HostError> {
        self.registry
            .create_session(self.params.clone())
            .ok_or(HostError::SessionLimitReached {
                limit: self.registry.max_sessions(),
            })
    }

    pub fn dispose(&self) {
        let detached = self.registry.dispose_all();
        tracing::info!(detached = detached.len(), "control: disposed");
    }
}
