#![allow(dead_code)]

use std::sync::Arc;

use copilot_host::host::{ControlParameters, HostFlag, InMemoryHostBinding};
use copilot_host::registry::TabRegistry;
use copilot_host::render::StyleOptions;
use copilot_host::session::SessionDeps;
use copilot_host::testing::{
    MockConnectionFactory, MockIdentityFactory, MockIdentityScript, RecordingRenderer,
};
use copilot_host::token_cache::TokenCache;

pub struct Fixture {
    pub params: ControlParameters,
    pub host: Arc<InMemoryHostBinding>,
    pub identity: Arc<MockIdentityFactory>,
    pub connections: Arc<MockConnectionFactory>,
    pub renderer: Arc<RecordingRenderer>,
    pub deps: SessionDeps,
}

impl Fixture {
    pub fn new() -> Self {
        let params = ControlParameters {
            app_client_id: "app".to_string(),
            tenant_id: "tenant".to_string(),
            environment_id: "env".to_string(),
            agent_id: "agent".to_string(),
        };
        let host = Arc::new(InMemoryHostBinding::with_parameters(&params));
        let identity = Arc::new(MockIdentityFactory::new(MockIdentityScript::default()));
        let connections = Arc::new(MockConnectionFactory::new());
        let renderer = Arc::new(RecordingRenderer::new());
        let deps = SessionDeps {
            token_cache: Arc::new(TokenCache::new(
                identity.clone(),
                "https://login.microsoftonline.com/",
                vec!["https://api.powerplatform.com/.default".to_string()],
            )),
            connections: connections.clone(),
            renderer: renderer.clone(),
            host: host.clone(),
            style: StyleOptions::default(),
        };
        Self {
            params,
            host,
            identity,
            connections,
            renderer,
            deps,
        }
    }

    pub fn with_flags(self, flags: &[HostFlag]) -> Self {
        for flag in flags {
            self.host.set_flag(*flag, true);
        }
        self
    }

    pub fn registry(&self, max_sessions: usize) -> TabRegistry {
        TabRegistry::new(self.deps.clone(), max_sessions)
    }
}
