//! Process-wide memo of identity clients keyed by `clientId|tenantId`.
//!
//! The first caller to find an empty slot constructs the client and stores its
//! shared initialization future before releasing the lock, so concurrent
//! callers on the same key await one initialization instead of racing into a
//! second construction. Token material outlives sessions: restarting a tab
//! reuses the cached client.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use copilot_host_error::HostError;
use futures::future::{FutureExt, Shared};
use thiserror::Error;

use crate::BoxFuture;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("interaction required: {0}")]
    InteractionRequired(String),
    #[error("consent required: {0}")]
    ConsentRequired(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub home_account_id: String,
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityClientConfig {
    pub client_id: String,
    pub tenant_id: String,
    pub authority: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRequest {
    pub scopes: Vec<String>,
    pub redirect_uri: Option<String>,
}

/// Identity-provider client for one app registration in one tenant.
pub trait IdentityClient: Send + Sync + 'static {
    fn initialize(&self) -> BoxFuture<'_, Result<(), IdentityError>>;

    fn accounts(&self) -> Vec<Account>;

    fn acquire_token_silent<'a>(
        &'a self,
        request: &'a TokenRequest,
        account: &'a Account,
    ) -> BoxFuture<'a, Result<String, IdentityError>>;

    fn acquire_token_interactive<'a>(
        &'a self,
        request: &'a TokenRequest,
    ) -> BoxFuture<'a, Result<String, IdentityError>>;
}

pub trait IdentityClientFactory: Send + Sync + 'static {
    fn create(&self, config: &IdentityClientConfig) -> Arc<dyn IdentityClient>;

    fn is_ready(&self) -> bool {
        true
    }
}

type InitFuture = Shared<BoxFuture<'static, Result<(), IdentityError>>>;

struct CacheEntry {
    client: Arc<dyn IdentityClient>,
    init: InitFuture,
}

pub struct TokenCache {
    factory: Arc<dyn IdentityClientFactory>,
    authority_base: String,
    request: TokenRequest,
    entries: Mutex<HashMap<String, Arc<CacheEntry>>>,
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("authority_base", &self.authority_base)
            .field("scopes", &self.request.scopes)
            .field("entries", &self.len())
            .finish()
    }
}

impl TokenCache {
    pub fn new(
        factory: Arc<dyn IdentityClientFactory>,
        authority_base: impl Into<String>,
        scopes: Vec<String>,
    ) -> Self {
        Self {
            factory,
            authority_base: authority_base.into(),
            request: TokenRequest {
                scopes,
                redirect_uri: None,
            },
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_redirect_uri(mut self, redirect_uri: impl Into<String>) -> Self {
        self.request.redirect_uri = Some(redirect_uri.into());
        self
    }

    pub fn factory(&self) -> &Arc<dyn IdentityClientFactory> {
        &self.factory
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a bearer token for the app registration, trying silent
    /// acquisition against a cached account before falling back to an
    /// interactive prompt.
    pub async fn acquire_token(
        &self,
        app_client_id: &str,
        tenant_id: &str,
    ) -> Result<String, HostError> {
        let key = cache_key(app_client_id, tenant_id);
        let entry = self.entry(&key, app_client_id, tenant_id);

        if let Err(err) = entry.init.clone().await {
            self.evict(&key, &entry);
            tracing::warn!(key = %key, error = %err, "token_cache: client initialization failed");
            return Err(HostError::AuthenticationFailed {
                message: err.to_string(),
            });
        }

        let client = &entry.client;
        let accounts = client.accounts();
        let token = match accounts.first() {
            Some(account) => match client.acquire_token_silent(&self.request, account).await {
                Ok(token) => Ok(token),
                Err(silent) => {
                    tracing::warn!(
                        key = %key,
                        error = %silent,
                        "token_cache: silent token failed, trying interactive"
                    );
                    client.acquire_token_interactive(&self.request).await
                }
            },
            None => client.acquire_token_interactive(&self.request).await,
        };

        token.map_err(|err| {
            tracing::warn!(key = %key, error = %err, "token_cache: token acquisition failed");
            HostError::AuthenticationFailed {
                message: err.to_string(),
            }
        })
    }

    fn entry(&self, key: &str, app_client_id: &str, tenant_id: &str) -> Arc<CacheEntry> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = entries.get(key) {
            return existing.clone();
        }

        let config = IdentityClientConfig {
            client_id: app_client_id.to_string(),
            tenant_id: tenant_id.to_string(),
            authority: format!("{}{}", self.authority_base, tenant_id),
        };
        let client = self.factory.create(&config);
        let init_client = client.clone();
        let init: BoxFuture<'static, Result<(), IdentityError>> =
            Box::pin(async move { init_client.initialize().await });
        let entry = Arc::new(CacheEntry {
            client,
            init: init.shared(),
        });
        entries.insert(key.to_string(), entry.clone());
        tracing::debug!(key = %key, "token_cache: created identity client");
        entry
    }

    /// Drops a failed entry so the next caller retries with a fresh client.
    /// A newer entry installed by someone else is left alone.
    fn evict(&self, key: &str, failed: &Arc<CacheEntry>) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if entries
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, failed))
        {
            entries.remove(key);
        }
    }
}

fn cache_key(app_client_id: &str, tenant_id: &str) -> String {
    format!("{app_client_id}|{tenant_id}")
}
