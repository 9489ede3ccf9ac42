//! Headless identity for hosts that already hold a bearer token.

use std::sync::Arc;

use crate::token_cache::{
    Account, IdentityClient, IdentityClientConfig, IdentityClientFactory, IdentityError,
    TokenRequest,
};
use crate::BoxFuture;

#[derive(Debug, Clone)]
pub struct StaticTokenIdentityFactory {
    token: String,
}

impl StaticTokenIdentityFactory {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl IdentityClientFactory for StaticTokenIdentityFactory {
    fn create(&self, config: &IdentityClientConfig) -> Arc<dyn IdentityClient> {
        tracing::debug!(
            client_id = %config.client_id,
            authority = %config.authority,
            "token_cache: static identity client"
        );
        Arc::new(StaticTokenClient {
            token: self.token.clone(),
            account: Account {
                home_account_id: format!("{}.{}", config.client_id, config.tenant_id),
                username: None,
            },
        })
    }
}

struct StaticTokenClient {
    token: String,
    account: Account,
}

impl IdentityClient for StaticTokenClient {
    fn initialize(&self) -> BoxFuture<'_, Result<(), IdentityError>> {
        Box::pin(async move {
            if self.token.trim().is_empty() {
                return Err(IdentityError::Other("no bearer token configured".to_string()));
            }
            Ok(())
        })
    }

    fn accounts(&self) -> Vec<Account> {
        vec![self.account.clone()]
    }

    fn acquire_token_silent<'a>(
        &'a self,
        _request: &'a TokenRequest,
        _account: &'a Account,
    ) -> BoxFuture<'a, Result<String, IdentityError>> {
        Box::pin(async move { Ok(self.token.clone()) })
    }

    fn acquire_token_interactive<'a>(
        &'a self,
        _request: &'a TokenRequest,
    ) -> BoxFuture<'a, Result<String, IdentityError>> {
        Box::pin(async move {
            Err(IdentityError::InteractionRequired(
                "interactive sign-in is unavailable in headless mode".to_string(),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use copilot_host_error::HostError;

    use super::*;
    use crate::token_cache::TokenCache;

    #[tokio::test]
    async fn hands_out_the_configured_token() {
        let cache = TokenCache::new(
            Arc::new(StaticTokenIdentityFactory::new("bearer-abc")),
            "https://login.microsoftonline.com/",
            Vec::new(),
        );
        assert_eq!(
            cache.acquire_token("app", "tenant").await.expect("token"),
            "bearer-abc"
        );
    }

    #[tokio::test]
    async fn blank_token_fails_initialization() {
        let cache = TokenCache::new(
            Arc::new(StaticTokenIdentityFactory::new(" ")),
            "https://login.microsoftonline.com/",
            Vec::new(),
        );
        assert!(matches!(
            cache.acquire_token("app", "tenant").await,
            Err(HostError::AuthenticationFailed { .. })
        ));
        assert!(cache.is_empty());
    }
}
