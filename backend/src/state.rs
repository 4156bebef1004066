use std::sync::Arc;

use crate::config::Config;
use crate::services::{
    ActivityTracker, CsrfTokenManager, IdentityProvider, RateLimiter, SessionStore,
};
use crate::store::KvStore;
use crate::utils::jwt::TokenSigner;

/// Shared handles for every request. All components talk to the same store.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn KvStore>,
    pub tokens: TokenSigner,
    pub sessions: SessionStore,
    pub activity: ActivityTracker,
    pub csrf: CsrfTokenManager,
    pub rate_limiter: RateLimiter,
    pub identity: Arc<dyn IdentityProvider>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn KvStore>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        let tokens = TokenSigner::new(config.token_config());
        let sessions = SessionStore::new(store.clone(), config.session_config());
        let activity = ActivityTracker::new(store.clone(), config.activity_config());
        let csrf = CsrfTokenManager::new(
            store.clone(),
            sessions.clone(),
            activity.clone(),
            config.csrf_config(),
        );
        let rate_limiter = RateLimiter::new(store.clone(), config.rate_limit_config());

        Self {
            config: Arc::new(config),
            store,
            tokens,
            sessions,
            activity,
            csrf,
            rate_limiter,
            identity,
        }
    }
}
