use std::sync::Arc;

use super::{
    config::GatewayConfig, oauth_state_db::OAuthStateDb, provider_client::IdentityProvider,
};

#[derive(Clone)]
pub struct AuthServerState<StateDb: OAuthStateDb> {
    pub config: Arc<GatewayConfig>,
    pub state_db: StateDb,
    pub provider: Arc<dyn IdentityProvider>,
}

impl<StateDb: OAuthStateDb> AuthServerState<StateDb> {
    pub fn new(
        config: Arc<GatewayConfig>,
        state_db: StateDb,
        provider: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            config,
            state_db,
            provider,
        }
    }
}
