use auth::{
    config::{GatewayConfig, StateStoreKind},
    oauth_state_db::MemoryStateDb,
    provider_client::OAuthHttpProvider,
    server::server as auth_server,
    server_state::AuthServerState,
};
use redis::Client as RedisClient;
use std::sync::Arc;

use pingora::services::background::BackgroundService;
use tokio::sync::watch::Receiver;

/// Hosts the auth service next to the edge proxy in the same pingora server.
pub struct AuthBackgroundService {
    config: Arc<GatewayConfig>,
}

impl AuthBackgroundService {
    pub fn new(config: Arc<GatewayConfig>) -> Self {
        Self { config }
    }

    async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let provider = Arc::new(OAuthHttpProvider::new(&self.config)?);
        match self.config.state_store {
            StateStoreKind::Redis => {
                let state_db = RedisClient::open(self.config.redis_url.as_str())?;
                auth_server(AuthServerState::new(self.config.clone(), state_db, provider)).await
            }
            StateStoreKind::Memory => {
                let state_db = MemoryStateDb::new();
                auth_server(AuthServerState::new(self.config.clone(), state_db, provider)).await
            }
        }
    }
}

#[async_trait::async_trait]
impl BackgroundService for AuthBackgroundService {
    async fn start(&self, mut shutdown: Receiver<bool>) {
        tokio::select! {
            result = self.run() => {
                if let Err(err) = result {
                    tracing::error!("auth service stopped: {err}");
                }
            }
            _ = shutdown.changed() => {
                tracing::info!("auth service shutting down");
            }
        }
    }
}
