use axum::async_trait;
use redis::{
    AsyncCommands, Client as RedisClient, ExistenceCheck, FromRedisValue, SetExpiry, SetOptions,
    ToRedisArgs,
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::SystemTime,
};

use super::data_model::OAuthState;

#[derive(Debug, thiserror::Error)]
pub enum StateDbError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("oauth state encoding: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("nonce already issued")]
    Collision,
}

/// Single-use storage for pending login attempts.
#[async_trait]
pub trait OAuthStateDb: Clone + Send + Sync + 'static {
    async fn issue(&self, state: &OAuthState) -> Result<(), StateDbError>;
    /// Removes and returns the state for `nonce`. A second call with the same nonce yields `None`.
    async fn consume(&self, nonce: &str) -> Result<Option<OAuthState>, StateDbError>;
}

fn state_key(nonce: &str) -> String {
    format!("oauth-state:{nonce}")
}

#[async_trait]
impl OAuthStateDb for RedisClient {
    #[tracing::instrument(skip_all, err)]
    async fn issue(&self, state: &OAuthState) -> Result<(), StateDbError> {
        let value = bincode::serialize(state)?;
        let stored: Option<String> = self
            .set(
                state_key(&state.nonce),
                value,
                SetOptions::default()
                    .conditional_set(ExistenceCheck::NX)
                    .with_expiration(SetExpiry::EX(state.ttl.as_secs().max(1) as _)),
            )
            .await?;
        stored.map(|_| ()).ok_or(StateDbError::Collision)
    }

    #[tracing::instrument(skip_all, err)]
    async fn consume(&self, nonce: &str) -> Result<Option<OAuthState>, StateDbError> {
        let value: Option<Vec<u8>> = self.get_del(state_key(nonce)).await?;
        Ok(value
            .map(|bytes| bincode::deserialize::<OAuthState>(&bytes))
            .transpose()?)
    }
}

#[async_trait]
pub trait SimpleRedis {
    async fn set<K: ToRedisArgs + Send + Sync, V: ToRedisArgs + Send + Sync, RV: FromRedisValue>(
        &self,
        key: K,
        value: V,
        options: SetOptions,
    ) -> Result<RV, redis::RedisError>;
    /// GETDEL, so a value is observed by at most one caller.
    async fn get_del<K: ToRedisArgs + Send + Sync, RV: FromRedisValue>(
        &self,
        key: K,
    ) -> Result<RV, redis::RedisError>;
}

#[async_trait]
impl SimpleRedis for RedisClient {
    async fn set<K: ToRedisArgs + Send + Sync, V: ToRedisArgs + Send + Sync, RV: FromRedisValue>(
        &self,
        key: K,
        value: V,
        options: SetOptions,
    ) -> Result<RV, redis::RedisError> {
        self.get_multiplexed_async_connection()
            .await?
            .set_options(key, value, options)
            .await
    }
    async fn get_del<K: ToRedisArgs + Send + Sync, RV: FromRedisValue>(
        &self,
        key: K,
    ) -> Result<RV, redis::RedisError> {
        self.get_multiplexed_async_connection()
            .await?
            .get_del(key)
            .await
    }
}

/// Process-local store for single-instance deployments and tests.
#[derive(Clone, Default, Debug)]
pub struct MemoryStateDb {
    states: Arc<Mutex<HashMap<String, OAuthState>>>,
}

impl MemoryStateDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_states<T>(&self, f: impl FnOnce(&mut HashMap<String, OAuthState>) -> T) -> T {
        let mut states = self
            .states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut states)
    }
}

#[async_trait]
impl OAuthStateDb for MemoryStateDb {
    async fn issue(&self, state: &OAuthState) -> Result<(), StateDbError> {
        let now = SystemTime::now();
        self.with_states(|states| {
            states.retain(|_, pending| pending.is_live_at(now));
            if states.contains_key(&state.nonce) {
                return Err(StateDbError::Collision);
            }
            states.insert(state.nonce.clone(), state.clone());
            Ok(())
        })
    }

    async fn consume(&self, nonce: &str) -> Result<Option<OAuthState>, StateDbError> {
        Ok(self.with_states(|states| states.remove(nonce)))
    }
}
