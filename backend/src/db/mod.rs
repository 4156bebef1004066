pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::store::{KvStore, MemoryStore, RedisStore};

/// Opens the shared store named by the configuration.
///
/// Without `REDIS_URL` the process falls back to a [`MemoryStore`], which is
/// only coherent for a single instance.
pub async fn connect_store(config: &Config) -> anyhow::Result<Arc<dyn KvStore>> {
    match redis::create_redis_pool(config).await? {
        Some(pool) => Ok(Arc::new(RedisStore::new(
            pool,
            Duration::from_millis(config.store_op_timeout_ms),
        ))),
        None => {
            tracing::warn!(
                "REDIS_URL not set, using in-process store; state is not shared between instances"
            );
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
