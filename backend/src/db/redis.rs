use crate::config::Config;
use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use std::time::Duration;

pub type RedisPool = Pool<RedisConnectionManager>;

pub async fn create_redis_pool(config: &Config) -> anyhow::Result<Option<RedisPool>> {
    let Some(url) = &config.redis_url else {
        return Ok(None);
    };

    let manager = RedisConnectionManager::new(url.clone())?;
    let pool = Pool::builder()
        .max_size(config.redis_pool_size)
        .connection_timeout(Duration::from_secs(config.redis_connect_timeout))
        .build(manager)
        .await?;

    // Fail at startup rather than on the first request.
    {
        let mut conn = pool.get().await?;
        bb8_redis::redis::cmd("PING")
            .query_async::<_, String>(&mut *conn)
            .await?;
    }

    tracing::info!(
        "Redis connection pool created (size: {}, op timeout: {}ms)",
        config.redis_pool_size,
        config.store_op_timeout_ms
    );
    Ok(Some(pool))
}
