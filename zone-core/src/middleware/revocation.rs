//! Redis-backed token revocation checker.
//!
//! Implements [`TokenRevocation`] against a `deadpool_redis::Pool`, storing
//! revoked token IDs (jti) as keys with a TTL matching the token's remaining
//! lifetime so the revocation set never grows unbounded.

use async_trait::async_trait;
use deadpool_redis::redis::AsyncCommands;
use deadpool_redis::Pool;

use super::token::TokenRevocation;
use crate::error::Error;

const KEY_PREFIX: &str = "paseto:revoked:";

/// Token revocation checker backed by Redis.
#[derive(Clone)]
pub struct RedisTokenRevocation {
    pool: Pool,
}

impl RedisTokenRevocation {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    fn key(jti: &str) -> String {
        format!("{KEY_PREFIX}{jti}")
    }
}

#[async_trait]
impl TokenRevocation for RedisTokenRevocation {
    async fn is_revoked(&self, jti: &str) -> Result<bool, Error> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| Error::Internal(format!("redis pool checkout failed: {e}")))?;

        let exists: bool = conn
            .exists(Self::key(jti))
            .await
            .map_err(|e| Error::Internal(format!("redis EXISTS failed: {e}")))?;

        Ok(exists)
    }

    async fn revoke(&self, jti: &str, ttl_secs: u64) -> Result<(), Error> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| Error::Internal(format!("redis pool checkout failed: {e}")))?;

        let ttl = ttl_secs.max(1);
        conn.set_ex::<_, _, ()>(Self::key(jti), "1", ttl)
            .await
            .map_err(|e| Error::Internal(format!("redis SETEX failed: {e}")))?;

        Ok(())
    }
}
