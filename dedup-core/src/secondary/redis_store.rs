//! Redis implementation of [SecondaryStore]. Every generation is a Redis set, and a registry set
//! lists the generations that hold data:
//!
//! ```text
//! {prefix}:gen:{generation}   SET of dedup keys
//! {prefix}:generations        SET of generation ids
//! ```
//!
//! `SADD` makes `put` idempotent and commutative across nodes, and retiring a generation is a
//! single `DEL` no matter how many keys it holds.

use redis::Client;
use redis::aio::ConnectionManager;
use tracing::info;

use crate::Result;
use crate::message::DedupKey;
use crate::retention::GenerationId;
use crate::secondary::SecondaryStore;

const SADD: &str = "SADD";
const SREM: &str = "SREM";
const SISMEMBER: &str = "SISMEMBER";
const SMEMBERS: &str = "SMEMBERS";
const DEL: &str = "DEL";

#[derive(Clone)]
pub struct RedisStore {
    /// Prefix for all keys used by this store
    key_prefix: String,
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn new(url: &str, key_prefix: impl Into<String>) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        let key_prefix = key_prefix.into();
        info!(%key_prefix, "Connected to redis secondary store");
        Ok(Self { key_prefix, conn })
    }

    fn generation_key(&self, generation: GenerationId) -> String {
        format!("{}:gen:{}", self.key_prefix, generation)
    }

    fn registry_key(&self) -> String {
        format!("{}:generations", self.key_prefix)
    }
}

impl SecondaryStore for RedisStore {
    async fn put(&self, key: &DedupKey, generation: GenerationId) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd(SADD)
            .arg(self.generation_key(generation))
            .arg(key.as_str())
            .ignore()
            .cmd(SADD)
            .arg(self.registry_key())
            .arg(generation.0)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn exists_in(&self, key: &DedupKey, generations: &[GenerationId]) -> Result<bool> {
        if generations.is_empty() {
            return Ok(false);
        }
        let mut pipe = redis::pipe();
        for generation in generations {
            pipe.cmd(SISMEMBER)
                .arg(self.generation_key(*generation))
                .arg(key.as_str());
        }
        let mut conn = self.conn.clone();
        let found: Vec<bool> = pipe.query_async(&mut conn).await?;
        Ok(found.into_iter().any(|present| present))
    }

    async fn generations(&self) -> Result<Vec<GenerationId>> {
        let mut conn = self.conn.clone();
        let mut ids: Vec<i64> = redis::cmd(SMEMBERS)
            .arg(self.registry_key())
            .query_async(&mut conn)
            .await?;
        ids.sort_unstable();
        Ok(ids.into_iter().map(GenerationId).collect())
    }

    async fn drop_generation(&self, generation: GenerationId) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd(DEL)
            .arg(self.generation_key(generation))
            .ignore()
            .cmd(SREM)
            .arg(self.registry_key())
            .arg(generation.0)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}
