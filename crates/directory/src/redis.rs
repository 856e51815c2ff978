//! Redis-backed directory.
//!
//! The redis-rs `MultiplexedConnection` is designed to be cloned cheaply
//! and used concurrently, so every operation clones the connection instead
//! of locking a shared one.

use crate::{key_for, Directory, DirectoryError, MirrorRecord, KEY_PREFIX};
use common::types::MeetingId;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use tracing::{debug, error};

impl From<redis::RedisError> for DirectoryError {
    fn from(err: redis::RedisError) -> Self {
        DirectoryError::Backend(err.to_string())
    }
}

/// Directory client over a Redis instance.
#[derive(Clone)]
pub struct RedisDirectory {
    connection: MultiplexedConnection,
}

impl RedisDirectory {
    /// Connect to the Redis instance at `redis_url`.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::Backend`] when the server is unreachable.
    /// Callers decide whether that is fatal: the relay services abort,
    /// Signaling falls back to running with public mirroring disabled.
    pub async fn connect(redis_url: &str) -> Result<Self, DirectoryError> {
        // The URL may embed credentials; log only the failure, never the URL.
        let client = Client::open(redis_url).map_err(|e| {
            error!(target: "directory.redis", error = %e, "Failed to open Redis client");
            DirectoryError::Backend(format!("open client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(target: "directory.redis", error = %e, "Failed to connect to Redis");
                DirectoryError::Backend(format!("connect: {e}"))
            })?;

        Ok(Self { connection })
    }
}

impl Directory for RedisDirectory {
    async fn get(&self, id: &MeetingId) -> Result<Option<MirrorRecord>, DirectoryError> {
        let mut conn = self.connection.clone();
        let fields: HashMap<String, String> = conn.hgetall(key_for(id)).await?;

        // Redis reports a missing key as an empty hash.
        if fields.is_empty() {
            return Ok(None);
        }

        MirrorRecord::from_fields(fields).map(Some)
    }

    async fn set(&self, id: &MeetingId, record: &MirrorRecord) -> Result<(), DirectoryError> {
        let mut conn = self.connection.clone();
        conn.hset_multiple::<_, _, _, ()>(key_for(id), &record.to_fields())
            .await?;
        debug!(target: "directory.redis", meeting_id = %id, "Published mirror record");
        Ok(())
    }

    async fn delete(&self, id: &MeetingId) -> Result<(), DirectoryError> {
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(key_for(id)).await?;
        debug!(target: "directory.redis", meeting_id = %id, "Withdrew mirror record");
        Ok(())
    }

    async fn flush_all(&self) -> Result<(), DirectoryError> {
        let mut conn = self.connection.clone();

        // Collect first: deleting while a SCAN cursor borrows the
        // connection is not possible.
        let keys: Vec<String> = {
            let mut iter = conn.scan_match::<_, String>(format!("{KEY_PREFIX}:*")).await?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };

        if !keys.is_empty() {
            let count = keys.len();
            conn.del::<_, ()>(keys).await?;
            debug!(target: "directory.redis", count, "Flushed directory namespace");
        }

        Ok(())
    }
}
