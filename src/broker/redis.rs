//! Redis-backed broker.
//!
//! Command traffic goes through a [`ConnectionManager`], which reconnects
//! automatically. Each subscription gets its own dedicated pub/sub connection;
//! when that connection drops, the subscriber sees end-of-stream and decides
//! whether to reopen.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use crate::broker::{Broker, ByteStream};
use crate::error::BrokerError;

pub struct RedisBroker {
    /// Kept for opening per-subscription pub/sub connections.
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisBroker {
    /// Connect and verify reachability with a PING.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;
        let mut conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;
        tracing::debug!(url, "connected to redis");
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn rpush(&self, key: &str, value: Vec<u8>) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn blpop(&self, key: &str, timeout: Duration) -> Result<Option<Vec<u8>>, BrokerError> {
        let mut conn = self.conn.clone();
        let item: Option<(String, Vec<u8>)> = redis::cmd("BLPOP")
            .arg(key)
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await?;
        Ok(item.map(|(_, value)| value))
    }

    async fn hset_many(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
    ) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        conn.hset_multiple::<_, _, _, ()>(key, &fields).await?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, BrokerError> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(key).await?)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(key, member, score).await?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        conn.zrem::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn zrange_by_score(&self, key: &str, max: f64) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(max)
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<ByteStream, BrokerError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let stream = pubsub
            .into_on_message()
            .map(|msg| msg.get_payload_bytes().to_vec());
        Ok(Box::pin(stream))
    }

    async fn delete(&self, key: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}
