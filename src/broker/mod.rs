//! Thin abstraction over the coordination broker.
//!
//! Every piece of shared state (the job list, status hashes, the active-jobs
//! set, and the per-job event channels) lives behind this trait. Each method
//! is a single broker round-trip with no business logic; key naming and
//! semantics belong to the queue layer.
//!
//! Two implementations exist: [`RedisBroker`] for production and
//! [`MemoryBroker`], a single-process stand-in used by the test suites and
//! local development.

mod memory;
mod redis;

pub use memory::MemoryBroker;
pub use redis::RedisBroker;

use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;

use crate::error::BrokerError;

/// Raw messages received from a pub/sub subscription.
///
/// The stream ends when the subscription is torn down or the broker
/// connection drops; callers that need to keep listening reopen it.
pub type ByteStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// Broker primitives required by the queue.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Append a value to the tail of a list.
    async fn rpush(&self, key: &str, value: Vec<u8>) -> Result<(), BrokerError>;

    /// Pop the head of a list, blocking up to `timeout`. `None` on timeout.
    async fn blpop(&self, key: &str, timeout: Duration) -> Result<Option<Vec<u8>>, BrokerError>;

    /// Set several fields of a hash.
    async fn hset_many(&self, key: &str, fields: Vec<(String, String)>)
    -> Result<(), BrokerError>;

    /// Read all fields of a hash. Empty map when the key is absent.
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, BrokerError>;

    /// (Re-)apply a TTL to a key. No effect on absent keys.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BrokerError>;

    /// Insert or update a member of a sorted set.
    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), BrokerError>;

    /// Remove a member from a sorted set.
    async fn zrem(&self, key: &str, member: &str) -> Result<(), BrokerError>;

    /// Members with score ≤ `max`, lowest score first.
    async fn zrange_by_score(&self, key: &str, max: f64) -> Result<Vec<String>, BrokerError>;

    /// Publish a message to a channel. Subscribers attached later never see it.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Open a subscription to a channel.
    async fn subscribe(&self, channel: &str) -> Result<ByteStream, BrokerError>;

    /// Delete a key of any type.
    async fn delete(&self, key: &str) -> Result<(), BrokerError>;
}
