//! Single-process broker over tokio primitives.
//!
//! Behaviourally equivalent to the Redis broker for everything the queue
//! relies on: FIFO lists with blocking pop, hashes and sorted sets with lazy
//! TTL expiry, and no-replay pub/sub. Used by the test suites and for local
//! runs without a Redis.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{Mutex, Notify, broadcast};
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

use crate::broker::{Broker, ByteStream};
use crate::error::BrokerError;

#[derive(Default)]
struct Shared {
    lists: HashMap<String, VecDeque<Vec<u8>>>,
    hashes: HashMap<String, HashMap<String, String>>,
    zsets: HashMap<String, HashMap<String, f64>>,
    expirations: HashMap<String, Instant>,
}

impl Shared {
    /// Drop keys whose TTL has elapsed. Called under the lock at the top of
    /// every operation, so expiry is observable but lazy.
    fn purge_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .expirations
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.expirations.remove(&key);
            self.lists.remove(&key);
            self.hashes.remove(&key);
            self.zsets.remove(&key);
        }
    }

    fn contains_key(&self, key: &str) -> bool {
        self.lists.contains_key(key) || self.hashes.contains_key(key) || self.zsets.contains_key(key)
    }
}

#[derive(Default)]
pub struct MemoryBroker {
    shared: Mutex<Shared>,
    /// Woken on every list push so blocked poppers re-check.
    list_signal: Notify,
    channels: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn rpush(&self, key: &str, value: Vec<u8>) -> Result<(), BrokerError> {
        let mut shared = self.shared.lock().await;
        shared.purge_expired();
        shared.lists.entry(key.to_string()).or_default().push_back(value);
        drop(shared);
        self.list_signal.notify_waiters();
        Ok(())
    }

    async fn blpop(&self, key: &str, timeout: Duration) -> Result<Option<Vec<u8>>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.list_signal.notified();
            tokio::pin!(notified);
            // Register interest before checking so a push between the check
            // and the await cannot be missed.
            notified.as_mut().enable();
            {
                let mut shared = self.shared.lock().await;
                shared.purge_expired();
                if let Some(list) = shared.lists.get_mut(key) {
                    if let Some(value) = list.pop_front() {
                        if list.is_empty() {
                            shared.lists.remove(key);
                        }
                        return Ok(Some(value));
                    }
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(remaining) => return Ok(None),
            }
        }
    }

    async fn hset_many(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
    ) -> Result<(), BrokerError> {
        let mut shared = self.shared.lock().await;
        shared.purge_expired();
        shared
            .hashes
            .entry(key.to_string())
            .or_default()
            .extend(fields);
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, BrokerError> {
        let mut shared = self.shared.lock().await;
        shared.purge_expired();
        Ok(shared.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BrokerError> {
        let mut shared = self.shared.lock().await;
        shared.purge_expired();
        if shared.contains_key(key) {
            shared.expirations.insert(key.to_string(), Instant::now() + ttl);
        }
        Ok(())
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), BrokerError> {
        let mut shared = self.shared.lock().await;
        shared.purge_expired();
        shared
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<(), BrokerError> {
        let mut shared = self.shared.lock().await;
        shared.purge_expired();
        if let Some(set) = shared.zsets.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                shared.zsets.remove(key);
            }
        }
        Ok(())
    }

    async fn zrange_by_score(&self, key: &str, max: f64) -> Result<Vec<String>, BrokerError> {
        let mut shared = self.shared.lock().await;
        shared.purge_expired();
        let mut members: Vec<(String, f64)> = shared
            .zsets
            .get(key)
            .map(|set| {
                set.iter()
                    .filter(|(_, score)| **score <= max)
                    .map(|(member, score)| (member.clone(), *score))
                    .collect()
            })
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(&b.0)));
        Ok(members.into_iter().map(|(member, _)| member).collect())
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let channels = self.channels.lock().await;
        if let Some(sender) = channels.get(channel) {
            // No subscribers is not an error; the message is simply dropped,
            // matching no-replay pub/sub semantics.
            let _ = sender.send(payload);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<ByteStream, BrokerError> {
        let mut channels = self.channels.lock().await;
        let sender = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(256).0);
        let receiver = sender.subscribe();
        let stream = BroadcastStream::new(receiver)
            .filter_map(|item| futures::future::ready(item.ok()));
        Ok(Box::pin(stream))
    }

    async fn delete(&self, key: &str) -> Result<(), BrokerError> {
        let mut shared = self.shared.lock().await;
        shared.lists.remove(key);
        shared.hashes.remove(key);
        shared.zsets.remove(key);
        shared.expirations.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rpush_blpop_is_fifo() {
        let broker = MemoryBroker::new();
        broker.rpush("q", b"one".to_vec()).await.unwrap();
        broker.rpush("q", b"two".to_vec()).await.unwrap();

        let first = broker.blpop("q", Duration::from_millis(50)).await.unwrap();
        let second = broker.blpop("q", Duration::from_millis(50)).await.unwrap();
        assert_eq!(first.as_deref(), Some(b"one".as_ref()));
        assert_eq!(second.as_deref(), Some(b"two".as_ref()));
    }

    #[tokio::test]
    async fn blpop_times_out_on_empty_list() {
        let broker = MemoryBroker::new();
        let popped = broker.blpop("q", Duration::from_millis(30)).await.unwrap();
        assert!(popped.is_none());
    }

    #[tokio::test]
    async fn blpop_wakes_on_concurrent_push() {
        let broker = std::sync::Arc::new(MemoryBroker::new());
        let popper = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.blpop("q", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.rpush("q", b"late".to_vec()).await.unwrap();

        let popped = popper.await.unwrap().unwrap();
        assert_eq!(popped.as_deref(), Some(b"late".as_ref()));
    }

    #[tokio::test]
    async fn expired_hash_vanishes() {
        let broker = MemoryBroker::new();
        broker
            .hset_many("h", vec![("f".to_string(), "v".to_string())])
            .await
            .unwrap();
        broker.expire("h", Duration::from_millis(20)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(broker.hgetall("h").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expire_ignores_absent_keys() {
        let broker = MemoryBroker::new();
        broker.expire("ghost", Duration::from_millis(10)).await.unwrap();
        broker
            .hset_many("ghost", vec![("f".to_string(), "v".to_string())])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        // The expire ran before the key existed, so it must not apply.
        assert_eq!(broker.hgetall("ghost").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn zrange_by_score_filters_and_orders() {
        let broker = MemoryBroker::new();
        broker.zadd("z", 3.0, "c").await.unwrap();
        broker.zadd("z", 1.0, "a").await.unwrap();
        broker.zadd("z", 2.0, "b").await.unwrap();

        let members = broker.zrange_by_score("z", 2.0).await.unwrap();
        assert_eq!(members, vec!["a".to_string(), "b".to_string()]);

        broker.zrem("z", "a").await.unwrap();
        let members = broker.zrange_by_score("z", f64::INFINITY).await.unwrap();
        assert_eq!(members, vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn delete_removes_a_key_of_any_type() {
        let broker = MemoryBroker::new();
        broker.rpush("l", b"v".to_vec()).await.unwrap();
        broker
            .hset_many("h", vec![("f".to_string(), "v".to_string())])
            .await
            .unwrap();
        broker.zadd("z", 1.0, "m").await.unwrap();

        broker.delete("l").await.unwrap();
        broker.delete("h").await.unwrap();
        broker.delete("z").await.unwrap();

        assert!(
            broker
                .blpop("l", Duration::from_millis(10))
                .await
                .unwrap()
                .is_none()
        );
        assert!(broker.hgetall("h").await.unwrap().is_empty());
        assert!(broker.zrange_by_score("z", f64::INFINITY).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn subscribers_only_see_messages_published_while_subscribed() {
        let broker = MemoryBroker::new();
        broker.publish("ch", b"before".to_vec()).await.unwrap();

        let mut stream = broker.subscribe("ch").await.unwrap();
        broker.publish("ch", b"after".to_vec()).await.unwrap();

        let received = tokio::time::timeout(Duration::from_millis(100), stream.next())
            .await
            .unwrap();
        assert_eq!(received.as_deref(), Some(b"after".as_ref()));
    }
}
