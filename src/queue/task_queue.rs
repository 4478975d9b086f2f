//! Typed queue operations over the broker.
//!
//! This layer owns all key naming and every read/write of job state:
//! the FIFO job list, per-job status hashes, the active-jobs sorted set,
//! and the per-job event channels. It is shared verbatim by the gateway,
//! the worker, and the watchdog.

use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::broker::{Broker, ByteStream};
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::queue::models::{EnqueuePayload, JobStage, JobStatus, QueueEvent};

/// Decoded events for one job, ending after the first terminal event.
pub type QueueEventStream = Pin<Box<dyn Stream<Item = QueueEvent> + Send>>;

/// Error string written when the watchdog fails a job for a missed heartbeat.
pub const STALE_HEARTBEAT_ERROR: &str = "worker heartbeat stale";

#[derive(Clone)]
pub struct TaskQueue {
    broker: Arc<dyn Broker>,
    cfg: QueueConfig,
    active_jobs_key: String,
}

impl TaskQueue {
    pub fn new(broker: Arc<dyn Broker>, cfg: QueueConfig) -> Self {
        let active_jobs_key = format!("{}active_jobs", cfg.status_prefix);
        Self {
            broker,
            cfg,
            active_jobs_key,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.cfg
    }

    fn status_key(&self, job_id: &str) -> String {
        format!("{}{}", self.cfg.status_prefix, job_id)
    }

    fn channel(&self, job_id: &str) -> String {
        format!("{}{}", self.cfg.channel_prefix, job_id)
    }

    fn now_ts() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }

    /// Record a new job and make it visible to workers.
    ///
    /// The status hash and list entry are written first; the `queued` event is
    /// published last, so a subscriber attaching at any point sees either the
    /// snapshot or the event.
    pub async fn enqueue(&self, payload: &EnqueuePayload) -> Result<(), QueueError> {
        let key = self.status_key(&payload.job_id);
        let now = Self::now_ts().to_string();
        let fields = vec![
            ("status".to_string(), JobStage::Queued.as_str().to_string()),
            ("created_at".to_string(), now.clone()),
            ("updated_at".to_string(), now),
            ("conversation_id".to_string(), payload.conversation_id.clone()),
            ("model".to_string(), payload.model.clone()),
            ("user_id".to_string(), payload.user_id.clone()),
        ];
        self.broker.hset_many(&key, fields).await?;
        self.broker.expire(&key, self.cfg.job_ttl).await?;

        let body = serde_json::to_vec(payload).map_err(QueueError::Encode)?;
        self.broker.rpush(&self.cfg.queue_key, body).await?;
        tracing::debug!(
            job_id = %payload.job_id,
            conversation_id = %payload.conversation_id,
            "enqueued job"
        );

        self.publish_event(&QueueEvent::Status {
            job_id: payload.job_id.clone(),
            status: JobStage::Queued,
        })
        .await
    }

    /// Write a stage transition plus any extra fields, refreshing the TTL.
    pub async fn mark_status(
        &self,
        job_id: &str,
        stage: JobStage,
        extra: Vec<(String, String)>,
    ) -> Result<(), QueueError> {
        let key = self.status_key(job_id);
        let now = Self::now_ts().to_string();
        let mut fields = vec![
            ("status".to_string(), stage.as_str().to_string()),
            ("updated_at".to_string(), now.clone()),
            ("last_heartbeat".to_string(), now),
        ];
        fields.extend(extra);
        self.broker.hset_many(&key, fields).await?;
        self.broker.expire(&key, self.cfg.job_ttl).await?;
        Ok(())
    }

    /// Record a successful terminal outcome. Returns `false` when another
    /// terminal write already landed (the first one wins).
    pub async fn store_result(&self, job_id: &str, result: &Value) -> Result<bool, QueueError> {
        self.store_terminal(job_id, JobStage::Completed, "result", result_field(result)?)
            .await
    }

    /// Record a failed terminal outcome. First terminal write wins.
    pub async fn store_failure(&self, job_id: &str, error: &str) -> Result<bool, QueueError> {
        self.store_terminal(job_id, JobStage::Failed, "error", error.to_string())
            .await
    }

    /// Record an interrupted terminal outcome. First terminal write wins.
    pub async fn store_interrupt(&self, job_id: &str, result: &Value) -> Result<bool, QueueError> {
        self.store_terminal(job_id, JobStage::Interrupted, "result", result_field(result)?)
            .await
    }

    async fn store_terminal(
        &self,
        job_id: &str,
        stage: JobStage,
        field: &str,
        value: String,
    ) -> Result<bool, QueueError> {
        if let Some(current) = self.current_stage(job_id).await?
            && current.is_terminal()
        {
            tracing::debug!(
                job_id,
                current = %current,
                attempted = %stage,
                "terminal status already recorded; keeping the first write"
            );
            self.clear_active_job(job_id).await?;
            return Ok(false);
        }
        self.mark_status(job_id, stage, vec![(field.to_string(), value)])
            .await?;
        self.clear_active_job(job_id).await?;
        tracing::debug!(job_id, status = %stage, "stored terminal status");
        Ok(true)
    }

    /// Track the job in the active-jobs set with the current time as score.
    pub async fn register_active_job(&self, job_id: &str) -> Result<(), QueueError> {
        let now = Self::now_ts();
        let key = self.status_key(job_id);
        self.broker
            .hset_many(&key, vec![("last_heartbeat".to_string(), now.to_string())])
            .await?;
        self.broker.zadd(&self.active_jobs_key, now, job_id).await?;
        self.broker.expire(&key, self.cfg.job_ttl).await?;
        Ok(())
    }

    pub async fn clear_active_job(&self, job_id: &str) -> Result<(), QueueError> {
        self.broker.zrem(&self.active_jobs_key, job_id).await?;
        Ok(())
    }

    /// Refresh the job's liveness record: hash fields and, while the job is
    /// non-terminal, the active-set score.
    pub async fn update_heartbeat(
        &self,
        job_id: &str,
        status: Option<JobStage>,
    ) -> Result<(), QueueError> {
        let key = self.status_key(job_id);
        let now = Self::now_ts();
        let mut fields = vec![
            ("last_heartbeat".to_string(), now.to_string()),
            ("updated_at".to_string(), now.to_string()),
        ];
        if let Some(stage) = status {
            fields.push(("status".to_string(), stage.as_str().to_string()));
        }
        self.broker.hset_many(&key, fields).await?;
        // A terminal job has already been removed from the active set; a score
        // update here would resurrect it.
        if status.is_none_or(|stage| !stage.is_terminal()) {
            self.broker.zadd(&self.active_jobs_key, now, job_id).await?;
        }
        self.broker.expire(&key, self.cfg.job_ttl).await?;
        Ok(())
    }

    /// Serialize and publish an event on the job's channel.
    pub async fn publish_event(&self, event: &QueueEvent) -> Result<(), QueueError> {
        let payload = serde_json::to_vec(event).map_err(QueueError::Encode)?;
        self.broker
            .publish(&self.channel(event.job_id()), payload)
            .await?;
        Ok(())
    }

    /// Fail the job unless a terminal status is already recorded.
    ///
    /// Returns `true` when this call performed the failure write. Always
    /// removes the job from the active set.
    pub async fn fail_job_if_active(&self, job_id: &str, reason: &str) -> Result<bool, QueueError> {
        match self.current_stage(job_id).await? {
            None => {
                self.clear_active_job(job_id).await?;
                Ok(false)
            }
            Some(stage) if stage.is_terminal() => {
                self.clear_active_job(job_id).await?;
                Ok(false)
            }
            Some(_) => {
                self.store_failure(job_id, reason).await?;
                self.publish_event(&QueueEvent::Failed {
                    job_id: job_id.to_string(),
                    error: reason.to_string(),
                })
                .await?;
                tracing::warn!(job_id, reason, "marked job failed");
                Ok(true)
            }
        }
    }

    /// Sweep the active set and fail every job whose heartbeat is older than
    /// the staleness threshold. Idempotent; safe to run concurrently.
    pub async fn fail_stale_jobs(&self) -> Result<Vec<String>, QueueError> {
        if self.cfg.stale_after.is_zero() {
            return Ok(Vec::new());
        }
        let cutoff = Self::now_ts() - self.cfg.stale_after.as_secs_f64();
        let stale = self
            .broker
            .zrange_by_score(&self.active_jobs_key, cutoff)
            .await?;
        let mut failed = Vec::new();
        for job_id in stale {
            if self.fail_job_if_active(&job_id, STALE_HEARTBEAT_ERROR).await? {
                failed.push(job_id);
            }
        }
        if !failed.is_empty() {
            tracing::warn!(jobs = ?failed, "stale heartbeat detected");
        }
        Ok(failed)
    }

    /// Read and decode the job's status hash. `None` when the hash is absent
    /// (unknown job or expired TTL).
    pub async fn get_status(&self, job_id: &str) -> Result<Option<JobStatus>, QueueError> {
        let fields = self.broker.hgetall(&self.status_key(job_id)).await?;
        Ok(JobStatus::from_fields(fields))
    }

    async fn current_stage(&self, job_id: &str) -> Result<Option<JobStage>, QueueError> {
        Ok(self.get_status(job_id).await?.map(|status| status.status))
    }

    /// Blocking pop used by worker consumer loops. `None` on timeout.
    pub async fn pop_job(&self, timeout: Duration) -> Result<Option<EnqueuePayload>, QueueError> {
        let Some(bytes) = self.broker.blpop(&self.cfg.queue_key, timeout).await? else {
            return Ok(None);
        };
        let payload = serde_json::from_slice(&bytes).map_err(QueueError::Decode)?;
        Ok(Some(payload))
    }

    /// Stream the job's events, closing after the first terminal event.
    ///
    /// The subscription is opened *before* the snapshot read so an event
    /// published in between cannot be lost. With `include_snapshot`, one
    /// synthetic event reflecting the persisted status is emitted first: a
    /// `status` event for non-terminal stages, or the terminal event itself,
    /// in which case the stream closes immediately. A terminal may be observed
    /// twice (snapshot plus live publish); consumers must tolerate that.
    pub async fn iter_events(
        &self,
        job_id: &str,
        include_snapshot: bool,
    ) -> Result<QueueEventStream, QueueError> {
        let subscription = self.broker.subscribe(&self.channel(job_id)).await?;
        let snapshot = if include_snapshot {
            self.get_status(job_id).await?
        } else {
            None
        };

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(forward_events(job_id.to_string(), snapshot, subscription, tx));
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    /// Consume the job's events until the first terminal one.
    ///
    /// Fails with [`QueueError::UnknownJob`] when no status hash exists, and
    /// with [`QueueError::TerminalWaitTimeout`] when `timeout` elapses first;
    /// the job itself is never affected.
    pub async fn wait_for_completion(
        &self,
        job_id: &str,
        timeout: Duration,
    ) -> Result<QueueEvent, QueueError> {
        if self.get_status(job_id).await?.is_none() {
            return Err(QueueError::UnknownJob {
                job_id: job_id.to_string(),
            });
        }
        let mut events = self.iter_events(job_id, true).await?;
        let wait = async {
            while let Some(event) = events.next().await {
                if event.is_terminal() {
                    return Ok(event);
                }
            }
            Err(QueueError::StreamClosed {
                job_id: job_id.to_string(),
            })
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(outcome) => outcome,
            Err(_) => Err(QueueError::TerminalWaitTimeout {
                job_id: job_id.to_string(),
                timeout,
            }),
        }
    }
}

fn result_field(result: &Value) -> Result<String, QueueError> {
    serde_json::to_string(result).map_err(QueueError::Encode)
}

async fn forward_events(
    job_id: String,
    snapshot: Option<JobStatus>,
    mut subscription: ByteStream,
    tx: mpsc::Sender<QueueEvent>,
) {
    if let Some(status) = snapshot {
        let event = synthesize_snapshot_event(&job_id, &status);
        let terminal = event.is_terminal();
        if tx.send(event).await.is_err() || terminal {
            return;
        }
    }
    while let Some(bytes) = subscription.next().await {
        let event = match serde_json::from_slice::<QueueEvent>(&bytes) {
            Ok(event) => event,
            Err(err) => {
                tracing::debug!(job_id, error = %err, "skipping undecodable event");
                continue;
            }
        };
        let terminal = event.is_terminal();
        if tx.send(event).await.is_err() || terminal {
            return;
        }
    }
    // Subscription ended (broker disconnect) before a terminal event; the
    // receiver sees end-of-stream and reopens if it still cares.
    tracing::debug!(job_id, "event subscription ended without terminal");
}

/// Turn a persisted status into the event a late subscriber should see first.
fn synthesize_snapshot_event(job_id: &str, status: &JobStatus) -> QueueEvent {
    match status.status {
        JobStage::Completed => QueueEvent::Completed {
            job_id: job_id.to_string(),
            content: result_content(status.result.as_ref()),
            metadata: status.result.clone(),
            usage: None,
        },
        JobStage::Failed => QueueEvent::Failed {
            job_id: job_id.to_string(),
            error: status
                .error
                .clone()
                .unwrap_or_else(|| "job failed".to_string()),
        },
        JobStage::Interrupted => QueueEvent::Interrupt {
            job_id: job_id.to_string(),
            content: interrupt_content(status.result.as_ref()),
            metadata: status.result.clone(),
        },
        stage => QueueEvent::Status {
            job_id: job_id.to_string(),
            status: stage,
        },
    }
}

fn result_content(result: Option<&Value>) -> Option<String> {
    result
        .and_then(|value| value.get("content"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn interrupt_content(result: Option<&Value>) -> Option<String> {
    let result = result?;
    result
        .get("interrupt_payload")
        .and_then(|payload| payload.get("question"))
        .or_else(|| result.get("content"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn status_with(stage: JobStage, result: Option<Value>, error: Option<String>) -> JobStatus {
        JobStatus {
            status: stage,
            created_at: 0.0,
            updated_at: 0.0,
            last_heartbeat: None,
            conversation_id: None,
            model: None,
            user_id: None,
            result,
            error,
            metadata: None,
        }
    }

    #[test]
    fn snapshot_of_running_job_is_a_status_event() {
        let event = synthesize_snapshot_event("j1", &status_with(JobStage::Running, None, None));
        assert_eq!(
            event,
            QueueEvent::Status {
                job_id: "j1".to_string(),
                status: JobStage::Running
            }
        );
    }

    #[test]
    fn snapshot_of_completed_job_carries_result_content() {
        let result = json!({"content": "hello", "conversation_id": "c1"});
        let event =
            synthesize_snapshot_event("j1", &status_with(JobStage::Completed, Some(result), None));
        match event {
            QueueEvent::Completed {
                content, metadata, ..
            } => {
                assert_eq!(content.as_deref(), Some("hello"));
                assert_eq!(metadata.unwrap()["conversation_id"], "c1");
            }
            other => panic!("expected completed event, got {other:?}"),
        }
    }

    #[test]
    fn snapshot_of_failed_job_carries_error() {
        let event = synthesize_snapshot_event(
            "j1",
            &status_with(JobStage::Failed, None, Some("boom".to_string())),
        );
        assert_eq!(
            event,
            QueueEvent::Failed {
                job_id: "j1".to_string(),
                error: "boom".to_string()
            }
        );
    }

    #[test]
    fn snapshot_of_interrupt_prefers_the_question() {
        let result = json!({
            "content": "full text",
            "interrupt_payload": {"interrupt_id": "i1", "question": "Which city?"}
        });
        let event = synthesize_snapshot_event(
            "j1",
            &status_with(JobStage::Interrupted, Some(result), None),
        );
        match event {
            QueueEvent::Interrupt { content, .. } => {
                assert_eq!(content.as_deref(), Some("Which city?"));
            }
            other => panic!("expected interrupt event, got {other:?}"),
        }
    }
}
