//! Worker runtime: dequeue jobs, invoke the backend, publish lifecycle events.
//!
//! One worker process runs a small number of consumer loops. Each loop pops a
//! job, marks it running, then drives three cooperating tasks: the backend
//! call, a heartbeat ticker, and (once the reply arrives) the chunk
//! publisher. Every path out of a job ends in exactly one terminal event.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

use crate::bot::{AgentBackend, OutboundMessage, SendMessageReply};
use crate::config::WorkerConfig;
use crate::error::{BotError, Error};
use crate::queue::{EnqueuePayload, JobStage, QueueEvent, TaskQueue};

pub struct WorkerRuntime {
    queue: TaskQueue,
    backend: Arc<dyn AgentBackend>,
    cfg: WorkerConfig,
}

impl WorkerRuntime {
    pub fn new(queue: TaskQueue, backend: Arc<dyn AgentBackend>, cfg: WorkerConfig) -> Self {
        Self {
            queue,
            backend,
            cfg,
        }
    }

    /// Run consumer loops until the shutdown flag flips. An in-flight job is
    /// always drained before its loop exits.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let mut loops = JoinSet::new();
        for slot in 0..self.cfg.concurrency.max(1) {
            let queue = self.queue.clone();
            let backend = self.backend.clone();
            let cfg = self.cfg.clone();
            let shutdown = shutdown.clone();
            loops.spawn(consumer_loop(slot, queue, backend, cfg, shutdown));
        }
        while loops.join_next().await.is_some() {}
    }

    /// Process a single already-popped job. Exposed for direct use in tests.
    pub async fn process_job(&self, payload: EnqueuePayload) {
        process_job(&self.queue, self.backend.clone(), &self.cfg, payload).await;
    }
}

async fn consumer_loop(
    slot: usize,
    queue: TaskQueue,
    backend: Arc<dyn AgentBackend>,
    cfg: WorkerConfig,
    shutdown: watch::Receiver<bool>,
) {
    tracing::info!(slot, "consumer loop started");
    while !*shutdown.borrow() {
        match queue.pop_job(cfg.pop_timeout).await {
            Ok(Some(payload)) => {
                tracing::debug!(slot, job_id = %payload.job_id, "dequeued job");
                process_job(&queue, backend.clone(), &cfg, payload).await;
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(slot, error = %err, "dequeue failed; retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
    tracing::info!(slot, "consumer loop stopped");
}

async fn process_job(
    queue: &TaskQueue,
    backend: Arc<dyn AgentBackend>,
    cfg: &WorkerConfig,
    payload: EnqueuePayload,
) {
    let job_id = payload.job_id.clone();
    tracing::debug!(
        job_id = %job_id,
        conversation_id = %payload.conversation_id,
        text_chars = payload.text.chars().count(),
        "processing job"
    );

    let (stage_tx, stage_rx) = watch::channel(JobStage::Running);

    if let Err(err) = begin_job(queue, &job_id).await {
        tracing::warn!(job_id = %job_id, error = %err, "failed to record job start");
    }

    let heartbeat = tokio::spawn(heartbeat_loop(
        queue.clone(),
        job_id.clone(),
        queue.config().worker_heartbeat_interval,
        stage_rx,
    ));

    if let Err(err) = execute(queue, backend, cfg, &payload, &stage_tx).await {
        let message = format!("Agent invocation failed: {err}");
        tracing::error!(job_id = %job_id, error = %message, "job failed");
        stage_tx.send_replace(JobStage::Failed);
        if let Err(store_err) = queue.store_failure(&job_id, &message).await {
            tracing::warn!(job_id = %job_id, error = %store_err, "could not store failure");
        }
        if let Err(publish_err) = queue
            .publish_event(&QueueEvent::Failed {
                job_id: job_id.clone(),
                error: message,
            })
            .await
        {
            tracing::warn!(job_id = %job_id, error = %publish_err, "could not publish failure");
        }
        let _ = queue.update_heartbeat(&job_id, Some(JobStage::Failed)).await;
    }

    // Finalization runs on every path: stop the ticker and make sure the job
    // is out of the active set. Cleanup failures are logged and swallowed.
    heartbeat.abort();
    let _ = heartbeat.await;
    if let Err(err) = queue.clear_active_job(&job_id).await {
        tracing::debug!(job_id = %job_id, error = %err, "could not clear active job");
    }
}

/// Mark the job running and visible to the liveness machinery.
async fn begin_job(queue: &TaskQueue, job_id: &str) -> Result<(), Error> {
    queue.mark_status(job_id, JobStage::Running, Vec::new()).await?;
    queue
        .publish_event(&QueueEvent::Status {
            job_id: job_id.to_string(),
            status: JobStage::Running,
        })
        .await?;
    queue.register_active_job(job_id).await?;
    queue.update_heartbeat(job_id, Some(JobStage::Running)).await?;
    Ok(())
}

async fn execute(
    queue: &TaskQueue,
    backend: Arc<dyn AgentBackend>,
    cfg: &WorkerConfig,
    payload: &EnqueuePayload,
    stage: &watch::Sender<JobStage>,
) -> Result<(), Error> {
    let job_id = payload.job_id.as_str();
    let message = OutboundMessage {
        conversation_id: payload.conversation_id.clone(),
        user_id: payload.user_id.clone(),
        user_role: payload.user_role.clone(),
        text: payload.text.clone(),
        raw_user_text: payload.raw_user_text.clone(),
        attachments: payload.attachments.clone(),
        metadata: payload.metadata.clone(),
    };

    let call = tokio::spawn(async move { backend.send_message(&message).await });
    let reply = await_reply(queue, job_id, cfg, call, stage).await?;

    let agent = &reply.agent_message;
    let raw_text = agent.raw_text.clone();
    tracing::debug!(
        job_id,
        agent_status = agent.agent_status().unwrap_or("active"),
        raw_text_chars = raw_text.chars().count(),
        "agent replied"
    );

    if agent.is_interrupted() {
        let mut metadata = agent.metadata.clone();
        if !raw_text.is_empty() && !metadata.contains_key("content") {
            metadata.insert("content".to_string(), json!(raw_text));
        }
        let question = agent.interrupt_question().or_else(|| {
            (!raw_text.is_empty()).then(|| raw_text.clone())
        });
        stage.send_replace(JobStage::Interrupted);
        queue
            .store_interrupt(job_id, &Value::Object(metadata.clone()))
            .await?;
        queue
            .publish_event(&QueueEvent::Interrupt {
                job_id: job_id.to_string(),
                content: question,
                metadata: Some(Value::Object(metadata)),
            })
            .await?;
        tracing::info!(job_id, "job interrupted; awaiting user input");
        return Ok(());
    }

    if !raw_text.is_empty() {
        stage.send_replace(JobStage::Streaming);
        queue.mark_status(job_id, JobStage::Streaming, Vec::new()).await?;
        queue
            .publish_event(&QueueEvent::Status {
                job_id: job_id.to_string(),
                status: JobStage::Streaming,
            })
            .await?;
        queue.update_heartbeat(job_id, Some(JobStage::Streaming)).await?;
        for chunk in chunk_text(&raw_text, queue.config().chunk_char_limit) {
            queue
                .publish_event(&QueueEvent::Chunk {
                    job_id: job_id.to_string(),
                    content: chunk,
                })
                .await?;
            queue.update_heartbeat(job_id, Some(JobStage::Streaming)).await?;
        }
    } else {
        tracing::debug!(job_id, "no content to stream");
    }

    let attachments = agent.attachments();
    let usage = agent.usage();
    let reply_value = serde_json::to_value(&reply).unwrap_or(Value::Null);
    let mut result = json!({
        "conversation_id": payload.conversation_id,
        "content": raw_text,
        "response": reply_value,
    });
    if !attachments.is_empty() {
        result["attachments"] = Value::Array(attachments);
    }

    queue.store_result(job_id, &result).await?;
    queue
        .publish_event(&QueueEvent::Completed {
            job_id: job_id.to_string(),
            content: Some(raw_text),
            metadata: Some(result),
            usage,
        })
        .await?;
    stage.send_replace(JobStage::Completed);
    queue.update_heartbeat(job_id, Some(JobStage::Completed)).await?;
    tracing::info!(job_id, "job completed");
    Ok(())
}

/// Wait for the backend reply in heartbeat-sized slices so liveness keeps
/// getting refreshed through a slow call. The soft timeout is advisory only:
/// it logs once and the call keeps running.
async fn await_reply(
    queue: &TaskQueue,
    job_id: &str,
    cfg: &WorkerConfig,
    mut call: JoinHandle<Result<SendMessageReply, BotError>>,
    stage: &watch::Sender<JobStage>,
) -> Result<SendMessageReply, Error> {
    let interval = queue
        .config()
        .worker_heartbeat_interval
        .max(Duration::from_secs(1));
    let start = Instant::now();
    let mut warned = false;
    loop {
        match tokio::time::timeout(interval, &mut call).await {
            Ok(joined) => {
                let reply = joined
                    .map_err(|err| BotError::Execution(format!("backend task failed: {err}")))??;
                return Ok(reply);
            }
            Err(_) => {
                let current = *stage.borrow();
                let _ = queue.update_heartbeat(job_id, Some(current)).await;
                if let Some(soft) = cfg.soft_timeout
                    && start.elapsed() > soft
                    && !warned
                {
                    tracing::warn!(
                        job_id,
                        soft_timeout_secs = soft.as_secs_f64(),
                        elapsed_secs = start.elapsed().as_secs_f64(),
                        "backend call exceeded its soft timeout; still waiting"
                    );
                    warned = true;
                }
            }
        }
    }
}

async fn heartbeat_loop(
    queue: TaskQueue,
    job_id: String,
    interval: Duration,
    stage: watch::Receiver<JobStage>,
) {
    if interval.is_zero() {
        return;
    }
    loop {
        tokio::time::sleep(interval).await;
        let current = *stage.borrow();
        if let Err(err) = queue.update_heartbeat(&job_id, Some(current)).await {
            tracing::debug!(job_id = %job_id, error = %err, "heartbeat write failed");
        }
        if let Err(err) = queue
            .publish_event(&QueueEvent::Heartbeat {
                job_id: job_id.clone(),
                status: current,
            })
            .await
        {
            tracing::debug!(job_id = %job_id, error = %err, "heartbeat publish failed");
        }
        tracing::trace!(job_id = %job_id, status = %current, "heartbeat");
    }
}

/// Split text into chunks of at most `limit` characters, preserving order.
/// Splits on raw character count, not word boundaries.
pub fn chunk_text(text: &str, limit: usize) -> Vec<String> {
    if text.is_empty() || limit == 0 {
        return Vec::new();
    }
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(limit)
        .map(|chunk| chunk.iter().collect())
        .collect()
}
