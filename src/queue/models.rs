//! Job and event records shared by the queue, worker, and gateway.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle stage of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStage {
    Queued,
    Running,
    Streaming,
    Completed,
    Failed,
    Interrupted,
}

impl JobStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Interrupted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "streaming" => Some(Self::Streaming),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "interrupted" => Some(Self::Interrupted),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work pushed onto the broker list. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueuePayload {
    /// Process-unique opaque identifier of the job.
    pub job_id: String,
    /// Agent identifier to execute.
    pub model: String,
    /// Conversation identifier within the bot service.
    pub conversation_id: String,
    /// User identifier forwarded to the bot service.
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_role: Option<String>,
    /// Rendered prompt text to deliver to the agent.
    #[serde(default)]
    pub text: String,
    /// Last user utterance before prompt rendering (used to resume
    /// interrupts).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_user_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Event published on a job's channel.
///
/// One event is one UTF-8 JSON object on the wire, with a `type` tag and the
/// per-variant fields flattened alongside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum QueueEvent {
    /// Stage transition (including the initial `queued`).
    Status { job_id: String, status: JobStage },
    /// One fragment of the agent's reply text.
    Chunk { job_id: String, content: String },
    /// Liveness pulse carrying the job's current stage.
    Heartbeat { job_id: String, status: JobStage },
    /// Terminal: the job finished normally.
    Completed {
        job_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Value>,
    },
    /// Terminal: the job failed.
    Failed { job_id: String, error: String },
    /// Terminal: the agent paused with a clarifying question.
    Interrupt {
        job_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
}

impl QueueEvent {
    pub fn job_id(&self) -> &str {
        match self {
            Self::Status { job_id, .. }
            | Self::Chunk { job_id, .. }
            | Self::Heartbeat { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Interrupt { job_id, .. } => job_id,
        }
    }

    /// Exactly one terminal event closes every job's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Interrupt { .. }
        )
    }
}

/// Decoded view of a job's status hash.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub status: JobStage,
    pub created_at: f64,
    pub updated_at: f64,
    pub last_heartbeat: Option<f64>,
    pub conversation_id: Option<String>,
    pub model: Option<String>,
    pub user_id: Option<String>,
    /// Terminal payload written by `store_result` (or the interrupt path).
    pub result: Option<Value>,
    /// Terminal error written by `store_failure`.
    pub error: Option<String>,
    pub metadata: Option<Value>,
}

impl JobStatus {
    /// Decode the raw hash fields. `None` when the hash is absent.
    pub fn from_fields(fields: HashMap<String, String>) -> Option<Self> {
        if fields.is_empty() {
            return None;
        }
        let status = fields
            .get("status")
            .and_then(|raw| JobStage::parse(raw))
            .unwrap_or(JobStage::Queued);
        Some(Self {
            status,
            created_at: parse_ts(&fields, "created_at"),
            updated_at: parse_ts(&fields, "updated_at"),
            last_heartbeat: fields.get("last_heartbeat").and_then(|v| v.parse().ok()),
            conversation_id: fields.get("conversation_id").cloned(),
            model: fields.get("model").cloned(),
            user_id: fields.get("user_id").cloned(),
            result: fields.get("result").map(|raw| parse_json_field(raw)),
            error: fields.get("error").cloned(),
            metadata: fields.get("metadata").map(|raw| parse_json_field(raw)),
        })
    }
}

fn parse_ts(fields: &HashMap<String, String>, key: &str) -> f64 {
    fields
        .get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or_default()
}

/// JSON-decode a hash field, falling back to the raw string when it was
/// written by something that didn't encode it.
fn parse_json_field(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
