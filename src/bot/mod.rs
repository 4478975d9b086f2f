//! HTTP client for the bot service.
//!
//! The bot service owns conversations, the agent registry, and agent
//! execution; this module only speaks its API. The worker consumes the
//! message-create call through the [`AgentBackend`] trait so it can be
//! exercised against an in-process mock; the gateway additionally uses the
//! registry and conversation endpoints.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::RwLock;

use crate::config::BotConfig;
use crate::error::BotError;

/// One entry of the agent registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
}

/// A newly created or fetched conversation.
#[derive(Debug, Clone, Deserialize)]
pub struct ConversationRecord {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// The agent's reply within a message-create response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentMessage {
    #[serde(default)]
    pub raw_text: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl AgentMessage {
    pub fn agent_status(&self) -> Option<&str> {
        self.metadata.get("agent_status").and_then(Value::as_str)
    }

    pub fn is_interrupted(&self) -> bool {
        self.agent_status() == Some("interrupted")
    }

    pub fn usage(&self) -> Option<Value> {
        self.metadata.get("usage").cloned()
    }

    /// The clarifying question of an interrupt, when the agent supplied one.
    pub fn interrupt_question(&self) -> Option<String> {
        self.metadata
            .get("interrupt_payload")
            .and_then(|payload| payload.get("question"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Attachments produced by the agent: the explicit metadata list when
    /// present, otherwise media segments embedded in the structured content.
    pub fn attachments(&self) -> Vec<Value> {
        if let Some(Value::Array(items)) = self.metadata.get("attachments") {
            let attachments: Vec<Value> =
                items.iter().filter(|item| item.is_object()).cloned().collect();
            if !attachments.is_empty() {
                return attachments;
            }
        }

        let parts = match &self.content {
            Value::Object(map) if map.get("type").and_then(Value::as_str) == Some("segments") => {
                map.get("parts").and_then(Value::as_array)
            }
            Value::Array(items) => Some(items),
            _ => None,
        };
        let Some(parts) = parts else {
            return Vec::new();
        };
        parts
            .iter()
            .filter(|piece| {
                matches!(
                    piece.get("type").and_then(Value::as_str),
                    Some("file" | "image" | "audio" | "video" | "attachment")
                )
            })
            .cloned()
            .collect()
    }
}

/// Full message-create response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendMessageReply {
    #[serde(default)]
    pub conversation: Value,
    #[serde(default)]
    pub user_message: Value,
    #[serde(default)]
    pub agent_message: AgentMessage,
}

/// A message on its way to the bot service.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub conversation_id: String,
    pub user_id: String,
    pub user_role: Option<String>,
    pub text: String,
    pub raw_user_text: Option<String>,
    pub attachments: Option<Vec<Value>>,
    pub metadata: Option<Value>,
}

/// The single call the worker makes per job.
///
/// Failures carry a message; the worker records it verbatim and never
/// retries.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn send_message(&self, message: &OutboundMessage) -> Result<SendMessageReply, BotError>;
}

pub struct BotServiceClient {
    client: reqwest::Client,
    base_url: String,
    agents: RwLock<HashMap<String, AgentInfo>>,
}

impl BotServiceClient {
    /// Build a client. Only the connect timeout is enforced at the HTTP
    /// layer; the request timeout is advisory and handled by the worker.
    pub fn new(cfg: &BotConfig) -> Result<Self, BotError> {
        let client = reqwest::Client::builder()
            .connect_timeout(cfg.connect_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            agents: RwLock::new(HashMap::new()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn user_headers(user_id: &str, user_role: Option<&str>) -> Vec<(&'static str, String)> {
        let mut headers = vec![("X-User-Id", user_id.to_string())];
        if let Some(role) = user_role {
            headers.push(("X-User-Role", role.to_string()));
        }
        headers
    }

    /// Re-fetch the agent registry.
    pub async fn refresh_agents(&self) -> Result<(), BotError> {
        let endpoint = self.url("/agents/");
        let response = self.client.get(&endpoint).send().await?;
        let agents: Vec<AgentInfo> = Self::decode(response, &endpoint).await?;
        let mut cache = self.agents.write().await;
        *cache = agents.into_iter().map(|agent| (agent.id.clone(), agent)).collect();
        tracing::debug!(count = cache.len(), "refreshed agent registry");
        Ok(())
    }

    /// Check the agent exists, refreshing the cache on a miss.
    pub async fn ensure_agent(&self, agent_id: &str) -> Result<(), BotError> {
        if self.agents.read().await.contains_key(agent_id) {
            return Ok(());
        }
        self.refresh_agents().await?;
        if self.agents.read().await.contains_key(agent_id) {
            Ok(())
        } else {
            Err(BotError::UnknownAgent(agent_id.to_string()))
        }
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentInfo>, BotError> {
        if self.agents.read().await.is_empty() {
            self.refresh_agents().await?;
        }
        let mut agents: Vec<AgentInfo> = self.agents.read().await.values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(agents)
    }

    pub async fn create_conversation(
        &self,
        agent_id: &str,
        user_id: &str,
        user_role: Option<&str>,
    ) -> Result<ConversationRecord, BotError> {
        let endpoint = self.url("/conversations/");
        let mut body = json!({ "agent_id": agent_id });
        if let Some(role) = user_role {
            body["user_role"] = json!(role);
        }
        let mut request = self.client.post(&endpoint).json(&body);
        for (name, value) in Self::user_headers(user_id, user_role) {
            request = request.header(name, value);
        }
        let response = request.send().await?;
        Self::decode(response, &endpoint).await
    }

    /// Check the HTTP status, then decode the body against `T`.
    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        endpoint: &str,
    ) -> Result<T, BotError> {
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(BotError::Status {
                status: status.as_u16(),
                endpoint: endpoint.to_string(),
                detail,
            });
        }
        let body: Value = response.json().await?;
        serde_json::from_value(body).map_err(|err| BotError::Contract(err.to_string()))
    }
}

#[async_trait]
impl AgentBackend for BotServiceClient {
    async fn send_message(&self, message: &OutboundMessage) -> Result<SendMessageReply, BotError> {
        let endpoint = self.url(&format!(
            "/conversations/{}/messages",
            message.conversation_id
        ));

        let mut metadata = match &message.metadata {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };
        if let Some(raw) = &message.raw_user_text {
            metadata.insert("raw_user_text".to_string(), json!(raw));
        }
        let body = json!({
            "payload": {
                "type": "text",
                "text": message.text,
                "metadata": metadata,
                "attachments": message.attachments.clone().unwrap_or_default(),
            }
        });

        let mut request = self.client.post(&endpoint).json(&body);
        for (name, value) in Self::user_headers(&message.user_id, message.user_role.as_deref()) {
            request = request.header(name, value);
        }
        let response = request.send().await?;
        Self::decode(response, &endpoint).await
    }
}
