//! OpenAI-shaped request and response schemas, plus prompt assembly.
//!
//! Only the surface the queue needs is modelled here: text content (string or
//! text-part arrays), the conversation handle, and the stream flag. Rich
//! attachment normalization stays with the bot service.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::bot::AgentInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Message content: either a plain string or an array of typed parts, of
/// which only the text parts are kept.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl MessageContent {
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|part| part.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: MessageContent,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub user: Option<String>,
    /// Continue an existing conversation instead of creating one.
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Error)]
#[error("chat request must include at least one user message")]
pub struct MissingUserMessage;

/// Prompt assembled from the OpenAI message list.
#[derive(Debug, PartialEq)]
pub struct BuiltPrompt {
    pub prompt: String,
    /// The verbatim last user turn, forwarded for interrupt resumption.
    pub latest_user_text: String,
}

/// Flatten the message list into a single prompt: system chunks first, then a
/// history block of everything but the last turn, then the latest user text.
pub fn build_prompt(messages: &[ChatMessage]) -> Result<BuiltPrompt, MissingUserMessage> {
    let mut system_chunks = Vec::new();
    let mut conversation_chunks = Vec::new();
    let mut latest_user_text = None;

    for message in messages {
        let text = message.content.as_text();
        match message.role {
            Role::System => system_chunks.push(text),
            Role::Assistant => conversation_chunks.push(format!("Assistant: {text}")),
            Role::User => {
                conversation_chunks.push(format!("User: {text}"));
                latest_user_text = Some(text);
            }
        }
    }

    let latest_user_text = latest_user_text.ok_or(MissingUserMessage)?;

    let mut sections = Vec::new();
    if !system_chunks.is_empty() {
        sections.push(system_chunks.join("\n"));
    }
    if conversation_chunks.len() > 1 {
        let history = &conversation_chunks[..conversation_chunks.len() - 1];
        sections.push(format!("Conversation history:\n{}", history.join("\n")));
    }
    sections.push(latest_user_text.clone());

    let prompt = sections
        .into_iter()
        .filter(|section| !section.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
        .trim()
        .to_string();

    Ok(BuiltPrompt {
        prompt,
        latest_user_text,
    })
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    /// Decode the usage blob carried by a terminal event, tolerating any
    /// shape mismatch.
    pub fn from_event(value: Option<&Value>) -> Self {
        value
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Serialize)]
pub struct ResponseMessage {
    pub role: &'static str,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ResponseMessage,
    pub finish_reason: &'static str,
}

/// Single-shot (non-streaming) completion body.
#[derive(Debug, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Usage,
    pub conversation_id: String,
}

impl ChatCompletionResponse {
    pub fn new(
        model: &str,
        conversation_id: &str,
        content: String,
        metadata: Option<Value>,
        usage: Usage,
    ) -> Self {
        Self {
            id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            object: "chat.completion",
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![ChatChoice {
                index: 0,
                message: ResponseMessage {
                    role: "assistant",
                    content,
                    metadata,
                },
                finish_reason: "stop",
            }],
            usage,
            conversation_id: conversation_id.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ModelCard {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub owned_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelCard>,
}

impl ModelList {
    pub fn from_agents(agents: Vec<AgentInfo>) -> Self {
        Self {
            object: "list",
            data: agents
                .into_iter()
                .map(|agent| ModelCard {
                    id: agent.id,
                    object: "model",
                    created: 0,
                    owned_by: "bot-service".to_string(),
                    name: agent.name,
                    description: agent.description,
                    provider: agent.provider,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(role: Role, text: &str) -> ChatMessage {
        ChatMessage {
            role,
            content: MessageContent::Text(text.to_string()),
        }
    }

    #[test]
    fn single_user_message_is_the_whole_prompt() {
        let built = build_prompt(&[message(Role::User, "hi there")]).unwrap();
        assert_eq!(built.prompt, "hi there");
        assert_eq!(built.latest_user_text, "hi there");
    }

    #[test]
    fn system_and_history_sections_are_assembled_in_order() {
        let built = build_prompt(&[
            message(Role::System, "Be terse."),
            message(Role::User, "What is Rust?"),
            message(Role::Assistant, "A language."),
            message(Role::User, "Name one feature."),
        ])
        .unwrap();
        assert_eq!(
            built.prompt,
            "Be terse.\n\nConversation history:\nUser: What is Rust?\nAssistant: A language.\n\nName one feature."
        );
        assert_eq!(built.latest_user_text, "Name one feature.");
    }

    #[test]
    fn prompt_without_user_message_is_rejected() {
        let result = build_prompt(&[message(Role::System, "hello")]);
        assert!(result.is_err());
    }

    #[test]
    fn part_arrays_flatten_to_their_text_parts() {
        let request: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "agent-a",
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "line one"},
                    {"type": "image_url", "image_url": {"url": "https://example/x.png"}},
                    {"type": "text", "text": "line two"}
                ]
            }]
        }))
        .unwrap();
        assert_eq!(request.messages[0].content.as_text(), "line one\nline two");
    }

    #[test]
    fn usage_decodes_from_event_value() {
        let usage = Usage::from_event(Some(&json!({
            "prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15
        })));
        assert_eq!(usage.total_tokens, 15);
        assert_eq!(Usage::from_event(None).total_tokens, 0);
        assert_eq!(Usage::from_event(Some(&json!("garbage"))).total_tokens, 0);
    }

    #[test]
    fn completion_response_shape() {
        let response = ChatCompletionResponse::new("agent-a", "c1", "hello".to_string(), None, Usage::default());
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["object"], "chat.completion");
        assert_eq!(value["choices"][0]["message"]["role"], "assistant");
        assert_eq!(value["choices"][0]["message"]["content"], "hello");
        assert_eq!(value["choices"][0]["finish_reason"], "stop");
        assert_eq!(value["conversation_id"], "c1");
        assert!(value["id"].as_str().unwrap().starts_with("chatcmpl-"));
    }
}
