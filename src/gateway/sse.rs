//! Translation of queue events into SSE frames.
//!
//! The mapping is a total function over the event enum: every internal event
//! becomes zero or more client frames, terminals are followed by the `[DONE]`
//! sentinel, and heartbeats become comment lines so idle connections stay
//! open without emitting data records.

use std::convert::Infallible;

use axum::response::sse::Event;
use futures::{Stream, StreamExt};
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::queue::{QueueEvent, QueueEventStream};

/// Request-scoped fields stamped onto every frame.
#[derive(Debug, Clone)]
pub struct FrameContext {
    pub job_id: String,
    pub model: String,
    pub conversation_id: String,
}

/// One outgoing SSE record.
#[derive(Debug, PartialEq)]
pub enum Frame {
    Data(Value),
    Comment(String),
    Done,
}

impl Frame {
    fn into_sse(self) -> Event {
        match self {
            Self::Data(value) => Event::default().data(value.to_string()),
            Self::Comment(text) => Event::default().comment(text),
            Self::Done => Event::default().data("[DONE]"),
        }
    }
}

/// Drive a job's event stream into SSE frames until the terminal event.
///
/// If the subscription ends without a terminal (broker disconnect), an error
/// frame is emitted so the client is not left guessing, then the stream ends.
pub fn event_stream(
    ctx: FrameContext,
    mut events: QueueEventStream,
) -> impl Stream<Item = Result<Event, Infallible>> + Send {
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(32);
    tokio::spawn(async move {
        let mut role_sent = false;
        let mut terminated = false;
        while let Some(event) = events.next().await {
            let terminal = event.is_terminal();
            for frame in frames_for(&ctx, &event, &mut role_sent) {
                if tx.send(Ok(frame.into_sse())).await.is_err() {
                    return;
                }
            }
            if terminal {
                terminated = true;
                break;
            }
        }
        if !terminated {
            let error = Frame::Data(json!({
                "error": {
                    "message": "event stream closed before completion",
                    "type": "upstream_disconnected",
                },
                "conversation_id": ctx.conversation_id,
                "job_id": ctx.job_id,
            }));
            for frame in [error, Frame::Done] {
                if tx.send(Ok(frame.into_sse())).await.is_err() {
                    return;
                }
            }
        }
    });
    ReceiverStream::new(rx)
}

/// Map one internal event to its client frames.
pub fn frames_for(ctx: &FrameContext, event: &QueueEvent, role_sent: &mut bool) -> Vec<Frame> {
    match event {
        QueueEvent::Status { status, .. } => {
            vec![Frame::Data(chunk_frame(
                ctx,
                json!({}),
                None,
                Some(status.as_str()),
                None,
            ))]
        }
        QueueEvent::Heartbeat { status, .. } => {
            vec![Frame::Comment(format!("heartbeat {status}"))]
        }
        QueueEvent::Chunk { content, .. } => {
            let mut frames = Vec::new();
            if !*role_sent {
                frames.push(Frame::Data(chunk_frame(
                    ctx,
                    json!({"role": "assistant"}),
                    None,
                    None,
                    None,
                )));
                *role_sent = true;
            }
            frames.push(Frame::Data(chunk_frame(
                ctx,
                json!({"content": content}),
                None,
                None,
                None,
            )));
            frames
        }
        QueueEvent::Completed {
            metadata, usage, ..
        } => {
            let mut frame = chunk_frame(ctx, json!({}), Some("stop"), Some("completed"), None);
            if let Some(usage) = usage {
                frame["usage"] = usage.clone();
            }
            if let Some(attachments) = metadata.as_ref().and_then(|m| m.get("attachments")) {
                frame["message_metadata"] = json!({ "attachments": attachments });
            }
            vec![Frame::Data(frame), Frame::Done]
        }
        QueueEvent::Interrupt {
            content, metadata, ..
        } => {
            let question = content.clone().unwrap_or_default();
            // The role may never have been sent if no chunks preceded the
            // interrupt; fold it into the same delta.
            let delta = if *role_sent {
                json!({"content": question})
            } else {
                json!({"role": "assistant", "content": question})
            };
            *role_sent = true;
            let frame = chunk_frame(
                ctx,
                delta,
                Some("stop"),
                Some("interrupted"),
                Some(interrupt_message_metadata(metadata.as_ref())),
            );
            vec![Frame::Data(frame), Frame::Done]
        }
        QueueEvent::Failed { error, .. } => {
            let frame = json!({
                "error": {
                    "message": error,
                    "type": "bad_gateway",
                },
                "conversation_id": ctx.conversation_id,
                "job_id": ctx.job_id,
            });
            vec![Frame::Data(frame), Frame::Done]
        }
    }
}

fn chunk_frame(
    ctx: &FrameContext,
    delta: Value,
    finish_reason: Option<&str>,
    agent_status: Option<&str>,
    message_metadata: Option<Value>,
) -> Value {
    let mut frame = json!({
        "id": ctx.job_id,
        "object": "chat.completion.chunk",
        "created": chrono::Utc::now().timestamp(),
        "model": ctx.model,
        "conversation_id": ctx.conversation_id,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }],
    });
    if let Some(status) = agent_status {
        frame["agent_status"] = json!(status);
    }
    if let Some(metadata) = message_metadata {
        frame["message_metadata"] = metadata;
    }
    frame
}

/// Flatten the interrupt metadata to what the client needs: the interrupt
/// payload fields plus the agent's text content.
fn interrupt_message_metadata(metadata: Option<&Value>) -> Value {
    let mut out = Map::new();
    if let Some(Value::Object(meta)) = metadata {
        if let Some(Value::Object(payload)) = meta.get("interrupt_payload") {
            out.extend(payload.clone());
        }
        if let Some(content) = meta.get("content")
            && !out.contains_key("content")
        {
            out.insert("content".to_string(), content.clone());
        }
    }
    Value::Object(out)
}
