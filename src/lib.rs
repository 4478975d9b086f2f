//! agent-relay: asynchronous job dispatch and event streaming between an
//! OpenAI-compatible HTTP facade and a synchronous agent backend.
//!
//! Chat-completion requests become jobs on a broker-backed FIFO; a worker
//! executes each job against the bot service and publishes a typed lifecycle
//! event stream (`queued → running → streaming → completed | interrupted |
//! failed`); the gateway fans those events back to the originating request as
//! Server-Sent Events or as a single response.

pub mod bot;
pub mod broker;
pub mod config;
pub mod error;
pub mod gateway;
pub mod queue;
pub mod worker;
