//! The per-operation progress channel.
//!
//! Every potentially long-running controller operation is attached to a
//! [`Context`]: a bounded single-producer queue of structured [`Event`]s.
//! The operation enqueues job/log/error entries as it proceeds; the HTTP
//! edge drains the queue on a separate task and streams each event to the
//! client as one JSON document per line.
//!
//! The context is passed explicitly through the controller call graph, so
//! concurrently running deploys never mix their event streams.

use serde_json::{Map, Value, json};
use tokio::sync::mpsc;

/// One entry on a progress stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A new phase label.
    Job(String),
    /// Informational output.
    Log(String),
    /// A recoverable-level error.
    Error(String),
    /// A plugin-defined shape, e.g. `{"data-request": "web", "tag": "git"}`.
    Custom(Map<String, Value>),
    /// Stream termination sentinel; never serialized.
    Done,
}

impl Event {
    /// The wire representation, or `None` for the sentinel.
    pub fn to_value(&self) -> Option<Value> {
        match self {
            Event::Job(label) => Some(json!({ "job": label })),
            Event::Log(msg) => Some(json!({ "log": msg })),
            Event::Error(msg) => Some(json!({ "error": msg })),
            Event::Custom(fields) => Some(Value::Object(fields.clone())),
            Event::Done => None,
        }
    }

    /// The plaintext rendering for human consumption, or `None` for events
    /// without one.
    pub fn render_text(&self) -> Option<String> {
        match self {
            Event::Job(label) => Some(format!("-----> {label}\n")),
            Event::Log(msg) => Some(format!("       {msg}\n")),
            Event::Error(msg) => Some(format!("       Error: {msg}\n")),
            Event::Custom(_) | Event::Done => None,
        }
    }
}

/// Sending half of a progress channel.
///
/// Cloning is cheap; all clones feed the same stream. Sends apply
/// backpressure when the consumer lags and become no-ops once the consumer
/// is gone, so a client disconnect never cancels the operation.
#[derive(Clone)]
pub struct Context {
    tx: mpsc::Sender<Event>,
}

impl Context {
    /// Creates a context and the receiver the response streamer drains.
    pub fn channel(capacity: usize) -> (Context, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Context { tx }, rx)
    }

    /// A context without a consumer, for bootstrap paths and tests that do
    /// not observe the stream.
    pub fn null() -> Context {
        let (ctx, _rx) = Context::channel(1);
        ctx
    }

    async fn send(&self, event: Event) {
        // The receiver being gone means the client went away; the operation
        // keeps running to completion regardless.
        let _ = self.tx.send(event).await;
    }

    /// Announces a new phase.
    pub async fn job(&self, label: impl Into<String>) {
        self.send(Event::Job(label.into())).await;
    }

    pub async fn log(&self, msg: impl Into<String>) {
        self.send(Event::Log(msg.into())).await;
    }

    pub async fn error(&self, msg: impl Into<String>) {
        self.send(Event::Error(msg.into())).await;
    }

    /// Emits a plugin-defined event shape.
    pub async fn custom(&self, fields: Map<String, Value>) {
        self.send(Event::Custom(fields)).await;
    }

    /// Emits a final error and terminates the stream.
    pub async fn fatal(&self, msg: impl Into<String>) {
        self.error(msg).await;
        self.done().await;
    }

    /// Terminates the stream.
    pub async fn done(&self) {
        self.send(Event::Done).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_enqueue_order() {
        let (ctx, mut rx) = Context::channel(16);
        ctx.job("one").await;
        ctx.log("two").await;
        ctx.error("three").await;
        ctx.done().await;

        assert_eq!(rx.recv().await, Some(Event::Job("one".to_string())));
        assert_eq!(rx.recv().await, Some(Event::Log("two".to_string())));
        assert_eq!(rx.recv().await, Some(Event::Error("three".to_string())));
        assert_eq!(rx.recv().await, Some(Event::Done));
    }

    #[tokio::test]
    async fn fatal_is_error_then_sentinel() {
        let (ctx, mut rx) = Context::channel(4);
        ctx.fatal("boom").await;
        assert_eq!(rx.recv().await, Some(Event::Error("boom".to_string())));
        assert_eq!(rx.recv().await, Some(Event::Done));
    }

    #[tokio::test]
    async fn sends_after_consumer_gone_are_dropped() {
        let (ctx, rx) = Context::channel(1);
        drop(rx);
        // Must not error or block.
        ctx.job("ignored").await;
        ctx.done().await;
    }

    #[test]
    fn wire_shapes() {
        assert_eq!(
            Event::Job("x".to_string()).to_value(),
            Some(serde_json::json!({"job": "x"}))
        );
        assert_eq!(Event::Done.to_value(), None);
        assert_eq!(
            Event::Job("deploy".to_string()).render_text().unwrap(),
            "-----> deploy\n"
        );
        assert_eq!(
            Event::Error("bad".to_string()).render_text().unwrap(),
            "       Error: bad\n"
        );
    }
}
