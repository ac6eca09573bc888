//! Streaming responses.
//!
//! Long-running operations run on a spawned worker task; the response body
//! is the operation's event queue, serialized as one JSON document per line
//! until the termination sentinel. A plaintext rendering is available for
//! human consumers (the git push output, for example).

use std::convert::Infallible;

use axum::body::{Body, Bytes};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use tokio::sync::mpsc;

use stevedore_core::Event;

/// How a stream renders events to the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    /// One JSON document per line.
    Json,
    /// `----->` job lines and indented log lines.
    Text,
}

impl StreamFormat {
    fn content_type(self) -> &'static str {
        match self {
            StreamFormat::Json => "application/x-ndjson",
            StreamFormat::Text => "text/plain; charset=utf-8",
        }
    }

    fn render(self, event: &Event) -> Option<Bytes> {
        match self {
            StreamFormat::Json => event
                .to_value()
                .map(|value| Bytes::from(format!("{value}\n"))),
            StreamFormat::Text => event.render_text().map(Bytes::from),
        }
    }
}

/// Turns an event receiver into a streaming response. The stream ends at
/// the first [`Event::Done`] (or when the worker drops its context).
pub fn stream_response(rx: mpsc::Receiver<Event>, format: StreamFormat) -> Response {
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (event, rx))
    })
    .take_while(|event| futures::future::ready(!matches!(event, Event::Done)))
    .filter_map(move |event| futures::future::ready(format.render(&event).map(Ok::<_, Infallible>)));

    (
        [(header::CONTENT_TYPE, format.content_type())],
        Body::from_stream(stream),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use stevedore_core::Context;

    async fn collect(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn json_stream_is_newline_delimited_until_done() {
        let (ctx, rx) = Context::channel(16);
        ctx.job("phase one").await;
        ctx.log("working").await;
        ctx.done().await;
        ctx.log("after the sentinel").await;

        let body = collect(stream_response(rx, StreamFormat::Json)).await;
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"{"job":"phase one"}"#);
        assert_eq!(lines[1], r#"{"log":"working"}"#);
    }

    #[tokio::test]
    async fn text_stream_renders_human_output() {
        let (ctx, rx) = Context::channel(16);
        ctx.job("deploying").await;
        ctx.error("bad").await;
        ctx.done().await;

        let body = collect(stream_response(rx, StreamFormat::Text)).await;
        assert_eq!(body, "-----> deploying\n       Error: bad\n");
    }
}
