//! Real-time communication — Server-Sent Events.
//!
//! [`event_stream`] returns a streaming [`Response`] and the [`EventSender`]
//! that feeds it. The sender fails once the client disconnects, which is
//! the producer's signal to stop.

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::http::{Response, StatusCode};

/// Writing half of an SSE response.
#[derive(Debug, Clone)]
pub struct EventSender {
    chunks: mpsc::Sender<Bytes>,
}

impl EventSender {
    /// Sends `value` as one `data:` event.
    ///
    /// # Errors
    ///
    /// [`Error::Json`] if `value` does not serialize, or
    /// [`Error::Message`] once the client has gone away.
    pub async fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let data = serde_json::to_string(value)?;
        self.send_raw(format!("data: {data}\n\n")).await
    }

    /// Sends a named event; `data` is written verbatim, one `data:` line per
    /// line of input.
    pub async fn send_event(&self, event: &str, data: &str) -> Result<()> {
        let mut frame = format!("event: {event}\n");
        for line in data.lines() {
            frame.push_str("data: ");
            frame.push_str(line);
            frame.push('\n');
        }
        frame.push('\n');
        self.send_raw(frame).await
    }

    /// Resolves when the client has disconnected.
    pub async fn closed(&self) {
        self.chunks.closed().await;
    }

    pub fn is_closed(&self) -> bool {
        self.chunks.is_closed()
    }

    async fn send_raw(&self, frame: String) -> Result<()> {
        self.chunks
            .send(Bytes::from(frame))
            .await
            .map_err(|_| Error::msg("event stream closed by client"))
    }
}

/// Creates an SSE response and its sender.
///
/// `capacity` bounds how many events may be queued before
/// [`EventSender::send_json`] waits for the connection to catch up.
///
/// ```rust,no_run
/// use serde_json::json;
/// use kiri::realtime::event_stream;
///
/// # async fn handler() -> kiri::Result<kiri::Response> {
/// let (events, response) = event_stream(16);
/// tokio::spawn(async move {
///     let _ = events.send_json(&json!({ "counter": 1 })).await;
/// });
/// Ok(response)
/// # }
/// ```
pub fn event_stream(capacity: usize) -> (EventSender, Response) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let response = Response::new(StatusCode::Ok)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .header("Access-Control-Allow-Headers", "Cache-Control")
        .stream(rx);
    (EventSender { chunks: tx }, response)
}
