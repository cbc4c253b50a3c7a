//! HTTP/1.1 response builder and wire encoding.
//!
//! A response body is decided when the response is built, never inferred
//! later: raw bytes with their content type, a JSON value, or a stream of
//! chunks fed by a background task (used for server-sent events).

use std::borrow::Cow;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use super::{Headers, StatusCode};

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
const APPLICATION_JSON: &str = "application/json";

/// A buffered response body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Bytes sent as-is under the given content type.
    Raw {
        bytes: Bytes,
        content_type: Cow<'static, str>,
    },
    /// A structured value serialized as compact JSON on the wire.
    Json(serde_json::Value),
}

impl Payload {
    /// UTF-8 text served as `text/plain`.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Raw {
            bytes: Bytes::from(text.into()),
            content_type: Cow::Borrowed(TEXT_PLAIN),
        }
    }

    pub fn content_type(&self) -> &str {
        match self {
            Self::Raw { content_type, .. } => content_type,
            Self::Json(_) => APPLICATION_JSON,
        }
    }

    /// The exact bytes written after the header block.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Self::Raw { bytes, .. } => bytes.clone(),
            Self::Json(value) => Bytes::from(value.to_string()),
        }
    }
}

/// The body of a [`Response`].
#[derive(Debug, Default)]
pub enum Body {
    #[default]
    Empty,
    Payload(Payload),
    /// Chunks are written with `Transfer-Encoding: chunked` as they arrive;
    /// the body ends when every sender is dropped.
    Stream(mpsc::Receiver<Bytes>),
}

/// An HTTP/1.1 response, ready to be serialized and sent.
///
/// # Examples
///
/// ```
/// use kiri::http::{Response, StatusCode};
/// use serde_json::json;
///
/// let response = Response::new(StatusCode::Ok).json(json!({ "counter": 3 }));
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Type: application/json\r\n"));
/// assert!(text.ends_with("{\"counter\":3}"));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Body,
    keep_alive: bool,
}

impl Response {
    /// Creates a response with the given status and no body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Body::Empty,
            keep_alive: true,
        }
    }

    /// `404 Not found`, the answer when nothing in a chain responds.
    pub fn not_found() -> Self {
        Self::new(StatusCode::NotFound).body("Not found")
    }

    /// Appends a header; repeated names are kept.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a header in place, for middleware decorating a downstream response.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Sets a header in place, replacing earlier values for the same name.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.set(name, value);
    }

    /// Plain-text body.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Body::Payload(Payload::text(body));
        self
    }

    /// Raw bytes under an explicit content type.
    #[must_use]
    pub fn body_bytes(
        mut self,
        bytes: impl Into<Bytes>,
        content_type: impl Into<Cow<'static, str>>,
    ) -> Self {
        self.body = Body::Payload(Payload::Raw {
            bytes: bytes.into(),
            content_type: content_type.into(),
        });
        self
    }

    /// JSON body.
    #[must_use]
    pub fn json(mut self, value: serde_json::Value) -> Self {
        self.body = Body::Payload(Payload::Json(value));
        self
    }

    #[must_use]
    pub fn payload(mut self, payload: Payload) -> Self {
        self.body = Body::Payload(payload);
        self
    }

    /// Streamed body; each received chunk is flushed to the client.
    #[must_use]
    pub fn stream(mut self, chunks: mpsc::Receiver<Bytes>) -> Self {
        self.body = Body::Stream(chunks);
        self
    }

    /// Controls whether `Connection: keep-alive` or `Connection: close` is
    /// written. A `Connection: close` header set by a handler wins over
    /// `true`.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body_ref(&self) -> &Body {
        &self.body
    }

    pub fn into_body(self) -> Body {
        self.body
    }

    /// Buffered body bytes, or `None` for an empty or streamed body.
    pub fn body_bytes_ref(&self) -> Option<Bytes> {
        match &self.body {
            Body::Payload(payload) => Some(payload.to_bytes()),
            _ => None,
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self.body, Body::Stream(_))
    }

    /// Whether the connection may be reused after this response.
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
            && !self
                .headers
                .get("connection")
                .is_some_and(|value| value.trim().eq_ignore_ascii_case("close"))
    }

    /// Serializes a buffered response using HTTP/1.1 wire format.
    ///
    /// Adds `Content-Type` from the payload when the handler did not set one,
    /// `Content-Length`, and a `Connection` header matching
    /// [`is_keep_alive`](Self::is_keep_alive), replacing any set earlier. A
    /// streamed body contributes only its head here; use
    /// [`write_to`](Self::write_to) to send it.
    pub fn into_bytes(mut self) -> BytesMut {
        let payload = match &self.body {
            Body::Payload(payload) => Some(payload.to_bytes()),
            Body::Empty | Body::Stream(_) => None,
        };
        let mut buf = self.encode_head(Some(payload.as_ref().map_or(0, Bytes::len)));
        if let Some(bytes) = payload {
            buf.put(bytes);
        }
        buf
    }

    /// Writes the response to `out`, streaming chunked bodies until the
    /// producer finishes.
    ///
    /// # Errors
    ///
    /// Returns the first write error; for a stream this usually means the
    /// client went away, and dropping the receiver tells the producer.
    pub async fn write_to<W>(mut self, out: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut chunks = match std::mem::take(&mut self.body) {
            Body::Stream(chunks) => chunks,
            buffered => {
                self.body = buffered;
                out.write_all(&self.into_bytes()).await?;
                return out.flush().await;
            }
        };

        out.write_all(&self.encode_head(None)).await?;
        out.flush().await?;
        while let Some(chunk) = chunks.recv().await {
            if chunk.is_empty() {
                continue;
            }
            out.write_all(format!("{:X}\r\n", chunk.len()).as_bytes())
                .await?;
            out.write_all(&chunk).await?;
            out.write_all(b"\r\n").await?;
            out.flush().await?;
        }
        out.write_all(b"0\r\n\r\n").await?;
        out.flush().await
    }

    // `None` means chunked transfer encoding.
    fn encode_head(&mut self, content_length: Option<usize>) -> BytesMut {
        if let Body::Payload(payload) = &self.body {
            if !self.headers.contains("content-type") {
                self.headers.insert("Content-Type", payload.content_type().to_owned());
            }
        }
        let connection = if self.is_keep_alive() { "keep-alive" } else { "close" };
        self.headers.set("Connection", connection);

        let mut buf = BytesMut::with_capacity(128 + self.headers.len() * 64);
        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );
        buf.put(self.headers.to_string().as_bytes());
        match content_length {
            Some(len) => buf.put(format!("Content-Length: {len}\r\n").as_bytes()),
            None => buf.put(&b"Transfer-Encoding: chunked\r\n"[..]),
        }
        buf.put(&b"\r\n"[..]);
        buf
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}
