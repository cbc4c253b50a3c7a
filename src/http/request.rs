//! HTTP/1.1 request parsing using the [`httparse`] crate.

use std::collections::HashMap;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use thiserror::Error;

use super::{Headers, Method};

/// Errors that can occur while parsing an HTTP/1.1 request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete — more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid Content-Length header: {value:?}")]
    InvalidContentLength { value: String },

    #[error("request body exceeds maximum allowed size of {max_bytes} bytes")]
    BodyTooLarge { max_bytes: usize },

    #[error("request head exceeds maximum allowed size of {max_bytes} bytes")]
    HeadTooLarge { max_bytes: usize },
}

/// A parsed HTTP/1.1 request.
///
/// Requests are immutable once parsed and cheap to clone: the body is a
/// reference-counted [`Bytes`] buffer.
///
/// # Examples
///
/// ```
/// use kiri::http::Request;
///
/// let raw = b"POST /api/counter?dry=1 HTTP/1.1\r\nHost: localhost\r\nContent-Length: 15\r\n\r\n{\"increment\":2}";
/// let (request, consumed) = Request::parse(raw).unwrap();
///
/// assert_eq!(consumed, raw.len());
/// assert_eq!(request.path(), "/api/counter");
/// assert_eq!(request.query_param("dry"), Some("1"));
/// assert_eq!(request.body().as_ref(), b"{\"increment\":2}");
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    query: Option<String>,
    body: Bytes,
    params: HashMap<String, String>,
}

impl Request {
    const MAX_HEADERS: usize = 64;

    /// Largest body accepted before the request is rejected.
    pub const MAX_BODY_SIZE: usize = 8 * 1024 * 1024;

    /// Largest request line plus headers accepted, in bytes.
    pub const MAX_HEAD_SIZE: usize = 64 * 1024;

    /// Builds an HTTP/1.1 request in memory, mainly for tests and for
    /// driving an [`App`](crate::app::App) without a socket.
    ///
    /// `target` may carry a query string (`/search?q=kiri`).
    pub fn new(method: Method, target: &str) -> Self {
        let (path, query) = split_target(target);
        let params = query.as_deref().map(parse_query_string).unwrap_or_default();
        Self {
            method,
            path,
            version: 1,
            headers: Headers::new(),
            query,
            body: Bytes::new(),
            params,
        }
    }

    /// Adds a header to an in-memory request.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Replaces the body of an in-memory request.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Parses one complete request from the front of `buf`.
    ///
    /// Returns the request and the number of bytes it occupied (headers plus
    /// `Content-Length` body bytes). Anything after that belongs to the next
    /// pipelined request.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`] — headers or body not fully buffered yet.
    /// - [`RequestError::Parse`] — malformed request line or headers.
    /// - [`RequestError::InvalidContentLength`] — non-numeric `Content-Length`.
    /// - [`RequestError::BodyTooLarge`] — declared body over [`Self::MAX_BODY_SIZE`].
    /// - [`RequestError::HeadTooLarge`] — more than [`Self::MAX_HEAD_SIZE`]
    ///   bytes buffered without the end of the header block.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let body_offset = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial if buf.len() > Self::MAX_HEAD_SIZE => {
                return Err(RequestError::HeadTooLarge {
                    max_bytes: Self::MAX_HEAD_SIZE,
                });
            }
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let Ok(method) = raw_req
            .method
            .ok_or(RequestError::MissingField { field: "method" })?
            .parse::<Method>();

        let target = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;
        let (path, query) = split_target(target);

        let version = raw_req
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut header_map = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.insert(header.name, value);
            }
        }

        let content_length = match header_map.get("content-length") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .map_err(|_| RequestError::InvalidContentLength {
                    value: raw.to_owned(),
                })?,
            None => 0,
        };
        if content_length > Self::MAX_BODY_SIZE {
            return Err(RequestError::BodyTooLarge {
                max_bytes: Self::MAX_BODY_SIZE,
            });
        }

        let consumed = body_offset + content_length;
        if buf.len() < consumed {
            return Err(RequestError::Incomplete);
        }

        let params = query.as_deref().map(parse_query_string).unwrap_or_default();
        let body = Bytes::copy_from_slice(&buf[body_offset..consumed]);

        Ok((
            Self {
                method,
                path,
                version,
                headers: header_map,
                query,
                body,
                params,
            },
            consumed,
        ))
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Request path without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// HTTP minor version (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Shorthand for `headers().get(name)`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// The path followed by `?query` when a query string was present.
    pub fn url(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }

    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Deserializes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// `true` when the connection should stay open after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive; HTTP/1.0 only with an explicit
    /// `Connection: keep-alive`.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(conn) => conn.eq_ignore_ascii_case("keep-alive"),
            None => self.version == 1,
        }
    }
}

fn split_target(target: &str) -> (String, Option<String>) {
    match target.split_once('?') {
        Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
        None => (target.to_owned(), None),
    }
}

/// Parses `key=value&key2=value2`, decoding `+` as a space.
fn parse_query_string(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key.replace('+', " "), value.replace('+', " "))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_get() {
        let raw = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (req, consumed) = Request::parse(raw).unwrap();
        assert_eq!(req.method(), &Method::Get);
        assert_eq!(req.path(), "/");
        assert_eq!(req.version(), 1);
        assert_eq!(req.header("host"), Some("localhost"));
        assert_eq!(consumed, raw.len());
        assert!(req.body().is_empty());
    }

    #[test]
    fn body_waits_for_content_length() {
        let raw = b"POST /api/counter HTTP/1.1\r\nContent-Length: 10\r\n\r\n{\"a\"";
        assert!(matches!(Request::parse(raw), Err(RequestError::Incomplete)));
    }

    #[test]
    fn pipelined_bytes_are_left_for_the_next_request() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 2\r\n\r\nhiGET / HTTP/1.1\r\n\r\n";
        let (req, consumed) = Request::parse(raw).unwrap();
        assert_eq!(req.body().as_ref(), b"hi");
        assert!(raw[consumed..].starts_with(b"GET / "));
    }

    #[test]
    fn unterminated_head_is_bounded() {
        let mut raw = b"GET / HTTP/1.1\r\nX-Filler: ".to_vec();
        raw.resize(Request::MAX_HEAD_SIZE, b'a');
        assert!(matches!(Request::parse(&raw), Err(RequestError::Incomplete)));

        raw.push(b'a');
        assert!(matches!(
            Request::parse(&raw),
            Err(RequestError::HeadTooLarge { .. })
        ));
    }

    #[test]
    fn rejects_garbage_content_length() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: lots\r\n\r\n";
        assert!(matches!(
            Request::parse(raw),
            Err(RequestError::InvalidContentLength { .. })
        ));
    }

    #[test]
    fn query_string_is_split_from_path() {
        let req = Request::new(Method::Get, "/search?q=kiri+web&page=2&flag");
        assert_eq!(req.path(), "/search");
        assert_eq!(req.query_param("q"), Some("kiri web"));
        assert_eq!(req.query_param("page"), Some("2"));
        assert_eq!(req.query_param("flag"), Some(""));
        assert_eq!(req.url(), "/search?q=kiri+web&page=2&flag");
    }

    #[test]
    fn json_body_deserializes() {
        #[derive(serde::Deserialize)]
        struct Increment {
            increment: i64,
        }
        let req = Request::new(Method::Post, "/api/counter").with_body(r#"{"increment":5}"#);
        let body: Increment = req.json().unwrap();
        assert_eq!(body.increment, 5);
    }

    #[test]
    fn keep_alive_rules() {
        let (http11, _) = Request::parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert!(http11.is_keep_alive());
        let (http10, _) = Request::parse(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert!(!http10.is_keep_alive());
        let (closed, _) = Request::parse(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();
        assert!(!closed.is_keep_alive());
    }
}
