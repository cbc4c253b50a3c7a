//! Per-request context threaded through the middleware chain.
//!
//! A [`Context`] is created by [`App`](crate::app::App) for every request and
//! handed to each middleware as `&mut Context`. It carries the request, a
//! response draft that middleware can fill in and convert with
//! [`Context::to_response`], an open-ended JSON state map for passing data
//! between stages, and the path remainder left after prefix matching.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::http::{Headers, Payload, Request, Response, StatusCode};

/// Response fields a middleware may set before the response is built.
#[derive(Debug, Clone, Default)]
pub struct ResponseDraft {
    pub status: Option<StatusCode>,
    pub headers: Headers,
    pub body: Option<Payload>,
}

/// Identifies one [`once`](crate::middleware::once) wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OnceId(pub(crate) u64);

/// Per-request context.
#[derive(Debug, Clone)]
pub struct Context {
    request: Request,
    original_path: String,
    path: String,
    pub response: ResponseDraft,
    pub state: HashMap<String, Value>,
    once_marks: HashSet<OnceId>,
}

impl Context {
    pub fn new(request: Request) -> Self {
        let original_path = request.path().to_owned();
        Self {
            path: original_path.clone(),
            original_path,
            request,
            response: ResponseDraft::default(),
            state: HashMap::new(),
            once_marks: HashSet::new(),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Path left after the longest currently matched mount prefix.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Full request path, unaffected by prefix matching.
    pub fn original_path(&self) -> &str {
        &self.original_path
    }

    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = path.into();
    }

    /// Narrows [`path`](Self::path) to what follows `prefix` in the original
    /// path. Returns the previous path so the caller can restore it, or
    /// `None` when the prefix is the root or does not match.
    pub(crate) fn narrow(&mut self, prefix: &str) -> Option<String> {
        if prefix == "/" {
            return None;
        }
        let remainder = match self.original_path.strip_prefix(prefix)? {
            "" => "/".to_owned(),
            rest => rest.to_owned(),
        };
        Some(std::mem::replace(&mut self.path, remainder))
    }

    /// Records that the `once` wrapper `id` ran for this request; returns
    /// `false` if it had already run.
    pub(crate) fn mark_once(&mut self, id: OnceId) -> bool {
        self.once_marks.insert(id)
    }

    pub fn get_state(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }

    pub fn set_state(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.state.insert(key.into(), value.into());
    }

    /// Builds a [`Response`] from the draft. Status defaults to `200`.
    pub fn to_response(&self) -> Response {
        let mut response = Response::new(self.response.status.unwrap_or(StatusCode::Ok));
        if let Some(body) = &self.response.body {
            response = response.payload(body.clone());
        }
        response.headers_mut().merge(&self.response.headers);
        response
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::http::Method;

    fn ctx(path: &str) -> Context {
        Context::new(Request::new(Method::Get, path))
    }

    #[test]
    fn starts_with_full_path() {
        let ctx = ctx("/api/counter?x=1");
        assert_eq!(ctx.path(), "/api/counter");
        assert_eq!(ctx.original_path(), "/api/counter");
    }

    #[test]
    fn narrow_returns_previous_path() {
        let mut ctx = ctx("/api/counter");
        let previous = ctx.narrow("/api");
        assert_eq!(previous.as_deref(), Some("/api/counter"));
        assert_eq!(ctx.path(), "/counter");
        assert_eq!(ctx.original_path(), "/api/counter");
    }

    #[test]
    fn narrow_to_exact_prefix_leaves_root() {
        let mut ctx = ctx("/api");
        ctx.narrow("/api");
        assert_eq!(ctx.path(), "/");
    }

    #[test]
    fn narrow_ignores_root_and_mismatch() {
        let mut ctx = ctx("/assets/app.js");
        assert!(ctx.narrow("/").is_none());
        assert!(ctx.narrow("/api").is_none());
        assert_eq!(ctx.path(), "/assets/app.js");
    }

    #[test]
    fn once_marks_are_per_id() {
        let mut ctx = ctx("/");
        assert!(ctx.mark_once(OnceId(1)));
        assert!(!ctx.mark_once(OnceId(1)));
        assert!(ctx.mark_once(OnceId(2)));
    }

    #[test]
    fn draft_json_body_becomes_json_response() {
        let mut ctx = ctx("/");
        ctx.response.status = Some(StatusCode::InternalServerError);
        ctx.response.body = Some(Payload::Json(json!({ "error": "x" })));
        ctx.response.headers.insert("X-Trace", "1");

        let response = ctx.to_response();
        assert_eq!(response.status(), StatusCode::InternalServerError);
        assert_eq!(response.headers().get("x-trace"), Some("1"));
        assert_eq!(
            response.body_bytes_ref().as_deref(),
            Some(&b"{\"error\":\"x\"}"[..])
        );
    }

    #[test]
    fn state_round_trips_values() {
        let mut ctx = ctx("/");
        ctx.set_state("user", "ana");
        assert_eq!(ctx.get_state("user"), Some(&json!("ana")));
        assert!(ctx.get_state("missing").is_none());
    }
}
