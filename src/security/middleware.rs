//! Security middleware — CORS and shared-secret bearer authentication.

use std::sync::Arc;

use super::super::{
    Response, StatusCode,
    context::Context,
    middleware::{BoxFuture, Middleware, MiddlewareHandler, Next},
};

/// CORS middleware — answers preflight requests and stamps
/// `Access-Control-*` headers on every other response.
///
/// Constructed via [`Cors::new`] and further configured through the builder
/// methods [`allow_origin`](Self::allow_origin),
/// [`allow_method`](Self::allow_method), and [`allow_header`](Self::allow_header).
///
/// # Behavior
///
/// - With the wildcard origin `*` in the allow-list (the default) every
///   request is treated as allowed, with or without an `Origin` header.
/// - Otherwise the request's `Origin` must be listed; unlisted or missing
///   origins pass through untouched.
/// - `OPTIONS` requests are short-circuited with `200 OK` and the allow
///   headers plus `Access-Control-Max-Age`; the downstream chain is **not**
///   called.
/// - Other requests run normally and the allow headers are set on the
///   response, replacing values a handler may have written. A specific
///   echoed origin also adds `Vary: Origin`.
///
/// # Examples
///
/// ```rust,no_run
/// use kiri::security::Cors;
///
/// let cors = Cors::new()
///     .allow_origin("https://example.com")
///     .allow_header("X-Request-ID");
/// ```
pub struct Cors {
    allowed_origins: Vec<String>,
    allowed_methods: Vec<String>,
    allowed_headers: Vec<String>,
    max_age_secs: u32,
}

impl Default for Cors {
    fn default() -> Self {
        Self::new()
    }
}

impl Cors {
    /// Permissive defaults:
    ///
    /// | Setting          | Default value                          |
    /// |------------------|----------------------------------------|
    /// | Allowed origins  | `*`                                    |
    /// | Allowed methods  | `GET, POST, PUT, DELETE, OPTIONS`      |
    /// | Allowed headers  | `Content-Type, Authorization`          |
    /// | Preflight max age| 86400 seconds                          |
    pub fn new() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
            allowed_methods: ["GET", "POST", "PUT", "DELETE", "OPTIONS"]
                .map(String::from)
                .to_vec(),
            allowed_headers: vec!["Content-Type".to_string(), "Authorization".to_string()],
            max_age_secs: 86_400,
        }
    }

    /// Restricts the allow-list to exactly the given origins.
    #[must_use]
    pub fn only_origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_origins = origins.into_iter().map(Into::into).collect();
        self
    }

    /// Adds an allowed origin. `*` permits every origin.
    #[must_use]
    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        self.allowed_origins.push(origin.into());
        self
    }

    #[must_use]
    pub fn allow_method(mut self, method: impl Into<String>) -> Self {
        self.allowed_methods.push(method.into());
        self
    }

    #[must_use]
    pub fn allow_header(mut self, header: impl Into<String>) -> Self {
        self.allowed_headers.push(header.into());
        self
    }

    #[must_use]
    pub fn max_age(mut self, seconds: u32) -> Self {
        self.max_age_secs = seconds;
        self
    }

    // The `Access-Control-Allow-Origin` value for this request, if allowed.
    fn resolve_origin(&self, origin: Option<&str>) -> Option<String> {
        if self.allowed_origins.iter().any(|o| o == "*") {
            return Some("*".to_owned());
        }
        let origin = origin?;
        self.allowed_origins
            .iter()
            .any(|o| o == origin)
            .then(|| origin.to_owned())
    }

    fn decorate(&self, response: &mut Response, allow_origin: &str) {
        response.set_header("Access-Control-Allow-Origin", allow_origin);
        response.set_header("Access-Control-Allow-Methods", self.allowed_methods.join(", "));
        response.set_header("Access-Control-Allow-Headers", self.allowed_headers.join(", "));
        if allow_origin != "*" {
            response.add_header("Vary", "Origin");
        }
    }
}

impl Middleware for Cors {
    fn handle<'a>(&'a self, ctx: &'a mut Context, next: Next) -> BoxFuture<'a> {
        Box::pin(async move {
            let Some(allow_origin) = self.resolve_origin(ctx.request().header("origin")) else {
                return next.run(ctx).await;
            };

            if ctx.request().method() == &crate::Method::Options {
                let mut preflight = Response::new(StatusCode::Ok)
                    .header("Access-Control-Max-Age", self.max_age_secs.to_string());
                self.decorate(&mut preflight, &allow_origin);
                return Ok(preflight);
            }

            let mut response = next.run(ctx).await?;
            self.decorate(&mut response, &allow_origin);
            Ok(response)
        })
    }
}

/// Rejects requests whose `Authorization` header is not exactly
/// `Bearer <secret>`.
///
/// There is one shared secret and no notion of user identity. The check is
/// a plain string comparison. A rejected request gets `401 Unauthorized`
/// and the rest of the chain never runs.
pub struct BearerAuth {
    expected: String,
}

impl BearerAuth {
    pub fn new(secret: impl AsRef<str>) -> Self {
        Self {
            expected: format!("Bearer {}", secret.as_ref()),
        }
    }
}

impl Middleware for BearerAuth {
    fn handle<'a>(&'a self, ctx: &'a mut Context, next: Next) -> BoxFuture<'a> {
        if ctx.request().header("authorization") == Some(self.expected.as_str()) {
            return next.run(ctx);
        }
        tracing::debug!(path = %ctx.original_path(), "rejected request without valid bearer token");
        Box::pin(async { Ok(Response::new(StatusCode::Unauthorized).body("Unauthorized")) })
    }
}

/// Builds a [`BearerAuth`] stage for `secret`.
pub fn create_auth_middleware(secret: impl AsRef<str>) -> MiddlewareHandler {
    Arc::new(BearerAuth::new(secret))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::http::{Method, Request};
    use crate::middleware::{MiddlewareEntry, from_fn};

    fn downstream(reached: &Arc<AtomicBool>) -> Next {
        let reached = Arc::clone(reached);
        let handler = from_fn(move |_ctx, _next| {
            reached.store(true, Ordering::SeqCst);
            Box::pin(async {
                Ok(Response::new(StatusCode::Ok)
                    .header("Access-Control-Allow-Origin", "https://stale.example"))
            })
        });
        Next::new(Arc::from(vec![MiddlewareEntry::root(handler)]))
    }

    async fn call(mw: &dyn Middleware, request: Request, reached: &Arc<AtomicBool>) -> Response {
        let mut ctx = Context::new(request);
        mw.handle(&mut ctx, downstream(reached)).await.unwrap()
    }

    #[tokio::test]
    async fn auth_accepts_the_exact_bearer_value() {
        let reached = Arc::new(AtomicBool::new(false));
        let request = Request::new(Method::Get, "/api/counter")
            .with_header("Authorization", "Bearer secret123");
        let response = call(&BearerAuth::new("secret123"), request, &reached).await;
        assert_eq!(response.status(), StatusCode::Ok);
        assert!(reached.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn auth_rejects_anything_else() {
        let auth = BearerAuth::new("secret123");
        let cases = [
            None,
            Some("Bearer secret1234"),
            Some("bearer secret123"),
            Some("secret123"),
            Some("Bearer  secret123"),
        ];
        for header in cases {
            let reached = Arc::new(AtomicBool::new(false));
            let mut request = Request::new(Method::Get, "/api/counter");
            if let Some(value) = header {
                request = request.with_header("Authorization", value);
            }
            let response = call(&auth, request, &reached).await;
            assert_eq!(response.status(), StatusCode::Unauthorized, "{header:?}");
            assert!(!reached.load(Ordering::SeqCst), "{header:?}");
        }
    }

    #[tokio::test]
    async fn cors_preflight_short_circuits() {
        let reached = Arc::new(AtomicBool::new(false));
        let response = call(&Cors::new(), Request::new(Method::Options, "/api/counter"), &reached).await;

        assert_eq!(response.status(), StatusCode::Ok);
        assert!(!reached.load(Ordering::SeqCst));
        let headers = response.headers();
        assert_eq!(headers.get("access-control-allow-origin"), Some("*"));
        assert_eq!(
            headers.get("access-control-allow-methods"),
            Some("GET, POST, PUT, DELETE, OPTIONS")
        );
        assert_eq!(
            headers.get("access-control-allow-headers"),
            Some("Content-Type, Authorization")
        );
        assert_eq!(headers.get("access-control-max-age"), Some("86400"));
    }

    #[tokio::test]
    async fn cors_overwrites_headers_on_regular_responses() {
        let reached = Arc::new(AtomicBool::new(false));
        let response = call(&Cors::new(), Request::new(Method::Get, "/"), &reached).await;
        assert!(reached.load(Ordering::SeqCst));
        assert_eq!(
            response.headers().get_all("access-control-allow-origin").collect::<Vec<_>>(),
            vec!["*"]
        );
        assert!(!response.headers().contains("vary"));
    }

    #[tokio::test]
    async fn cors_specific_origin_is_echoed_with_vary() {
        let cors = Cors::new().only_origins(["https://app.example"]);
        let reached = Arc::new(AtomicBool::new(false));
        let request =
            Request::new(Method::Get, "/").with_header("Origin", "https://app.example");
        let response = call(&cors, request, &reached).await;
        assert_eq!(
            response.headers().get("access-control-allow-origin"),
            Some("https://app.example")
        );
        assert_eq!(response.headers().get("vary"), Some("Origin"));

        let reached = Arc::new(AtomicBool::new(false));
        let request = Request::new(Method::Options, "/").with_header("Origin", "https://evil.example");
        let response = call(&cors, request, &reached).await;
        assert!(reached.load(Ordering::SeqCst));
        assert_eq!(
            response.headers().get("access-control-allow-origin"),
            Some("https://stale.example")
        );
    }
}
