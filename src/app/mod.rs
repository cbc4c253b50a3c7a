//! The application — an ordered middleware chain bound to a server.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::Context;
use crate::http::{Request, Response, StatusCode};
use crate::middleware::{MiddlewareEntry, MiddlewareHandler, Next};
use crate::server::{Server, ServerError};

/// The future returned by a frozen [`App`] handler.
pub type ResponseFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

/// An ordered list of mounted middleware.
///
/// Entries run in registration order. Each request gets a fresh
/// [`Context`] and a [`Next`] positioned at the first entry; a request that
/// falls through every entry is answered `404 Not found`. A middleware that
/// fails without an [`ErrorHandler`](crate::middleware::ErrorHandler) in
/// front of it produces a plain `500 Internal Server Error`.
///
/// # Examples
///
/// ```rust,no_run
/// use kiri::{App, Response, StatusCode};
/// use kiri::middleware::{Logger, from_fn, from_middleware};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut app = App::new();
///     app.use_middleware(from_middleware(Logger))
///         .use_at("/health", from_fn(|_ctx, _next| {
///             Box::pin(async { Ok(Response::new(StatusCode::Ok).body("ok")) })
///         }));
///     app.listen("127.0.0.1:8000").await?;
///     Ok(())
/// }
/// ```
#[derive(Clone, Default)]
pub struct App {
    stages: Vec<MiddlewareEntry>,
}

impl App {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mounts `middleware` at the root; it sees every request.
    pub fn use_middleware(&mut self, middleware: MiddlewareHandler) -> &mut Self {
        self.stages.push(MiddlewareEntry::root(middleware));
        self
    }

    /// Mounts `middleware` at `prefix`.
    ///
    /// While the entry runs, [`Context::path`] holds what follows `prefix`
    /// when the request path starts with it. The entry is invoked for every
    /// request either way; matching only affects the path it sees.
    pub fn use_at(&mut self, prefix: impl Into<String>, middleware: MiddlewareHandler) -> &mut Self {
        self.stages.push(MiddlewareEntry::new(prefix, middleware));
        self
    }

    /// Number of mounted entries.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Runs one request through the chain.
    pub async fn handle_request(&self, request: Request) -> Response {
        dispatch(Arc::from(self.stages.as_slice()), request).await
    }

    /// Freezes the chain into a handler usable with [`Server::run`].
    pub fn into_handler(self) -> impl Fn(Request) -> ResponseFuture + Send + Sync + 'static {
        let stages: Arc<[MiddlewareEntry]> = Arc::from(self.stages);
        move |request: Request| -> ResponseFuture { Box::pin(dispatch(Arc::clone(&stages), request)) }
    }

    /// Binds `addr` and serves until the process exits.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError`] when the address cannot be bound or the
    /// listener fails.
    pub async fn listen(self, addr: impl AsRef<str>) -> Result<(), ServerError> {
        Server::bind(addr).await?.run(self.into_handler()).await
    }

    /// Binds `addr` and serves until `shutdown` resolves.
    pub async fn listen_until<S>(self, addr: impl AsRef<str>, shutdown: S) -> Result<(), ServerError>
    where
        S: Future<Output = ()>,
    {
        Server::bind(addr)
            .await?
            .run_until(self.into_handler(), shutdown)
            .await
    }
}

async fn dispatch(stages: Arc<[MiddlewareEntry]>, request: Request) -> Response {
    let mut ctx = Context::new(request);
    match Next::new(stages).run(&mut ctx).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(
                error = %e,
                method = %ctx.request().method(),
                path = %ctx.original_path(),
                "unhandled middleware error"
            );
            Response::new(StatusCode::InternalServerError).body("Internal Server Error")
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::error::Error;
    use crate::http::Method;
    use crate::middleware::from_fn;

    fn get(path: &str) -> Request {
        Request::new(Method::Get, path)
    }

    fn pass_through() -> MiddlewareHandler {
        from_fn(|ctx, next| Box::pin(async move { next.run(ctx).await }))
    }

    #[tokio::test]
    async fn empty_app_answers_404() {
        let response = App::new().handle_request(get("/")).await;
        assert_eq!(response.status(), StatusCode::NotFound);
        assert_eq!(response.body_bytes_ref().unwrap().as_ref(), b"Not found");
    }

    #[tokio::test]
    async fn falling_through_every_stage_is_404() {
        let mut app = App::new();
        app.use_at("/api", pass_through())
            .use_at("/assets", pass_through())
            .use_middleware(pass_through());
        for path in ["/", "/api/x", "/elsewhere"] {
            let response = app.handle_request(get(path)).await;
            assert_eq!(response.status(), StatusCode::NotFound, "{path}");
        }
    }

    #[tokio::test]
    async fn unhandled_error_is_plain_500() {
        let mut app = App::new();
        app.use_middleware(from_fn(|_ctx, _next| {
            Box::pin(async { Err(Error::msg("boom")) })
        }));
        let response = app.handle_request(get("/")).await;
        assert_eq!(response.status(), StatusCode::InternalServerError);
        assert_eq!(
            response.body_bytes_ref().unwrap().as_ref(),
            b"Internal Server Error"
        );
    }

    #[tokio::test]
    async fn mounted_entry_runs_for_unmatched_paths_with_full_path() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let mut app = App::new();
        app.use_at(
            "/api",
            from_fn(move |ctx, next| {
                record.lock().push(ctx.path().to_owned());
                Box::pin(async move { next.run(ctx).await })
            }),
        );
        app.handle_request(get("/api/counter")).await;
        app.handle_request(get("/index.html")).await;
        assert_eq!(*seen.lock(), vec!["/counter", "/index.html"]);
    }

    #[tokio::test]
    async fn before_and_after_wrap_downstream() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let (outer, inner) = (Arc::clone(&order), Arc::clone(&order));
        let mut app = App::new();
        app.use_middleware(from_fn(move |ctx, next| {
            let order = Arc::clone(&outer);
            Box::pin(async move {
                order.lock().push("before");
                let response = next.run(ctx).await;
                order.lock().push("after");
                response
            })
        }))
        .use_middleware(from_fn(move |_ctx, _next| {
            inner.lock().push("handler");
            Box::pin(async { Ok(Response::new(StatusCode::Ok)) })
        }));

        let handler = app.into_handler();
        assert_eq!(handler(get("/")).await.status(), StatusCode::Ok);
        assert_eq!(*order.lock(), vec!["before", "handler", "after"]);
    }

    #[tokio::test]
    async fn context_is_fresh_per_request() {
        let mut app = App::new();
        app.use_middleware(from_fn(|ctx, _next| {
            let seen = ctx.get_state("seen").is_some();
            ctx.set_state("seen", true);
            Box::pin(async move {
                let status = if seen { StatusCode::Forbidden } else { StatusCode::Ok };
                Ok(Response::new(status))
            })
        }));
        assert_eq!(app.handle_request(get("/")).await.status(), StatusCode::Ok);
        assert_eq!(app.handle_request(get("/")).await.status(), StatusCode::Ok);
    }
}
