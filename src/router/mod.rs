//! Request routing — map an HTTP method and exact path to a handler.
//!
//! A [`Router`] is a plain table keyed by `"METHOD:path"`, e.g.
//! `"GET:/api/counter"`. There are no parameters or wildcards: a request
//! either hits a key exactly or falls through to the next middleware.
//!
//! The router is not a terminal on its own. [`Router::routes`] turns the
//! current table into a [`MiddlewareHandler`] that is mounted like any other
//! stage. Lookup uses the context's *current* path, so a router mounted at
//! `/api` sees `/counter` for a request to `/api/counter`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::Method;
use crate::context::Context;
use crate::middleware::{BoxFuture, Middleware, MiddlewareHandler, Next};

/// Type-erased route handler.
///
/// A handler answers the request outright and never sees a [`Next`]; it is
/// stored behind an [`Arc`] so snapshots taken by [`Router::routes`] share it.
pub type Handler = Arc<dyn IntoHandler>;

/// Conversion trait for route handlers.
///
/// Any `for<'a> Fn(&'a mut Context) -> BoxFuture<'a>` that is also
/// `Send + Sync + 'static` implements this trait through the blanket impl
/// below. The returned future may borrow the context but not the closure,
/// so shared state is cloned out of the closure before the `async` block:
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use kiri::{Response, StatusCode, Router};
///
/// let greeting = Arc::new(String::from("hello"));
/// let mut router = Router::new();
/// router.get("/greet", move |_ctx| {
///     let greeting = Arc::clone(&greeting);
///     Box::pin(async move { Ok(Response::new(StatusCode::Ok).body(greeting.as_str())) })
/// });
/// ```
pub trait IntoHandler: Send + Sync + 'static {
    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a>;
}

impl<F> IntoHandler for F
where
    F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a> + Send + Sync + 'static,
{
    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a> {
        (self)(ctx)
    }
}

fn route_key(method: &Method, path: &str) -> String {
    format!("{method}:{path}")
}

/// An exact-match method + path routing table.
///
/// Registering the same method and path twice replaces the earlier handler.
/// Registration methods return `&mut Self` so calls can be chained.
///
/// # Examples
///
/// ```rust,no_run
/// use kiri::{App, Response, Router, StatusCode};
///
/// let mut router = Router::new();
/// router
///     .get("/ping", |_ctx| Box::pin(async { Ok(Response::new(StatusCode::Ok).body("pong")) }))
///     .post("/echo", |ctx| {
///         Box::pin(async move {
///             let body = ctx.request().body().clone();
///             Ok(Response::new(StatusCode::Ok).body_bytes(body, "application/octet-stream"))
///         })
///     });
///
/// let mut app = App::new();
/// app.use_middleware(router.routes());
/// ```
#[derive(Default)]
pub struct Router {
    routes: HashMap<String, Handler>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `GET` requests to `path`.
    pub fn get<F>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a> + Send + Sync + 'static,
    {
        self.add_route(Method::Get, path, Arc::new(handler))
    }

    /// Register a handler for `POST` requests to `path`.
    pub fn post<F>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a> + Send + Sync + 'static,
    {
        self.add_route(Method::Post, path, Arc::new(handler))
    }

    /// Register a handler for `PUT` requests to `path`.
    pub fn put<F>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a> + Send + Sync + 'static,
    {
        self.add_route(Method::Put, path, Arc::new(handler))
    }

    /// Register a handler for `DELETE` requests to `path`.
    pub fn delete<F>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a> + Send + Sync + 'static,
    {
        self.add_route(Method::Delete, path, Arc::new(handler))
    }

    /// Register a handler for `PATCH` requests to `path`.
    pub fn patch<F>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a> + Send + Sync + 'static,
    {
        self.add_route(Method::Patch, path, Arc::new(handler))
    }

    /// Register a handler for `OPTIONS` requests to `path`.
    pub fn options<F>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a> + Send + Sync + 'static,
    {
        self.add_route(Method::Options, path, Arc::new(handler))
    }

    /// Register an already type-erased handler for any method.
    pub fn add_route(&mut self, method: Method, path: &str, handler: Handler) -> &mut Self {
        let key = route_key(&method, path);
        if self.routes.insert(key, handler).is_some() {
            tracing::debug!(%method, path, "replaced existing route");
        }
        self
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Snapshot the table as a middleware.
    ///
    /// The returned stage answers requests whose `"METHOD:path"` key is
    /// registered and calls `next` for everything else. Routes added to this
    /// router afterwards are not visible to earlier snapshots.
    pub fn routes(&self) -> MiddlewareHandler {
        Arc::new(RouteTable {
            routes: self.routes.clone(),
        })
    }
}

struct RouteTable {
    routes: HashMap<String, Handler>,
}

impl Middleware for RouteTable {
    fn handle<'a>(&'a self, ctx: &'a mut Context, next: Next) -> BoxFuture<'a> {
        let key = route_key(ctx.request().method(), ctx.path());
        match self.routes.get(&key) {
            Some(handler) => handler.call(ctx),
            None => next.run(ctx),
        }
    }
}
