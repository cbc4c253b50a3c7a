//! Middleware pipeline — composable before/after request handler logic.
//!
//! This module defines the core types for building an ordered middleware stack.
//! Each middleware receives the request [`Context`] and a [`Next`] continuation,
//! and either answers directly or calls [`Next::run`] to hand the request to the
//! rest of the chain. Code after `next.run(ctx).await` runs once everything
//! downstream has answered, so stages unwind in reverse order.
//!
//! ## Core types
//!
//! - [`Middleware`] — trait implemented by all middleware.
//! - [`Next`] — explicit position in the remaining chain.
//! - [`MiddlewareHandler`] — type-erased, cheaply-cloneable middleware.
//! - [`MiddlewareEntry`] — a middleware bound to a mount prefix.
//! - [`from_fn`] — wraps a closure as a [`MiddlewareHandler`].
//!
//! Built-in stages live in [`Logger`], [`ErrorHandler`], [`StaticFiles`], and
//! the functional combinators ([`compose`], [`when`], [`if_else`], …).

use std::{future::Future, pin::Pin, sync::Arc};

use crate::{Response, context::Context, error::Result};

mod builtin;
mod combinators;
mod static_files;

pub use builtin::{ErrorHandler, Logger};
pub use combinators::{compose, if_else, once, skip, when, with_retry, with_timeout, with_timing};
pub use static_files::StaticFiles;

/// The future every middleware and handler returns.
pub type BoxFuture<'a> = Pin<Box<dyn Future<Output = Result<Response>> + Send + 'a>>;

/// A type-erased, reference-counted middleware.
///
/// Every stage in a chain is stored as a `MiddlewareHandler`; the [`Arc`]
/// makes cloning a [`Next`] or a whole stage list cheap.
pub type MiddlewareHandler = Arc<dyn Middleware>;

/// The core trait for all middleware.
///
/// Implementors receive the per-request [`Context`] and a [`Next`]. They may:
///
/// - **Pass through** — `next.run(ctx).await`.
/// - **Short-circuit** — return a [`Response`] without calling `next`.
/// - **Decorate** — call `next`, then inspect or modify the response.
/// - **Fail** — return an [`Error`](crate::Error), which travels back up the
///   chain until an [`ErrorHandler`] converts it.
///
/// # Examples
///
/// ```rust,no_run
/// use kiri::{Context, middleware::{BoxFuture, Middleware, Next}};
///
/// struct PassThrough;
///
/// impl Middleware for PassThrough {
///     fn handle<'a>(&'a self, ctx: &'a mut Context, next: Next) -> BoxFuture<'a> {
///         Box::pin(async move { next.run(ctx).await })
///     }
/// }
/// ```
pub trait Middleware: Send + Sync + 'static {
    fn handle<'a>(&'a self, ctx: &'a mut Context, next: Next) -> BoxFuture<'a>;
}

impl<F> Middleware for F
where
    F: for<'a> Fn(&'a mut Context, Next) -> BoxFuture<'a> + Send + Sync + 'static,
{
    fn handle<'a>(&'a self, ctx: &'a mut Context, next: Next) -> BoxFuture<'a> {
        (self)(ctx, next)
    }
}

/// Wraps a closure as a [`MiddlewareHandler`].
///
/// Going through this function lets the compiler infer the higher-ranked
/// closure signature, so no annotations are needed:
///
/// ```rust,no_run
/// use kiri::middleware::from_fn;
///
/// let tag = from_fn(|ctx, next| {
///     Box::pin(async move {
///         ctx.set_state("tagged", true);
///         next.run(ctx).await
///     })
/// });
/// ```
pub fn from_fn<F>(f: F) -> MiddlewareHandler
where
    F: for<'a> Fn(&'a mut Context, Next) -> BoxFuture<'a> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Converts a [`Middleware`] value into a [`MiddlewareHandler`].
pub fn from_middleware<M: Middleware>(middleware: M) -> MiddlewareHandler {
    Arc::new(middleware)
}

/// One stage of a chain: a middleware and the path prefix it is mounted at.
///
/// The root prefix `/` leaves [`Context::path`] untouched; any other prefix
/// narrows it to the remainder while the stage runs, when the request path
/// starts with that prefix.
#[derive(Clone)]
pub struct MiddlewareEntry {
    prefix: String,
    middleware: MiddlewareHandler,
}

impl MiddlewareEntry {
    pub fn new(prefix: impl Into<String>, middleware: MiddlewareHandler) -> Self {
        Self {
            prefix: prefix.into(),
            middleware,
        }
    }

    /// An entry mounted at `/`.
    pub fn root(middleware: MiddlewareHandler) -> Self {
        Self::new("/", middleware)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

/// Explicit position in a middleware chain.
///
/// A `Next` is an immutable shared stage list plus the index of the stage to
/// run, and optionally the continuation to fall back to once the list is
/// exhausted (this is how [`compose`] hands off to its enclosing chain).
/// [`run`](Self::run) consumes it, so a middleware advances its chain at most
/// once; cloning yields an independent continuation at the same position,
/// which is what [`with_retry`] relies on.
#[derive(Clone)]
pub struct Next {
    stages: Arc<[MiddlewareEntry]>,
    index: usize,
    fallthrough: Option<Box<Next>>,
}

impl Next {
    /// A continuation positioned at the start of `stages`; an exhausted chain
    /// answers `404 Not found`.
    pub fn new(stages: Arc<[MiddlewareEntry]>) -> Self {
        Self {
            stages,
            index: 0,
            fallthrough: None,
        }
    }

    /// A continuation over `stages` that resumes `outer` when exhausted.
    pub fn nested(stages: Arc<[MiddlewareEntry]>, outer: Next) -> Self {
        Self {
            stages,
            index: 0,
            fallthrough: Some(Box::new(outer)),
        }
    }

    /// A continuation with no stages left; running it answers `404`.
    pub fn end() -> Self {
        Self::new(Arc::from(Vec::new()))
    }

    /// Number of stages this continuation will still visit in its own list.
    pub fn remaining(&self) -> usize {
        self.stages.len().saturating_sub(self.index)
    }

    /// Runs the stage at the current position with a continuation for the
    /// stage after it.
    pub fn run(self, ctx: &mut Context) -> BoxFuture<'_> {
        Box::pin(async move {
            let Some(entry) = self.stages.get(self.index).cloned() else {
                return match self.fallthrough {
                    Some(outer) => outer.run(ctx).await,
                    None => Ok(Response::not_found()),
                };
            };

            let successor = Next {
                stages: Arc::clone(&self.stages),
                index: self.index + 1,
                fallthrough: self.fallthrough,
            };

            let previous = ctx.narrow(&entry.prefix);
            let result = entry.middleware.handle(ctx, successor).await;
            if let Some(path) = previous {
                ctx.set_path(path);
            }
            result
        })
    }
}
