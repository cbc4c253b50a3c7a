//! Functional middleware combinators.
//!
//! Each function builds one [`MiddlewareHandler`] out of others. Predicates
//! are synchronous and only see the [`Context`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use super::{BoxFuture, Middleware, MiddlewareEntry, MiddlewareHandler, Next};
use crate::context::{Context, OnceId};
use crate::error::Error;

/// Runs `middlewares` in order as a single stage.
///
/// The composed chain shares the explicit-position model of
/// [`App`](crate::app::App): each inner stage calls `next` to reach the
/// following one, and once the list is exhausted the request continues with
/// the `next` the composed middleware itself was given.
pub fn compose(middlewares: impl IntoIterator<Item = MiddlewareHandler>) -> MiddlewareHandler {
    let stages: Arc<[MiddlewareEntry]> = middlewares.into_iter().map(MiddlewareEntry::root).collect();
    Arc::new(Compose { stages })
}

struct Compose {
    stages: Arc<[MiddlewareEntry]>,
}

impl Middleware for Compose {
    fn handle<'a>(&'a self, ctx: &'a mut Context, next: Next) -> BoxFuture<'a> {
        Next::nested(Arc::clone(&self.stages), next).run(ctx)
    }
}

/// Runs `middleware` when `predicate` holds, otherwise continues with `next`.
pub fn when<P>(predicate: P, middleware: MiddlewareHandler) -> MiddlewareHandler
where
    P: Fn(&Context) -> bool + Send + Sync + 'static,
{
    Arc::new(Conditional {
        predicate,
        middleware,
        run_when: true,
    })
}

/// Skips `middleware` when `predicate` holds, otherwise runs it.
pub fn skip<P>(predicate: P, middleware: MiddlewareHandler) -> MiddlewareHandler
where
    P: Fn(&Context) -> bool + Send + Sync + 'static,
{
    Arc::new(Conditional {
        predicate,
        middleware,
        run_when: false,
    })
}

struct Conditional<P> {
    predicate: P,
    middleware: MiddlewareHandler,
    run_when: bool,
}

impl<P> Middleware for Conditional<P>
where
    P: Fn(&Context) -> bool + Send + Sync + 'static,
{
    fn handle<'a>(&'a self, ctx: &'a mut Context, next: Next) -> BoxFuture<'a> {
        if (self.predicate)(ctx) == self.run_when {
            self.middleware.handle(ctx, next)
        } else {
            next.run(ctx)
        }
    }
}

/// Runs exactly one of two branches; both receive the same `next`.
pub fn if_else<P>(
    predicate: P,
    when_true: MiddlewareHandler,
    when_false: MiddlewareHandler,
) -> MiddlewareHandler
where
    P: Fn(&Context) -> bool + Send + Sync + 'static,
{
    Arc::new(IfElse {
        predicate,
        when_true,
        when_false,
    })
}

struct IfElse<P> {
    predicate: P,
    when_true: MiddlewareHandler,
    when_false: MiddlewareHandler,
}

impl<P> Middleware for IfElse<P>
where
    P: Fn(&Context) -> bool + Send + Sync + 'static,
{
    fn handle<'a>(&'a self, ctx: &'a mut Context, next: Next) -> BoxFuture<'a> {
        if (self.predicate)(ctx) {
            self.when_true.handle(ctx, next)
        } else {
            self.when_false.handle(ctx, next)
        }
    }
}

/// Logs how long `middleware` (including everything it awaits downstream)
/// took. The response is returned untouched.
pub fn with_timing(middleware: MiddlewareHandler) -> MiddlewareHandler {
    Arc::new(Timed { middleware })
}

struct Timed {
    middleware: MiddlewareHandler,
}

impl Middleware for Timed {
    fn handle<'a>(&'a self, ctx: &'a mut Context, next: Next) -> BoxFuture<'a> {
        Box::pin(async move {
            let start = Instant::now();
            let result = self.middleware.handle(ctx, next).await;
            tracing::info!(
                method = %ctx.request().method(),
                url = %ctx.request().url(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "timed middleware finished"
            );
            result
        })
    }
}

/// Re-invokes `middleware` when it fails, for at most `max_attempts`
/// attempts in total, then returns the last error.
///
/// Every failure is retried: the error kind is not inspected, so only wrap
/// stages that are safe to repeat. Each attempt gets a fresh copy of the same
/// continuation, so downstream stages may also run more than once. A
/// `max_attempts` of zero behaves like one.
pub fn with_retry(middleware: MiddlewareHandler, max_attempts: usize) -> MiddlewareHandler {
    Arc::new(Retry {
        middleware,
        max_attempts: max_attempts.max(1),
    })
}

struct Retry {
    middleware: MiddlewareHandler,
    max_attempts: usize,
}

impl Middleware for Retry {
    fn handle<'a>(&'a self, ctx: &'a mut Context, next: Next) -> BoxFuture<'a> {
        Box::pin(async move {
            let mut attempt = 1;
            loop {
                match self.middleware.handle(ctx, next.clone()).await {
                    Ok(response) => return Ok(response),
                    Err(e) if attempt >= self.max_attempts => return Err(e),
                    Err(e) => {
                        tracing::warn!(error = %e, "Retry {}/{} failed", attempt, self.max_attempts);
                        attempt += 1;
                    }
                }
            }
        })
    }
}

/// Fails with [`Error::Timeout`] when `middleware` has not answered within
/// `timeout`.
///
/// The wrapped middleware runs on its own task against a copy of the
/// context. A timeout does **not** cancel that task: it keeps running to
/// completion in the background and whatever it produces is discarded,
/// though side effects it causes elsewhere (store writes, for instance)
/// still happen. When it answers in time, its copy of the context replaces
/// the caller's.
pub fn with_timeout(middleware: MiddlewareHandler, timeout: Duration) -> MiddlewareHandler {
    Arc::new(Timeout {
        middleware,
        timeout,
    })
}

struct Timeout {
    middleware: MiddlewareHandler,
    timeout: Duration,
}

impl Middleware for Timeout {
    fn handle<'a>(&'a self, ctx: &'a mut Context, next: Next) -> BoxFuture<'a> {
        Box::pin(async move {
            let middleware = Arc::clone(&self.middleware);
            let mut detached = ctx.clone();
            let task = tokio::spawn(async move {
                let result = middleware.handle(&mut detached, next).await;
                (detached, result)
            });

            match tokio::time::timeout(self.timeout, task).await {
                Ok(joined) => {
                    let (updated, result) = joined?;
                    *ctx = updated;
                    result
                }
                Err(_) => {
                    tracing::warn!(
                        path = %ctx.original_path(),
                        timeout_ms = self.timeout.as_millis() as u64,
                        "middleware timed out; it keeps running in the background"
                    );
                    Err(Error::Timeout(self.timeout))
                }
            }
        })
    }
}

static NEXT_ONCE_ID: AtomicU64 = AtomicU64::new(0);

/// Runs `middleware` at most once per request.
///
/// If the same wrapper is reached again while the request is still in
/// flight (for example because it is mounted twice), later visits go
/// straight to `next`.
pub fn once(middleware: MiddlewareHandler) -> MiddlewareHandler {
    Arc::new(Once {
        id: OnceId(NEXT_ONCE_ID.fetch_add(1, Ordering::Relaxed)),
        middleware,
    })
}

struct Once {
    id: OnceId,
    middleware: MiddlewareHandler,
}

impl Middleware for Once {
    fn handle<'a>(&'a self, ctx: &'a mut Context, next: Next) -> BoxFuture<'a> {
        if ctx.mark_once(self.id) {
            self.middleware.handle(ctx, next)
        } else {
            next.run(ctx)
        }
    }
}
