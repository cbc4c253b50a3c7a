//! Built-in request logging and error conversion.

use serde_json::json;
use tokio::time::Instant;

use super::{BoxFuture, Middleware, Next};
use crate::{context::Context, http::Payload, http::StatusCode};

/// Logs each request on the way in and its status and duration on the way out.
///
/// Emits two `tracing::info!` records:
///
/// ```text
/// --> GET /api/counter
/// <-- 200 GET /api/counter (1.2ms)
/// ```
///
/// A failed downstream result is logged at `warn` and passed through
/// unchanged.
pub struct Logger;

impl Middleware for Logger {
    fn handle<'a>(&'a self, ctx: &'a mut Context, next: Next) -> BoxFuture<'a> {
        Box::pin(async move {
            let start = Instant::now();
            let method = ctx.request().method().to_string();
            let url = ctx.request().url();
            tracing::info!("--> {} {}", method, url);

            let result = next.run(ctx).await;

            let elapsed = start.elapsed();
            match &result {
                Ok(response) => tracing::info!(
                    "<-- {} {} {} ({:?})",
                    response.status().as_u16(),
                    method,
                    url,
                    elapsed
                ),
                Err(e) => tracing::warn!(error = %e, "<-- failed {} {} ({:?})", method, url, elapsed),
            }
            result
        })
    }
}

/// Converts an error from anywhere downstream into a `500` JSON response.
///
/// Install it first so it wraps the whole chain. The body is
///
/// ```json
/// { "error": "Internal Server Error", "message": "<error text>" }
/// ```
///
/// built through the context's response draft, so headers a stage already
/// placed in the draft survive.
pub struct ErrorHandler;

impl Middleware for ErrorHandler {
    fn handle<'a>(&'a self, ctx: &'a mut Context, next: Next) -> BoxFuture<'a> {
        Box::pin(async move {
            match next.run(ctx).await {
                Ok(response) => Ok(response),
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        path = %ctx.original_path(),
                        "request failed"
                    );
                    ctx.response.status = Some(StatusCode::InternalServerError);
                    ctx.response.body = Some(Payload::Json(json!({
                        "error": "Internal Server Error",
                        "message": e.to_string(),
                    })));
                    Ok(ctx.to_response())
                }
            }
        })
    }
}
