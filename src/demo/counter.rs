//! Counter and health endpoints.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;

use super::{DemoState, counter_key};
use crate::http::{Payload, Response, StatusCode};
use crate::router::Router;

#[derive(Debug, Deserialize)]
struct IncrementBody {
    #[serde(default = "default_increment")]
    increment: i64,
}

fn default_increment() -> i64 {
    1
}

impl IncrementBody {
    // Zero counts as "not given".
    fn amount(&self) -> i64 {
        if self.increment == 0 { default_increment() } else { self.increment }
    }
}

pub(super) fn register(router: &mut Router, state: &Arc<DemoState>) {
    let reader = Arc::clone(state);
    router.get("/api/counter", move |ctx| {
        let state = Arc::clone(&reader);
        Box::pin(async move {
            match state.store.get::<i64>(&counter_key()).await {
                Ok(value) => {
                    ctx.response.body = Some(Payload::Json(json!({ "counter": value.unwrap_or(0) })));
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to get counter");
                    ctx.response.status = Some(StatusCode::InternalServerError);
                    ctx.response.body = Some(Payload::Json(json!({ "error": "Failed to get counter" })));
                }
            }
            Ok(ctx.to_response())
        })
    });

    let writer = Arc::clone(state);
    router.post("/api/counter", move |ctx| {
        let state = Arc::clone(&writer);
        Box::pin(async move {
            let increment = if ctx.request().body().is_empty() {
                default_increment()
            } else {
                match ctx.request().json::<IncrementBody>() {
                    Ok(body) => body.amount(),
                    Err(e) => {
                        tracing::debug!(error = %e, "rejected counter update body");
                        return Ok(Response::new(StatusCode::BadRequest)
                            .json(json!({ "error": "Invalid JSON body" })));
                    }
                }
            };

            match state.store.backend().sum(&counter_key(), increment).await {
                Ok(counter) => Ok(Response::new(StatusCode::Ok).json(json!({ "counter": counter }))),
                Err(e) => {
                    tracing::error!(error = %e, increment, "failed to update counter");
                    Ok(Response::new(StatusCode::InternalServerError)
                        .json(json!({ "error": "Failed to update counter" })))
                }
            }
        })
    });

    router.get("/api/health", |_ctx| {
        Box::pin(async {
            Ok(Response::new(StatusCode::Ok).json(json!({
                "status": "ok",
                "timestamp": chrono::Utc::now().to_rfc3339(),
            })))
        })
    });
}
