//! The counter demo served by the `kiri` binary.
//!
//! ```text
//! ErrorHandler → Logger → Cors → [BearerAuth on /api] ─┬─ /api… → router
//!                                                       └─ else  → StaticFiles
//! ```
//!
//! | Route              | Behavior                                          |
//! |--------------------|---------------------------------------------------|
//! | `GET /api/counter` | `{"counter": N}`                                  |
//! | `POST /api/counter`| adds `{"increment": n}` (default 1), returns new N|
//! | `GET /api/health`  | `{"status": "ok", "timestamp": …}`                |
//! | `GET /api/sse`     | `data: {"counter": N}` per change                 |

use std::sync::Arc;
use std::time::Duration;

use crate::app::App;
use crate::config::ServerConfig;
use crate::context::Context;
use crate::kv::{KvKey, KvStore};
use crate::middleware::{ErrorHandler, Logger, StaticFiles, compose, from_middleware, if_else, when};
use crate::router::Router;
use crate::security::{Cors, create_auth_middleware};

mod counter;
mod sse;

/// The key the demo counter lives under.
pub fn counter_key() -> KvKey {
    KvKey::from(["counter"])
}

/// State shared by the demo handlers.
pub(crate) struct DemoState {
    pub(crate) store: Arc<KvStore>,
    pub(crate) sse_interval: Duration,
}

fn is_api(ctx: &Context) -> bool {
    ctx.original_path().contains("/api")
}

/// Registers the demo API routes on a fresh router.
pub fn api_router(store: Arc<KvStore>, sse_interval: Duration) -> Router {
    let state = Arc::new(DemoState { store, sse_interval });
    let mut router = Router::new();
    counter::register(&mut router, &state);
    sse::register(&mut router, &state);
    router
}

/// Builds the full demo application.
pub fn build_app(config: &ServerConfig, store: Arc<KvStore>) -> App {
    let router = api_router(store, config.sse_interval());

    let mut stages = vec![
        from_middleware(ErrorHandler),
        from_middleware(Logger),
        from_middleware(Cors::new()),
    ];
    if let Some(secret) = &config.auth_secret {
        stages.push(when(is_api, create_auth_middleware(secret)));
    }
    stages.push(if_else(
        is_api,
        router.routes(),
        from_middleware(StaticFiles::new(&config.static_dir)),
    ));

    let mut app = App::new();
    app.use_middleware(compose(stages));
    app
}
