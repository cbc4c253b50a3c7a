//! # kiri
//!
//! A small functional middleware framework on a from-scratch async HTTP/1.1
//! server, plus a per-key change-notification store over a pluggable KV
//! backend.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use kiri::{App, Response, Router, StatusCode};
//! use kiri::middleware::{ErrorHandler, Logger, compose, from_middleware};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut router = Router::new();
//!     router.get("/hello", |_ctx| {
//!         Box::pin(async { Ok(Response::new(StatusCode::Ok).body("Hello, World!")) })
//!     });
//!
//!     let mut app = App::new();
//!     app.use_middleware(compose([
//!         from_middleware(ErrorHandler),
//!         from_middleware(Logger),
//!         router.routes(),
//!     ]));
//!     app.listen("127.0.0.1:8080").await?;
//!     Ok(())
//! }
//! ```

// ── Framework ────────────────────────────────────────────────────────────────
pub mod app;
pub mod context;
pub mod error;
pub mod http;
pub mod middleware;
pub mod router;
pub mod security;
pub mod server;

// ── Storage and streaming ────────────────────────────────────────────────────
pub mod kv;
pub mod realtime;

// ── Demo application ─────────────────────────────────────────────────────────
pub mod config;
pub mod demo;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use app::App;
pub use context::Context;
pub use error::{Error, Result};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use router::Router;
pub use server::{Server, ServerError};
