//! Security middleware — CORS and bearer-token authentication.

mod middleware;

pub use middleware::{BearerAuth, Cors, create_auth_middleware};
