//! Static asset serving for the built front end.

use std::path::{Path, PathBuf};

use super::{BoxFuture, Middleware, Next};
use crate::{Response, context::Context};

/// Serves front-end assets from a directory.
///
/// Handles `/` (as `/index.html`), anything under `/assets`, and any path
/// ending in `.js`, `.css`, `.svg`, `.ico`, or `.html`. Other requests go to
/// `next`. A handled path whose file cannot be read answers `404 Not found`;
/// so does any path containing a `..` segment.
///
/// The content type comes from the extension alone and defaults to
/// `text/html`.
pub struct StaticFiles {
    root: PathBuf,
}

impl StaticFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        if root.is_dir() {
            tracing::info!(root = %root.display(), "serving static files");
        } else {
            tracing::error!(
                root = %root.display(),
                "static root is not a directory; files will not be served"
            );
        }
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn handles(path: &str) -> bool {
        path == "/"
            || path.starts_with("/assets")
            || [".js", ".css", ".svg", ".ico", ".html"]
                .iter()
                .any(|ext| path.ends_with(ext))
    }

    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let relative = if path == "/" { "index.html" } else { path.trim_start_matches('/') };
        if relative.split('/').any(|segment| segment == "..") {
            return None;
        }
        Some(self.root.join(relative))
    }
}

/// Content type for a served file, by extension only.
pub(crate) fn content_type_for(path: &str) -> &'static str {
    match path.rsplit_once('.').map(|(_, ext)| ext) {
        Some("js") => "application/javascript",
        Some("css") => "text/css",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        _ => "text/html",
    }
}

impl Middleware for StaticFiles {
    fn handle<'a>(&'a self, ctx: &'a mut Context, next: Next) -> BoxFuture<'a> {
        Box::pin(async move {
            let path = ctx.request().path().to_owned();
            if !Self::handles(&path) {
                return next.run(ctx).await;
            }

            let Some(file) = self.resolve(&path) else {
                tracing::warn!(path = %path, "refusing path outside the static root");
                return Ok(Response::not_found());
            };

            match tokio::fs::read(&file).await {
                Ok(bytes) => {
                    let served = if path == "/" { "/index.html" } else { path.as_str() };
                    Ok(Response::new(crate::StatusCode::Ok)
                        .body_bytes(bytes, content_type_for(served)))
                }
                Err(e) => {
                    tracing::info!(file = %file.display(), error = %e, "static file not found");
                    Ok(Response::not_found())
                }
            }
        })
    }
}
