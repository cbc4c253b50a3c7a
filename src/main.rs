//! `kiri` — serves the counter demo.
//!
//! ```text
//! kiri [--config kiri.toml] [--bind 0.0.0.0:8000] [--static-dir ./dist] [--auth-secret s]
//! ```
//!
//! Logging follows `RUST_LOG`, falling back to the config's `log_filter`.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use kiri::config::{Overrides, ServerConfig};
use kiri::demo::build_app;
use kiri::kv::{KvBackend, KvStore, MemoryKv};

#[derive(Debug, Parser)]
#[command(name = "kiri", version, about = "Counter demo on the kiri middleware framework")]
struct Args {
    /// TOML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address.
    #[arg(long, env = "KIRI_BIND")]
    bind: Option<String>,

    /// Directory holding the built front end.
    #[arg(long, env = "KIRI_STATIC_DIR")]
    static_dir: Option<PathBuf>,

    /// Bearer secret required on /api routes.
    #[arg(long, env = "KIRI_AUTH_SECRET", hide_env_values = true)]
    auth_secret: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = ServerConfig::load(args.config.as_deref())?.with_overrides(Overrides {
        bind: args.bind,
        static_dir: args.static_dir,
        auth_secret: args.auth_secret,
    })?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        bind = %config.bind,
        static_dir = %config.static_dir.display(),
        auth = config.auth_secret.is_some(),
        sse_interval_ms = config.sse_interval_ms,
        "kiri v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    let backend = Arc::new(MemoryKv::new());
    let store = Arc::new(KvStore::new(backend.clone()));
    let app = build_app(&config, Arc::clone(&store));

    let served = app
        .listen_until(&config.bind, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await;

    store.shutdown();
    backend.close().await;
    served?;
    tracing::info!("kiri stopped");
    Ok(())
}
