//! Entry point for the Lounge Engine binary.
//!
//! Running this binary starts an HTTP server exposing the session and
//! billing operations.  Settings come from the environment:
//! `LOUNGE_BIND_ADDR` (default `127.0.0.1:3000`), `LOUNGE_CATALOG`
//! (JSON file listing devices, tables and default rates) and
//! `LOUNGE_RECONCILE_AFTER_MOVES`.  Log verbosity follows `RUST_LOG`.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lounge_engine::{api, config::Settings};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = Settings::from_env()?;
    tracing::info!(?settings, "starting lounge engine");
    if let Err(err) = api::serve(settings).await {
        tracing::error!(error = %err, "server stopped with an error");
        return Err(err);
    }
    Ok(())
}
