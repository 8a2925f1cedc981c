//! `granule-watch run`

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::engine::{AssemblyStats, Engine, EngineError};

/// Run the engine until Ctrl-C.
pub async fn run(settings: Arc<Settings>) -> Result<AssemblyStats, EngineError> {
    let engine = Engine::new(Arc::clone(&settings))?;
    let shutdown = CancellationToken::new();

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => crate::log_event!("engine", "signal received"),
            Err(e) => tracing::error!("[engine] cannot listen for Ctrl-C: {e}"),
        }
        signal.cancel();
    });

    engine.run(shutdown).await
}
