//! `serve`: run the remote store daemon.

use tailsync_server::{RemoteStoreServer, ServerConfig};
use tracing::{info, warn};

/// Serves until Ctrl-C.
pub fn run(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let server = RemoteStoreServer::bind(config).await?;
        server
            .run_until(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "cannot listen for interrupt; stopping");
                }
            })
            .await?;
        info!("remote store stopped");
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}
