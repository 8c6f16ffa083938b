//! TCP listener.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{serve_connection, HandlerContext};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, info, warn};

/// The remote store daemon.
///
/// # Example
///
/// ```no_run
/// use tailsync_server::{RemoteStoreServer, ServerConfig};
///
/// # async fn run() -> tailsync_server::ServerResult<()> {
/// let config = ServerConfig::new("0.0.0.0:2121".parse().unwrap(), "/srv/tailsync");
/// let server = RemoteStoreServer::bind(config).await?;
/// server.run_until(async { tokio::signal::ctrl_c().await.ok(); }).await
/// # }
/// ```
pub struct RemoteStoreServer {
    listener: TcpListener,
    context: Arc<HandlerContext>,
    limit: Arc<Semaphore>,
}

impl RemoteStoreServer {
    /// Binds the listener. The served root is created if missing.
    pub async fn bind(config: ServerConfig) -> ServerResult<Self> {
        tokio::fs::create_dir_all(&config.root).await?;
        let listener = TcpListener::bind(config.bind_addr).await?;
        let limit = Arc::new(Semaphore::new(config.max_connections));
        let context = Arc::new(HandlerContext::new(config)?);
        Ok(Self {
            listener,
            context,
            limit,
        })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Returns the shared handler state.
    pub fn context(&self) -> Arc<HandlerContext> {
        Arc::clone(&self.context)
    }

    /// Serves until the process ends.
    pub async fn run(self) -> ServerResult<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serves until `shutdown` completes. Sessions already running are left
    /// to finish on their own.
    pub async fn run_until<F>(self, shutdown: F) -> ServerResult<()>
    where
        F: Future<Output = ()>,
    {
        let addr = self.local_addr()?;
        info!(
            %addr,
            root = %self.context.config.root.display(),
            auth = self.context.config.requires_auth(),
            "remote store listening"
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!(%addr, "remote store shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let Ok(permit) = Arc::clone(&self.limit).try_acquire_owned() else {
                        warn!(%peer, "connection limit reached; refusing");
                        continue;
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%peer, error = %e, "set_nodelay failed");
                    }

                    let context = Arc::clone(&self.context);
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = serve_connection(context, stream, peer).await {
                            warn!(%peer, error = %e, "session ended with error");
                        }
                    });
                }
            }
        }
    }
}

/// A server running on its own thread and runtime.
///
/// Lets blocking code (tests, the sync loops) talk to a real server.
/// Dropping the handle shuts the server down.
pub struct BackgroundServer {
    addr: SocketAddr,
    context: Arc<HandlerContext>,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<ServerResult<()>>>,
}

impl BackgroundServer {
    /// Binds and starts serving.
    pub fn start(config: ServerConfig) -> ServerResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("tailsync-server")
            .enable_all()
            .build()?;
        let server = runtime.block_on(RemoteStoreServer::bind(config))?;
        let addr = server.local_addr()?;
        let context = server.context();

        let (tx, rx) = oneshot::channel();
        let thread = std::thread::Builder::new()
            .name("tailsync-server".into())
            .spawn(move || {
                runtime.block_on(server.run_until(async {
                    let _ = rx.await;
                }))
            })?;

        Ok(Self {
            addr,
            context,
            shutdown: Some(tx),
            thread: Some(thread),
        })
    }

    /// Returns the bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the shared handler state.
    pub fn context(&self) -> &Arc<HandlerContext> {
        &self.context
    }

    /// Stops the server and waits for the listener to close.
    pub fn shutdown(mut self) -> ServerResult<()> {
        self.stop()
    }

    fn stop(&mut self) -> ServerResult<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| ServerError::Internal("server thread panicked".into()))?,
            None => Ok(()),
        }
    }
}

impl Drop for BackgroundServer {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "background server stopped with error");
        }
    }
}

impl std::fmt::Debug for BackgroundServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundServer")
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}
