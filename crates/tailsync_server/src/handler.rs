//! Per-connection request handling.

use crate::auth::CredentialValidator;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::store::FileStore;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tailsync_protocol::{
    encode_frame, FrameHeader, FrameKind, ProtocolError, Request, Response, DATA_CHUNK_SIZE,
    HEADER_LEN, PROTOCOL_VERSION,
};
use tokio::fs::File;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf,
    WriteHalf,
};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// State shared by every connection.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// Served files.
    pub store: FileStore,
    validator: CredentialValidator,
    sessions: RwLock<HashMap<String, SessionInfo>>,
}

/// Information about a connected client.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Client address.
    pub peer: SocketAddr,
    /// Logged-in user, if any.
    pub user: Option<String>,
    /// When the connection was accepted.
    pub started: Instant,
}

impl HandlerContext {
    /// Creates a handler context.
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        let validator = CredentialValidator::new(&config.users)?;
        let store = FileStore::new(config.root.clone());
        Ok(Self {
            config,
            store,
            validator,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Returns the number of open sessions.
    pub fn active_sessions(&self) -> usize {
        self.sessions.read().len()
    }

    /// Returns a snapshot of a session.
    pub fn session(&self, id: &str) -> Option<SessionInfo> {
        self.sessions.read().get(id).cloned()
    }

    fn register_session(&self, id: &str, peer: SocketAddr) {
        let info = SessionInfo {
            peer,
            user: None,
            started: Instant::now(),
        };
        self.sessions.write().insert(id.to_string(), info);
    }

    fn set_user(&self, id: &str, user: &str) {
        if let Some(session) = self.sessions.write().get_mut(id) {
            session.user = Some(user.to_string());
        }
    }

    fn unregister_session(&self, id: &str) {
        self.sessions.write().remove(id);
    }
}

impl std::fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerContext")
            .field("config", &self.config)
            .field("sessions", &self.active_sessions())
            .finish_non_exhaustive()
    }
}

/// Serves one client until it quits, disconnects, idles out, or breaks
/// the protocol.
pub async fn serve_connection<S>(
    context: Arc<HandlerContext>,
    stream: S,
    peer: SocketAddr,
) -> ServerResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let session_id = Uuid::new_v4().to_string();
    context.register_session(&session_id, peer);
    debug!(%peer, session = %session_id, "session opened");

    let (reader, writer) = tokio::io::split(stream);
    let mut connection = Connection {
        authenticated: !context.validator.is_enabled(),
        context: Arc::clone(&context),
        reader: BufReader::new(reader),
        writer: BufWriter::new(writer),
        session_id: session_id.clone(),
        greeted: false,
    };
    let result = connection.run().await;

    context.unregister_session(&session_id);
    debug!(%peer, session = %session_id, "session closed");
    result
}

enum Flow {
    Continue,
    Close,
}

struct Connection<S> {
    context: Arc<HandlerContext>,
    reader: BufReader<ReadHalf<S>>,
    writer: BufWriter<WriteHalf<S>>,
    session_id: String,
    greeted: bool,
    authenticated: bool,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn run(&mut self) -> ServerResult<()> {
        loop {
            let next = match self.context.config.idle_timeout {
                Some(idle) => match timeout(idle, read_frame(&mut self.reader)).await {
                    Ok(next) => next,
                    Err(_) => {
                        debug!(session = %self.session_id, "idle timeout");
                        return Ok(());
                    }
                },
                None => read_frame(&mut self.reader).await,
            };
            let frame = match next {
                Ok(None) => return Ok(()),
                Ok(Some(frame)) => frame,
                Err(ServerError::Protocol(e)) => {
                    self.reply_error(&ServerError::Protocol(e)).await?;
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            let (header, payload) = frame;
            if header.kind != FrameKind::Control {
                let err = unexpected("CONTROL frame", header.kind.name());
                self.reply_error(&err).await?;
                return Ok(());
            }
            let request = match Request::decode(&payload) {
                Ok(request) => request,
                Err(e) => {
                    self.reply_error(&ServerError::from(e)).await?;
                    return Ok(());
                }
            };

            debug!(session = %self.session_id, request = request.name(), "request");
            if let Flow::Close = self.dispatch(request).await? {
                return Ok(());
            }
        }
    }

    async fn dispatch(&mut self, request: Request) -> ServerResult<Flow> {
        if !self.greeted && !matches!(request, Request::Hello { .. }) {
            self.reply_error(&unexpected("Hello", request.name())).await?;
            return Ok(Flow::Close);
        }

        match request {
            Request::Hello { protocol_version } => self.hello(protocol_version).await,
            Request::Authenticate { user, password } => {
                let result = self.authenticate(&user, &password);
                self.reply_result(result).await
            }
            Request::Size { path } => {
                let result = self.size(&path).await;
                self.reply_result(result).await
            }
            Request::Append { path } => self.append(&path).await,
            Request::Retrieve { path, start } => self.retrieve(&path, start).await,
            Request::Quit => {
                self.reply(&Response::Goodbye).await?;
                Ok(Flow::Close)
            }
        }
    }

    async fn hello(&mut self, protocol_version: u16) -> ServerResult<Flow> {
        if protocol_version != PROTOCOL_VERSION {
            let err = ServerError::Protocol(ProtocolError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: protocol_version,
            });
            self.reply_error(&err).await?;
            return Ok(Flow::Close);
        }
        self.greeted = true;
        let welcome = Response::Welcome {
            protocol_version: PROTOCOL_VERSION,
            session_id: self.session_id.clone(),
        };
        self.reply(&welcome).await?;
        Ok(Flow::Continue)
    }

    fn authenticate(&mut self, user: &str, password: &str) -> ServerResult<Response> {
        if self.context.validator.is_enabled() {
            self.context.validator.verify(user, password)?;
        }
        self.authenticated = true;
        self.context.set_user(&self.session_id, user);
        info!(session = %self.session_id, user, "logged in");
        Ok(Response::Ready)
    }

    fn require_auth(&self) -> ServerResult<()> {
        if self.authenticated {
            Ok(())
        } else {
            Err(ServerError::Unauthorized("log in first".into()))
        }
    }

    async fn size(&mut self, remote: &str) -> ServerResult<Response> {
        self.require_auth()?;
        let path = self.context.store.resolve(remote)?;
        let size = self.context.store.size(&path).await?;
        Ok(Response::Size { size })
    }

    async fn append(&mut self, remote: &str) -> ServerResult<Flow> {
        let prepared = self.prepare_append(remote).await;
        let (lock, mut file) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return self.reply_result(Err(e)).await,
        };
        let _guard = lock.lock_owned().await;
        self.reply(&Response::Ready).await?;

        let mut bytes = 0u64;
        let mut write_error = None;
        loop {
            let (header, payload) = self.read_in_request("append data").await?;
            match header.kind {
                FrameKind::Data => {
                    // Keep draining after a failed write so the reply lands
                    // where the client expects it.
                    if write_error.is_none() {
                        match file.write_all(&payload).await {
                            Ok(()) => bytes += payload.len() as u64,
                            Err(e) => write_error = Some(e),
                        }
                    }
                }
                FrameKind::End => break,
                FrameKind::Control => {
                    self.reply_error(&unexpected("DATA or END frame", "CONTROL"))
                        .await?;
                    return Ok(Flow::Close);
                }
            }
        }

        let result = match write_error {
            Some(e) => Err(e.into()),
            None => finish_append(&mut file).await.map(|size| {
                info!(session = %self.session_id, path = remote, bytes, size, "appended");
                Response::Appended { bytes, size }
            }),
        };
        self.reply_result(result).await
    }

    async fn prepare_append(
        &self,
        remote: &str,
    ) -> ServerResult<(Arc<tokio::sync::Mutex<()>>, File)> {
        self.require_auth()?;
        let path = self.context.store.resolve(remote)?;
        let lock = self.context.store.lock_for(&path);
        let file = self.context.store.open_append(&path).await?;
        Ok((lock, file))
    }

    async fn retrieve(&mut self, remote: &str, start: u64) -> ServerResult<Flow> {
        let opened = self.open_retrieve(remote, start).await;
        let (mut file, size, mut remaining) = match opened {
            Ok(opened) => opened,
            Err(e) => return self.reply_result(Err(e)).await,
        };
        self.reply(&Response::Streaming { size }).await?;

        let mut buf = vec![0u8; DATA_CHUNK_SIZE];
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = match file.read(&mut buf[..want]).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    let err = ServerError::from(e);
                    warn!(session = %self.session_id, error = %err, "read failed mid-stream");
                    self.reply_error(&err).await?;
                    return Err(err);
                }
            };
            self.write_frame(FrameKind::Data, &buf[..n]).await?;
            remaining -= n as u64;
        }
        self.write_frame(FrameKind::End, &[]).await?;
        self.flush().await?;
        debug!(session = %self.session_id, path = remote, start, size, "streamed");
        Ok(Flow::Continue)
    }

    async fn open_retrieve(&self, remote: &str, start: u64) -> ServerResult<(File, u64, u64)> {
        self.require_auth()?;
        let path = self.context.store.resolve(remote)?;
        self.context.store.open_read(&path, start).await
    }

    async fn read_in_request(
        &mut self,
        waiting_for: &'static str,
    ) -> ServerResult<(FrameHeader, Vec<u8>)> {
        let deadline = self.context.config.request_timeout;
        match timeout(deadline, read_frame(&mut self.reader)).await {
            Err(_) => Err(ServerError::Timeout(waiting_for)),
            Ok(Ok(Some(frame))) => Ok(frame),
            Ok(Ok(None)) => Err(ServerError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("peer closed while sending {waiting_for}"),
            ))),
            Ok(Err(e)) => Err(e),
        }
    }

    async fn reply_result(&mut self, result: ServerResult<Response>) -> ServerResult<Flow> {
        match result {
            Ok(response) => {
                self.reply(&response).await?;
                Ok(Flow::Continue)
            }
            Err(e) => {
                self.reply_error(&e).await?;
                if matches!(e, ServerError::Protocol(_)) {
                    Ok(Flow::Close)
                } else {
                    Ok(Flow::Continue)
                }
            }
        }
    }

    async fn reply_error(&mut self, err: &ServerError) -> ServerResult<()> {
        if err.is_server_error() {
            warn!(session = %self.session_id, error = %err, "request failed");
        } else {
            debug!(session = %self.session_id, error = %err, "request refused");
        }
        self.reply(&Response::error(err.code(), err.to_string())).await
    }

    async fn reply(&mut self, response: &Response) -> ServerResult<()> {
        let payload = response.encode()?;
        self.write_frame(FrameKind::Control, &payload).await?;
        self.flush().await
    }

    async fn write_frame(&mut self, kind: FrameKind, payload: &[u8]) -> ServerResult<()> {
        let frame = encode_frame(kind, payload)?;
        self.writer.write_all(&frame).await?;
        Ok(())
    }

    async fn flush(&mut self) -> ServerResult<()> {
        let deadline = self.context.config.request_timeout;
        write_deadline(deadline, self.writer.flush()).await
    }
}

async fn write_deadline<F>(deadline: Duration, flush: F) -> ServerResult<()>
where
    F: std::future::Future<Output = std::io::Result<()>>,
{
    match timeout(deadline, flush).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ServerError::Timeout("client to accept data")),
    }
}

async fn finish_append(file: &mut File) -> ServerResult<u64> {
    file.flush().await?;
    file.sync_data().await?;
    Ok(file.metadata().await?.len())
}

/// Reads one frame; `None` on a clean end of stream.
async fn read_frame<R>(reader: &mut R) -> ServerResult<Option<(FrameHeader, Vec<u8>)>>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; HEADER_LEN];
    match reader.read_exact(&mut raw).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let header = FrameHeader::decode(&raw)?;
    let mut payload = vec![0u8; header.len];
    reader.read_exact(&mut payload).await?;
    Ok(Some((header, payload)))
}

fn unexpected(expected: &'static str, found: &str) -> ServerError {
    ServerError::Protocol(ProtocolError::Unexpected {
        expected,
        found: found.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    struct Client {
        stream: DuplexStream,
    }

    impl Client {
        async fn send(&mut self, request: &Request) {
            let frame = request.to_frame().unwrap();
            self.stream.write_all(&frame).await.unwrap();
        }

        async fn send_raw(&mut self, kind: FrameKind, payload: &[u8]) {
            let frame = encode_frame(kind, payload).unwrap();
            self.stream.write_all(&frame).await.unwrap();
        }

        async fn frame(&mut self) -> (FrameHeader, Vec<u8>) {
            read_frame(&mut self.stream).await.unwrap().unwrap()
        }

        async fn recv(&mut self) -> Response {
            let (header, payload) = self.frame().await;
            assert_eq!(header.kind, FrameKind::Control);
            Response::decode(&payload).unwrap()
        }

        async fn call(&mut self, request: &Request) -> Response {
            self.send(request).await;
            self.recv().await
        }

        async fn hello(&mut self) {
            let response = self
                .call(&Request::Hello {
                    protocol_version: PROTOCOL_VERSION,
                })
                .await;
            assert!(matches!(response, Response::Welcome { .. }));
        }
    }

    type Session = tokio::task::JoinHandle<ServerResult<()>>;

    fn start(config: ServerConfig) -> (Client, Arc<HandlerContext>, Session) {
        let context = Arc::new(HandlerContext::new(config).unwrap());
        let (client, server) = tokio::io::duplex(256 * 1024);
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let task = tokio::spawn(serve_connection(Arc::clone(&context), server, peer));
        (Client { stream: client }, context, task)
    }

    fn config(root: &std::path::Path) -> ServerConfig {
        ServerConfig::new("127.0.0.1:0".parse().unwrap(), root)
    }

    #[tokio::test]
    async fn append_then_retrieve() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, _context, task) = start(config(dir.path()));
        client.hello().await;

        let path = "/shared/file1.txt".to_string();
        assert_eq!(
            client.call(&Request::Size { path: path.clone() }).await,
            Response::Size { size: None }
        );

        assert_eq!(
            client.call(&Request::Append { path: path.clone() }).await,
            Response::Ready
        );
        client.send_raw(FrameKind::Data, b"hello ").await;
        client.send_raw(FrameKind::Data, b"world!").await;
        client.send_raw(FrameKind::End, &[]).await;
        assert_eq!(
            client.recv().await,
            Response::Appended {
                bytes: 12,
                size: 12
            }
        );

        assert_eq!(
            client
                .call(&Request::Retrieve {
                    path: path.clone(),
                    start: 6
                })
                .await,
            Response::Streaming { size: 12 }
        );
        let mut received = Vec::new();
        loop {
            let (header, payload) = client.frame().await;
            match header.kind {
                FrameKind::Data => received.extend_from_slice(&payload),
                FrameKind::End => break,
                FrameKind::Control => panic!("unexpected control frame"),
            }
        }
        assert_eq!(received, b"world!");

        assert_eq!(client.call(&Request::Quit).await, Response::Goodbye);
        task.await.unwrap().unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("shared/file1.txt")).unwrap(),
            b"hello world!"
        );
    }

    #[tokio::test]
    async fn hello_required_first() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, _context, task) = start(config(dir.path()));

        let response = client.call(&Request::Size { path: "f".into() }).await;
        assert!(matches!(
            response,
            Response::Error {
                code: tailsync_protocol::ErrorCode::Protocol,
                ..
            }
        ));
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn login_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, context, _task) =
            start(config(dir.path()).with_user("ftpuser", "ftppass"));
        client.hello().await;

        let response = client.call(&Request::Size { path: "f".into() }).await;
        assert!(matches!(
            response,
            Response::Error {
                code: tailsync_protocol::ErrorCode::Unauthorized,
                ..
            }
        ));

        let response = client
            .call(&Request::Authenticate {
                user: "ftpuser".into(),
                password: "nope".into(),
            })
            .await;
        assert!(matches!(response, Response::Error { .. }));

        let response = client
            .call(&Request::Authenticate {
                user: "ftpuser".into(),
                password: "ftppass".into(),
            })
            .await;
        assert_eq!(response, Response::Ready);
        assert_eq!(
            client.call(&Request::Size { path: "f".into() }).await,
            Response::Size { size: None }
        );
        assert_eq!(context.active_sessions(), 1);
    }

    #[tokio::test]
    async fn escaping_path_rejected_session_survives() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, _context, _task) = start(config(dir.path()));
        client.hello().await;

        let response = client
            .call(&Request::Append {
                path: "../outside".into(),
            })
            .await;
        assert!(matches!(
            response,
            Response::Error {
                code: tailsync_protocol::ErrorCode::InvalidPath,
                ..
            }
        ));
        assert_eq!(
            client.call(&Request::Size { path: "ok".into() }).await,
            Response::Size { size: None }
        );
    }

    #[tokio::test]
    async fn retrieve_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, _context, _task) = start(config(dir.path()));
        client.hello().await;

        let response = client
            .call(&Request::Retrieve {
                path: "missing".into(),
                start: 0,
            })
            .await;
        assert!(matches!(
            response,
            Response::Error {
                code: tailsync_protocol::ErrorCode::NotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn version_mismatch_closes_session() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, _context, task) = start(config(dir.path()));

        let response = client
            .call(&Request::Hello {
                protocol_version: PROTOCOL_VERSION + 1,
            })
            .await;
        assert!(matches!(
            response,
            Response::Error {
                code: tailsync_protocol::ErrorCode::VersionMismatch,
                ..
            }
        ));
        task.await.unwrap().unwrap();
    }
}
