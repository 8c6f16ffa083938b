//! Blocking TCP client for `tailsync_server`.

use crate::config::{Credentials, RemoteConfig};
use crate::error::{Operation, SyncError, SyncResult};
use crate::transport::RemoteEndpoint;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tailsync_protocol::{
    encode_frame, ErrorCode, FrameHeader, FrameKind, ProtocolError, Request, Response,
    DATA_CHUNK_SIZE, HEADER_LEN, PROTOCOL_VERSION,
};
use tailsync_storage::StorageError;
use tracing::{debug, info, warn};

/// A session with a remote store over TCP.
///
/// Every read and write on the socket is bounded by the configured I/O
/// timeout, so a stalled peer surfaces as [`SyncError::Timeout`] instead of
/// hanging the loop.
///
/// A session the server closed while it sat idle between cycles is
/// replaced by a fresh one before the next request goes out.
#[derive(Debug)]
pub struct TcpEndpoint {
    config: RemoteConfig,
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    peer: SocketAddr,
    session_id: String,
    closed: bool,
    desynced: bool,
}

impl TcpEndpoint {
    /// Connects, says hello, and logs in if credentials are configured.
    pub fn connect(config: &RemoteConfig) -> SyncResult<Self> {
        let stream = open_stream(&config.address, config.connect_timeout)?;
        let setup = |e| SyncError::transport(Operation::Connect, e);
        stream.set_read_timeout(config.io_timeout).map_err(setup)?;
        stream.set_write_timeout(config.io_timeout).map_err(setup)?;
        stream.set_nodelay(true).map_err(setup)?;
        let peer = stream.peer_addr().map_err(setup)?;
        let writer = BufWriter::new(stream.try_clone().map_err(setup)?);

        let mut endpoint = Self {
            config: config.clone(),
            reader: BufReader::new(stream),
            writer,
            peer,
            session_id: String::new(),
            closed: false,
            desynced: false,
        };
        endpoint.hello()?;
        if let Some(credentials) = &config.credentials {
            endpoint.authenticate(credentials)?;
        }
        Ok(endpoint)
    }

    /// Returns the session id the server assigned.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Returns the server address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn hello(&mut self) -> SyncResult<()> {
        let request = Request::Hello {
            protocol_version: PROTOCOL_VERSION,
        };
        match self.call(Operation::Connect, &request)? {
            Response::Welcome {
                protocol_version,
                session_id,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    return Err(ProtocolError::VersionMismatch {
                        local: PROTOCOL_VERSION,
                        remote: protocol_version,
                    }
                    .into());
                }
                debug!(peer = %self.peer, session = %session_id, "connected");
                self.session_id = session_id;
                Ok(())
            }
            other => Err(refused(Operation::Connect, "Welcome", other)),
        }
    }

    fn ensure_usable(&self, operation: Operation) -> SyncResult<()> {
        if self.closed {
            return Err(SyncError::connectivity(operation, "session is closed"));
        }
        if self.desynced {
            return Err(SyncError::Protocol(format!(
                "session {} lost frame sync; {operation} not attempted",
                self.session_id
            )));
        }
        Ok(())
    }

    /// Reconnects if the server has already hung up on this session.
    ///
    /// Runs before a request is written, so nothing of the request can have
    /// reached the old session.
    fn reconnect_if_dropped(&mut self, operation: Operation) -> SyncResult<()> {
        if self.closed || self.desynced || !self.reader.buffer().is_empty() {
            return Ok(());
        }
        if !peer_hung_up(self.reader.get_ref()) {
            return Ok(());
        }
        info!(
            peer = %self.peer,
            session = %self.session_id,
            %operation,
            "server closed the session, reconnecting"
        );
        *self = Self::connect(&self.config)?;
        Ok(())
    }

    fn write_frame(&mut self, operation: Operation, kind: FrameKind, payload: &[u8]) -> SyncResult<()> {
        let frame = encode_frame(kind, payload)?;
        self.writer
            .write_all(&frame)
            .map_err(|e| SyncError::transport(operation, e))
    }

    fn flush(&mut self, operation: Operation) -> SyncResult<()> {
        self.writer
            .flush()
            .map_err(|e| SyncError::transport(operation, e))
    }

    fn recv(&mut self, operation: Operation) -> SyncResult<Response> {
        let (header, payload) = read_frame(&mut self.reader).map_err(|e| {
            self.desynced = true;
            SyncError::transport(operation, e)
        })?;
        if header.kind != FrameKind::Control {
            self.desynced = true;
            return Err(ProtocolError::Unexpected {
                expected: "CONTROL frame",
                found: header.kind.name().to_string(),
            }
            .into());
        }
        Ok(Response::decode(&payload)?)
    }

    fn call(&mut self, operation: Operation, request: &Request) -> SyncResult<Response> {
        self.ensure_usable(operation)?;
        let payload = request.encode()?;
        self.write_frame(operation, FrameKind::Control, &payload)?;
        self.flush(operation)?;
        self.recv(operation)
    }
}

impl RemoteEndpoint for TcpEndpoint {
    fn authenticate(&mut self, credentials: &Credentials) -> SyncResult<()> {
        let request = Request::Authenticate {
            user: credentials.user.clone(),
            password: credentials.password.clone(),
        };
        match self.call(Operation::Authenticate, &request)? {
            Response::Ready => {
                debug!(user = %credentials.user, session = %self.session_id, "logged in");
                Ok(())
            }
            other => Err(refused(Operation::Authenticate, "Ready", other)),
        }
    }

    fn size(&mut self, path: &str) -> SyncResult<Option<u64>> {
        self.reconnect_if_dropped(Operation::Size)?;
        let request = Request::Size {
            path: path.to_string(),
        };
        match self.call(Operation::Size, &request)? {
            Response::Size { size } => Ok(size),
            other => Err(refused(Operation::Size, "Size", other)),
        }
    }

    fn append(&mut self, path: &str, data: &mut dyn Read) -> SyncResult<u64> {
        let operation = Operation::Append;
        self.reconnect_if_dropped(operation)?;
        let request = Request::Append {
            path: path.to_string(),
        };
        match self.call(operation, &request)? {
            Response::Ready => {}
            other => return Err(refused(operation, "Ready", other)),
        }

        let mut buf = vec![0u8; DATA_CHUNK_SIZE];
        let mut sent = 0u64;
        loop {
            let n = match data.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // The server is still waiting for END.
                    self.desynced = true;
                    return Err(SyncError::LocalIo {
                        operation: Operation::Extract,
                        source: StorageError::Io(e),
                    });
                }
            };
            self.write_frame(operation, FrameKind::Data, &buf[..n])?;
            sent += n as u64;
        }
        self.write_frame(operation, FrameKind::End, &[])?;
        self.flush(operation)?;

        match self.recv(operation)? {
            Response::Appended { bytes, size } if bytes == sent => {
                debug!(path, bytes, remote_size = size, "append acknowledged");
                Ok(sent)
            }
            Response::Appended { bytes, .. } => Err(SyncError::remote(
                operation,
                format!("sent {sent} bytes but remote stored {bytes}"),
            )),
            other => Err(refused(operation, "Appended", other)),
        }
    }

    fn retrieve<'a>(&'a mut self, path: &str) -> SyncResult<Box<dyn Read + 'a>> {
        self.retrieve_from(path, 0)
    }

    fn retrieve_from<'a>(&'a mut self, path: &str, start: u64) -> SyncResult<Box<dyn Read + 'a>> {
        self.reconnect_if_dropped(Operation::Retrieve)?;
        let request = Request::Retrieve {
            path: path.to_string(),
            start,
        };
        match self.call(Operation::Retrieve, &request)? {
            Response::Streaming { size } => {
                debug!(path, start, remote_size = size, "streaming");
                Ok(Box::new(FrameStream::new(self)))
            }
            other => Err(refused(Operation::Retrieve, "Streaming", other)),
        }
    }

    fn close(&mut self) -> SyncResult<()> {
        if self.closed {
            return Ok(());
        }
        let result = if self.desynced {
            Ok(())
        } else {
            match self.call(Operation::Close, &Request::Quit) {
                Ok(Response::Goodbye) => Ok(()),
                Ok(other) => Err(refused(Operation::Close, "Goodbye", other)),
                Err(e) => Err(e),
            }
        };
        self.closed = true;
        if let Err(e) = self.reader.get_ref().shutdown(Shutdown::Both) {
            debug!(error = %e, "socket shutdown failed");
        }
        result
    }
}

/// Reads DATA frames until END.
struct FrameStream<'a> {
    endpoint: &'a mut TcpEndpoint,
    buf: Vec<u8>,
    pos: usize,
    done: bool,
}

impl<'a> FrameStream<'a> {
    fn new(endpoint: &'a mut TcpEndpoint) -> Self {
        Self {
            endpoint,
            buf: Vec::new(),
            pos: 0,
            done: false,
        }
    }

    fn fill(&mut self) -> io::Result<()> {
        let (header, payload) = read_frame(&mut self.endpoint.reader)?;
        match header.kind {
            FrameKind::Data => {
                self.buf = payload;
                self.pos = 0;
                Ok(())
            }
            FrameKind::End => {
                self.done = true;
                Ok(())
            }
            FrameKind::Control => {
                let message = match Response::decode(&payload) {
                    Ok(Response::Error { code, message }) => format!("{code:?}: {message}"),
                    Ok(other) => format!("unexpected {} during stream", other.name()),
                    Err(e) => e.to_string(),
                };
                self.done = true;
                Err(io::Error::new(io::ErrorKind::InvalidData, message))
            }
        }
    }
}

impl Read for FrameStream<'_> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.buf.len() {
            if self.done {
                return Ok(0);
            }
            if let Err(e) = self.fill() {
                self.endpoint.desynced = true;
                return Err(e);
            }
        }
        let n = out.len().min(self.buf.len() - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl Drop for FrameStream<'_> {
    fn drop(&mut self) {
        // Leave the session positioned at the next response.
        while !self.done && !self.endpoint.desynced {
            if let Err(e) = self.fill() {
                warn!(error = %e, "failed to drain abandoned stream");
                self.endpoint.desynced = true;
            }
        }
    }
}

fn open_stream(address: &str, timeout: Duration) -> SyncResult<TcpStream> {
    let addrs = address.to_socket_addrs().map_err(|e| {
        SyncError::connectivity(Operation::Connect, format!("cannot resolve {address}: {e}"))
    })?;

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(%addr, error = %e, "connect attempt failed");
                last_err = Some(e);
            }
        }
    }
    Err(match last_err {
        Some(e) => SyncError::transport(Operation::Connect, e),
        None => SyncError::connectivity(
            Operation::Connect,
            format!("{address} resolved to no addresses"),
        ),
    })
}

/// True when the peer has closed its end and no reply is pending.
fn peer_hung_up(stream: &TcpStream) -> bool {
    if let Err(e) = stream.set_nonblocking(true) {
        debug!(error = %e, "cannot check session liveness");
        return false;
    }
    let mut byte = [0u8; 1];
    let hung_up = match stream.peek(&mut byte) {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) => !matches!(
            e.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
        ),
    };
    // A socket stuck in non-blocking mode is as good as gone.
    stream.set_nonblocking(false).is_err() || hung_up
}

fn read_frame<R: Read>(reader: &mut R) -> io::Result<(FrameHeader, Vec<u8>)> {
    let mut raw = [0u8; HEADER_LEN];
    reader.read_exact(&mut raw)?;
    let header =
        FrameHeader::decode(&raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut payload = vec![0u8; header.len];
    reader.read_exact(&mut payload)?;
    Ok((header, payload))
}

/// Maps a response that is not the one expected.
fn refused(operation: Operation, expected: &'static str, response: Response) -> SyncError {
    match response {
        Response::Error {
            code: ErrorCode::Unauthorized,
            message,
        } if operation == Operation::Authenticate => SyncError::connectivity(operation, message),
        Response::Error {
            code: ErrorCode::VersionMismatch,
            message,
        } => SyncError::Protocol(message),
        Response::Error { code, message } => {
            SyncError::rejected(operation, code, message)
        }
        other => ProtocolError::Unexpected {
            expected,
            found: other.name().to_string(),
        }
        .into(),
    }
}
