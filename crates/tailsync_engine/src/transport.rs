//! Remote endpoint abstraction.

use crate::config::Credentials;
use crate::delta::skip_prefix;
use crate::error::{Operation, SyncError, SyncResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::Arc;
use tailsync_protocol::ErrorCode;
use tailsync_storage::StorageError;

/// A remote file store that supports appending bytes and streaming a file
/// back.
///
/// One endpoint is one session. The loops hold theirs for their whole life
/// and call [`RemoteEndpoint::close`] on shutdown.
pub trait RemoteEndpoint: Send {
    /// Logs in.
    fn authenticate(&mut self, credentials: &Credentials) -> SyncResult<()>;

    /// Returns the size of a remote file, or `None` if it does not exist.
    fn size(&mut self, path: &str) -> SyncResult<Option<u64>>;

    /// Appends everything `data` yields to the end of a remote file,
    /// creating it if needed. Returns the number of bytes sent.
    fn append(&mut self, path: &str, data: &mut dyn Read) -> SyncResult<u64>;

    /// Streams a remote file from its first byte.
    fn retrieve<'a>(&'a mut self, path: &str) -> SyncResult<Box<dyn Read + 'a>>;

    /// Streams a remote file starting at `start`.
    ///
    /// The default discards the prefix of a full retrieval. Endpoints that
    /// can seek server-side override this.
    fn retrieve_from<'a>(&'a mut self, path: &str, start: u64) -> SyncResult<Box<dyn Read + 'a>> {
        let mut stream = self.retrieve(path)?;
        skip_prefix(&mut *stream, start).map_err(|e| SyncError::transport(Operation::Retrieve, e))?;
        Ok(stream)
    }

    /// Ends the session.
    fn close(&mut self) -> SyncResult<()>;
}

impl<E: RemoteEndpoint + ?Sized> RemoteEndpoint for Box<E> {
    fn authenticate(&mut self, credentials: &Credentials) -> SyncResult<()> {
        (**self).authenticate(credentials)
    }

    fn size(&mut self, path: &str) -> SyncResult<Option<u64>> {
        (**self).size(path)
    }

    fn append(&mut self, path: &str, data: &mut dyn Read) -> SyncResult<u64> {
        (**self).append(path, data)
    }

    fn retrieve<'a>(&'a mut self, path: &str) -> SyncResult<Box<dyn Read + 'a>> {
        (**self).retrieve(path)
    }

    fn retrieve_from<'a>(&'a mut self, path: &str, start: u64) -> SyncResult<Box<dyn Read + 'a>> {
        (**self).retrieve_from(path, start)
    }

    fn close(&mut self) -> SyncResult<()> {
        (**self).close()
    }
}

/// Number of calls each operation has received, across all sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteCalls {
    /// Size probes.
    pub size: u64,
    /// Appends.
    pub append: u64,
    /// Retrievals, ranged or not.
    pub retrieve: u64,
}

#[derive(Debug, Default)]
struct RemoteState {
    files: HashMap<String, Vec<u8>>,
    credentials: Option<Credentials>,
    unreachable: bool,
    faults: Vec<Operation>,
    calls: RemoteCalls,
}

/// An in-process remote store shared between endpoints.
///
/// Clones share the same files, so a producer endpoint and a consumer
/// endpoint opened from one `MemoryRemote` see each other's appends.
#[derive(Debug, Clone, Default)]
pub struct MemoryRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl MemoryRemote {
    /// Creates an empty store that accepts anonymous sessions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires sessions to log in with the given credentials.
    pub fn with_credentials(self, credentials: Credentials) -> Self {
        self.state.lock().credentials = Some(credentials);
        self
    }

    /// Opens a session.
    pub fn connect(&self) -> SyncResult<MemoryEndpoint> {
        if self.state.lock().unreachable {
            return Err(SyncError::connectivity(
                Operation::Connect,
                "memory remote is unreachable",
            ));
        }
        Ok(MemoryEndpoint {
            remote: self.clone(),
            authenticated: false,
            closed: false,
        })
    }

    /// Returns a copy of a file's content.
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().files.get(path).cloned()
    }

    /// Replaces a file's content.
    pub fn put(&self, path: &str, content: impl Into<Vec<u8>>) {
        self.state.lock().files.insert(path.to_string(), content.into());
    }

    /// Appends to a file behind the endpoints' backs, as another writer
    /// would.
    pub fn append_external(&self, path: &str, data: &[u8]) {
        self.state
            .lock()
            .files
            .entry(path.to_string())
            .or_default()
            .extend_from_slice(data);
    }

    /// Returns call counters.
    pub fn calls(&self) -> RemoteCalls {
        self.state.lock().calls
    }

    /// Makes the next call of `operation`, on any session, fail.
    pub fn fail_next(&self, operation: Operation) {
        self.state.lock().faults.push(operation);
    }

    /// Makes every new connection and call fail with a connectivity error.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unreachable = !reachable;
    }
}

/// A session on a [`MemoryRemote`].
#[derive(Debug)]
pub struct MemoryEndpoint {
    remote: MemoryRemote,
    authenticated: bool,
    closed: bool,
}

impl MemoryEndpoint {
    /// Returns the store this session talks to.
    pub fn remote(&self) -> &MemoryRemote {
        &self.remote
    }

    fn check(&self, state: &mut RemoteState, operation: Operation) -> SyncResult<()> {
        if self.closed || state.unreachable {
            return Err(SyncError::connectivity(operation, "session is not connected"));
        }
        if let Some(pos) = state.faults.iter().position(|op| *op == operation) {
            state.faults.remove(pos);
            return Err(SyncError::remote(operation, "injected failure"));
        }
        if operation != Operation::Authenticate
            && state.credentials.is_some()
            && !self.authenticated
        {
            return Err(SyncError::rejected(
                operation,
                ErrorCode::Unauthorized,
                "not logged in",
            ));
        }
        Ok(())
    }

    fn snapshot(&mut self, path: &str) -> SyncResult<Vec<u8>> {
        let mut state = self.remote.state.lock();
        self.check(&mut state, Operation::Retrieve)?;
        state.calls.retrieve += 1;
        state
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| {
                SyncError::rejected(Operation::Retrieve, ErrorCode::NotFound, path.to_string())
            })
    }
}

impl RemoteEndpoint for MemoryEndpoint {
    fn authenticate(&mut self, credentials: &Credentials) -> SyncResult<()> {
        let mut state = self.remote.state.lock();
        self.check(&mut state, Operation::Authenticate)?;
        match &state.credentials {
            Some(expected) if expected != credentials => Err(SyncError::connectivity(
                Operation::Authenticate,
                format!("login rejected for user {}", credentials.user),
            )),
            _ => {
                self.authenticated = true;
                Ok(())
            }
        }
    }

    fn size(&mut self, path: &str) -> SyncResult<Option<u64>> {
        let mut state = self.remote.state.lock();
        self.check(&mut state, Operation::Size)?;
        state.calls.size += 1;
        Ok(state.files.get(path).map(|f| f.len() as u64))
    }

    fn append(&mut self, path: &str, data: &mut dyn Read) -> SyncResult<u64> {
        let mut staged = Vec::new();
        data.read_to_end(&mut staged).map_err(|e| SyncError::LocalIo {
            operation: Operation::Extract,
            source: StorageError::Io(e),
        })?;

        let mut state = self.remote.state.lock();
        self.check(&mut state, Operation::Append)?;
        state.calls.append += 1;
        state
            .files
            .entry(path.to_string())
            .or_default()
            .extend_from_slice(&staged);
        Ok(staged.len() as u64)
    }

    fn retrieve<'a>(&'a mut self, path: &str) -> SyncResult<Box<dyn Read + 'a>> {
        Ok(Box::new(Cursor::new(self.snapshot(path)?)))
    }

    fn retrieve_from<'a>(&'a mut self, path: &str, start: u64) -> SyncResult<Box<dyn Read + 'a>> {
        let content = self.snapshot(path)?;
        let start = usize::try_from(start).unwrap_or(usize::MAX).min(content.len());
        Ok(Box::new(Cursor::new(content[start..].to_vec())))
    }

    fn close(&mut self) -> SyncResult<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_are_visible_across_sessions() {
        let remote = MemoryRemote::new();
        let mut producer = remote.connect().unwrap();
        let mut consumer = remote.connect().unwrap();

        assert_eq!(consumer.size("/f").unwrap(), None);
        assert_eq!(producer.append("/f", &mut &b"hello"[..]).unwrap(), 5);
        assert_eq!(consumer.size("/f").unwrap(), Some(5));

        let mut out = String::new();
        consumer
            .retrieve("/f")
            .unwrap()
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn retrieve_from_skips_prefix() {
        let remote = MemoryRemote::new();
        remote.put("/f", b"hello world!".to_vec());
        let mut endpoint = remote.connect().unwrap();

        let mut out = Vec::new();
        endpoint
            .retrieve_from("/f", 6)
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, b"world!");

        out.clear();
        endpoint
            .retrieve_from("/f", 100)
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn default_retrieve_from_discards_client_side() {
        struct FullOnly(MemoryEndpoint);

        impl RemoteEndpoint for FullOnly {
            fn authenticate(&mut self, credentials: &Credentials) -> SyncResult<()> {
                self.0.authenticate(credentials)
            }
            fn size(&mut self, path: &str) -> SyncResult<Option<u64>> {
                self.0.size(path)
            }
            fn append(&mut self, path: &str, data: &mut dyn Read) -> SyncResult<u64> {
                self.0.append(path, data)
            }
            fn retrieve<'a>(&'a mut self, path: &str) -> SyncResult<Box<dyn Read + 'a>> {
                self.0.retrieve(path)
            }
            fn close(&mut self) -> SyncResult<()> {
                self.0.close()
            }
        }

        let remote = MemoryRemote::new();
        remote.put("/f", b"hello world!".to_vec());
        let mut endpoint = FullOnly(remote.connect().unwrap());

        let mut out = Vec::new();
        endpoint
            .retrieve_from("/f", 6)
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, b"world!");
    }

    #[test]
    fn login_required_when_configured() {
        let creds = Credentials::new("ftpuser", "ftppass");
        let remote = MemoryRemote::new().with_credentials(creds.clone());
        let mut endpoint = remote.connect().unwrap();

        assert!(matches!(
            endpoint.size("/f"),
            Err(SyncError::RemoteOperation { .. })
        ));
        assert!(matches!(
            endpoint.authenticate(&Credentials::new("ftpuser", "wrong")),
            Err(SyncError::Connectivity { .. })
        ));
        endpoint.authenticate(&creds).unwrap();
        assert_eq!(endpoint.size("/f").unwrap(), None);
    }

    #[test]
    fn injected_fault_fires_once() {
        let remote = MemoryRemote::new();
        let mut endpoint = remote.connect().unwrap();
        remote.fail_next(Operation::Append);

        assert!(endpoint.append("/f", &mut &b"x"[..]).is_err());
        assert!(endpoint.append("/f", &mut &b"x"[..]).is_ok());
        assert_eq!(remote.file("/f").unwrap(), b"x");
    }

    #[test]
    fn unreachable_remote() {
        let remote = MemoryRemote::new();
        let mut endpoint = remote.connect().unwrap();
        remote.set_reachable(false);

        assert!(matches!(
            remote.connect(),
            Err(SyncError::Connectivity { .. })
        ));
        assert!(endpoint.size("/f").unwrap_err().is_retryable());
    }

    #[test]
    fn closed_session_rejects_calls() {
        let remote = MemoryRemote::new();
        let mut endpoint = remote.connect().unwrap();
        endpoint.close().unwrap();
        assert!(endpoint.size("/f").is_err());
    }

    #[test]
    fn call_counters() {
        let remote = MemoryRemote::new();
        remote.put("/f", b"abc".to_vec());
        let mut endpoint = remote.connect().unwrap();
        endpoint.size("/f").unwrap();
        endpoint.retrieve("/f").unwrap();

        let calls = remote.calls();
        assert_eq!(calls.size, 1);
        assert_eq!(calls.retrieve, 1);
        assert_eq!(calls.append, 0);
    }
}
