//! Server configuration.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// A login accepted by the server.
#[derive(Clone, PartialEq, Eq)]
pub struct UserEntry {
    /// User name.
    pub user: String,
    /// Password in clear text; hashed when the server starts.
    pub password: String,
}

impl fmt::Debug for UserEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserEntry")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// Configuration for the remote store.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Directory served; remote paths resolve under it.
    pub root: PathBuf,
    /// Accepted logins. Empty means anonymous access.
    pub users: Vec<UserEntry>,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Deadline for each frame once a request is in progress.
    pub request_timeout: Duration,
    /// How long a session may sit between requests; `None` keeps idle
    /// sessions open until the client leaves.
    pub idle_timeout: Option<Duration>,
}

impl ServerConfig {
    /// Creates a new server configuration.
    pub fn new(bind_addr: SocketAddr, root: impl Into<PathBuf>) -> Self {
        Self {
            bind_addr,
            root: root.into(),
            users: Vec::new(),
            max_connections: 64,
            request_timeout: Duration::from_secs(30),
            idle_timeout: None,
        }
    }

    /// Adds an accepted login.
    pub fn with_user(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.push(UserEntry {
            user: user.into(),
            password: password.into(),
        });
        self
    }

    /// Sets the maximum concurrent connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.max(1);
        self
    }

    /// Sets the per-frame deadline.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the idle deadline. Zero disables it.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Returns true if sessions must log in.
    pub fn requires_auth(&self) -> bool {
        !self.users.is_empty()
    }
}
