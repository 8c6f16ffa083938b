//! Settings resolution for the binary.
//!
//! Flags and environment variables arrive through clap; anything they leave
//! unset falls back to the JSON file named by `--config`, then to built-in
//! defaults. The result is a set of explicit engine and server configs.

use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tailsync_engine::{
    ConsumerConfig, Credentials, ProducerConfig, RemoteConfig, RetryConfig, Staging,
    DEFAULT_POLL_INTERVAL,
};
use tailsync_server::ServerConfig;
use thiserror::Error;

/// Default address for `serve`.
pub const DEFAULT_BIND: &str = "127.0.0.1:2121";

/// Errors raised while assembling settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required setting was given nowhere.
    #[error("missing required setting `{0}` (pass it as a flag or in the config file)")]
    Missing(&'static str),

    /// A setting was given but is unusable.
    #[error("invalid setting `{field}`: {message}")]
    Invalid {
        /// Setting name.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },

    /// The config file could not be opened.
    #[error("cannot read config file {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON for this schema.
    #[error("cannot parse config file {path}: {source}")]
    Parse {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

/// Result alias for settings resolution.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Contents of the JSON config file. Every field is optional.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    /// Remote store address, `host:port`.
    pub address: Option<String>,
    /// Login user.
    pub user: Option<String>,
    /// Login password.
    pub password: Option<String>,
    /// Connect timeout in milliseconds.
    pub connect_timeout_ms: Option<u64>,
    /// Per-operation timeout in milliseconds; 0 disables it.
    pub io_timeout_ms: Option<u64>,
    /// Poll interval in milliseconds.
    pub interval_ms: Option<u64>,
    /// Stop after this many cycles.
    pub max_cycles: Option<u64>,
    /// Whole-loop restarts allowed after a retryable failure.
    pub restart_attempts: Option<u32>,
    /// Producer section.
    pub push: SideSection,
    /// Consumer section.
    pub pull: SideSection,
    /// Server section.
    pub serve: ServeSection,
}

/// Producer or consumer settings from the config file.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SideSection {
    pub local: Option<PathBuf>,
    pub remote_path: Option<String>,
    pub watermark: Option<PathBuf>,
    pub heartbeat: Option<bool>,
    pub staging_dir: Option<PathBuf>,
    pub range_reads: Option<bool>,
    pub truncate_on_resume: Option<bool>,
}

/// Server settings from the config file.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServeSection {
    pub bind: Option<String>,
    pub root: Option<PathBuf>,
    /// Entries of the form `user:password`.
    pub users: Vec<String>,
    pub max_connections: Option<usize>,
    /// Close sessions idle this long; 0 keeps them open.
    pub idle_timeout_ms: Option<u64>,
}

impl FileConfig {
    /// Loads `path`, or returns an empty config when no path is given.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let file = File::open(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Remote connection options given on the command line.
#[derive(Debug, Default, Clone)]
pub struct RemoteOptions {
    pub address: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub connect_timeout_ms: Option<u64>,
    pub io_timeout_ms: Option<u64>,
}

/// Loop pacing options given on the command line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopOptions {
    pub interval_ms: Option<u64>,
    pub max_cycles: Option<u64>,
    pub restart_attempts: Option<u32>,
}

/// Resolved pacing for a producer or consumer loop.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub interval: Duration,
    pub max_cycles: Option<u64>,
    pub retry: RetryConfig,
}

/// Local paths shared by `push` and `pull`.
#[derive(Debug, Clone)]
pub struct LocalPaths {
    pub local: PathBuf,
    pub watermark: PathBuf,
}

/// Resolves the remote connection.
pub fn resolve_remote(options: &RemoteOptions, file: &FileConfig) -> ConfigResult<RemoteConfig> {
    let address = options
        .address
        .clone()
        .or_else(|| file.address.clone())
        .ok_or(ConfigError::Missing("address"))?;

    let mut remote = RemoteConfig::new(address);

    let user = options.user.clone().or_else(|| file.user.clone());
    let password = options.password.clone().or_else(|| file.password.clone());
    match (user, password) {
        (Some(user), password) => {
            remote = remote.with_credentials(Credentials::new(user, password.unwrap_or_default()));
        }
        (None, Some(_)) => {
            return Err(ConfigError::Invalid {
                field: "password",
                message: "a password was given without a user".into(),
            })
        }
        (None, None) => {}
    }

    if let Some(ms) = options.connect_timeout_ms.or(file.connect_timeout_ms) {
        if ms == 0 {
            return Err(ConfigError::Invalid {
                field: "connect_timeout_ms",
                message: "must be greater than zero".into(),
            });
        }
        remote = remote.with_connect_timeout(Duration::from_millis(ms));
    }
    if let Some(ms) = options.io_timeout_ms.or(file.io_timeout_ms) {
        let timeout = (ms > 0).then(|| Duration::from_millis(ms));
        remote = remote.with_io_timeout(timeout);
    }
    Ok(remote)
}

/// Resolves loop pacing and the restart policy.
pub fn resolve_loop(options: LoopOptions, file: &FileConfig) -> LoopSettings {
    let interval = options
        .interval_ms
        .or(file.interval_ms)
        .map_or(DEFAULT_POLL_INTERVAL, Duration::from_millis);
    let retry = match options.restart_attempts.or(file.restart_attempts) {
        Some(attempts) if attempts > 0 => RetryConfig::new(attempts.saturating_add(1)),
        _ => RetryConfig::no_retry(),
    };
    LoopSettings {
        interval,
        max_cycles: options.max_cycles.or(file.max_cycles),
        retry,
    }
}

fn resolve_paths(
    local: Option<PathBuf>,
    watermark: Option<PathBuf>,
    section: &SideSection,
) -> ConfigResult<LocalPaths> {
    Ok(LocalPaths {
        local: local
            .or_else(|| section.local.clone())
            .ok_or(ConfigError::Missing("local"))?,
        watermark: watermark
            .or_else(|| section.watermark.clone())
            .ok_or(ConfigError::Missing("watermark"))?,
    })
}

fn resolve_remote_path(flag: Option<String>, section: &SideSection) -> ConfigResult<String> {
    let path = flag
        .or_else(|| section.remote_path.clone())
        .ok_or(ConfigError::Missing("remote_path"))?;
    if path.trim().is_empty() {
        return Err(ConfigError::Invalid {
            field: "remote_path",
            message: "must not be empty".into(),
        });
    }
    Ok(path)
}

/// Producer options given on the command line.
#[derive(Debug, Default, Clone)]
pub struct PushOptions {
    pub local: Option<PathBuf>,
    pub remote_path: Option<String>,
    pub watermark: Option<PathBuf>,
    pub heartbeat: bool,
    pub staging_dir: Option<PathBuf>,
}

/// Everything `push` needs.
#[derive(Debug, Clone)]
pub struct PushSettings {
    pub paths: LocalPaths,
    pub producer: ProducerConfig,
    pub heartbeat: bool,
}

/// Resolves producer settings.
pub fn resolve_push(options: PushOptions, file: &FileConfig) -> ConfigResult<PushSettings> {
    let section = &file.push;
    let paths = resolve_paths(options.local, options.watermark, section)?;
    let remote_path = resolve_remote_path(options.remote_path, section)?;

    let staging = match options.staging_dir.or_else(|| section.staging_dir.clone()) {
        Some(dir) => Staging::TempFile { dir: Some(dir) },
        None => Staging::Memory,
    };
    let producer = ProducerConfig::new(remote_path).with_staging(staging);

    Ok(PushSettings {
        paths,
        producer,
        heartbeat: options.heartbeat || section.heartbeat.unwrap_or(false),
    })
}

/// Consumer options given on the command line.
#[derive(Debug, Default, Clone)]
pub struct PullOptions {
    pub local: Option<PathBuf>,
    pub remote_path: Option<String>,
    pub watermark: Option<PathBuf>,
    pub no_range_reads: bool,
    pub truncate_on_resume: bool,
}

/// Everything `pull` needs.
#[derive(Debug, Clone)]
pub struct PullSettings {
    pub paths: LocalPaths,
    pub consumer: ConsumerConfig,
}

/// Resolves consumer settings.
pub fn resolve_pull(options: PullOptions, file: &FileConfig) -> ConfigResult<PullSettings> {
    let section = &file.pull;
    let paths = resolve_paths(options.local, options.watermark, section)?;
    let remote_path = resolve_remote_path(options.remote_path, section)?;

    let range_reads = !options.no_range_reads && section.range_reads.unwrap_or(true);
    let truncate = options.truncate_on_resume || section.truncate_on_resume.unwrap_or(false);
    let consumer = ConsumerConfig::new(remote_path)
        .with_range_reads(range_reads)
        .with_truncate_on_resume(truncate);

    Ok(PullSettings { paths, consumer })
}

/// Server options given on the command line.
#[derive(Debug, Default, Clone)]
pub struct ServeOptions {
    pub bind: Option<SocketAddr>,
    pub root: Option<PathBuf>,
    pub users: Vec<String>,
    pub max_connections: Option<usize>,
    pub idle_timeout_ms: Option<u64>,
}

/// Resolves the server config.
///
/// Users given on the command line replace those in the file.
pub fn resolve_serve(options: ServeOptions, file: &FileConfig) -> ConfigResult<ServerConfig> {
    let section = &file.serve;
    let bind = match options.bind {
        Some(addr) => addr,
        None => {
            let raw = section.bind.as_deref().unwrap_or(DEFAULT_BIND);
            raw.parse().map_err(|e| ConfigError::Invalid {
                field: "bind",
                message: format!("{raw}: {e}"),
            })?
        }
    };
    let root = options
        .root
        .or_else(|| section.root.clone())
        .ok_or(ConfigError::Missing("root"))?;

    let users = if options.users.is_empty() {
        &section.users
    } else {
        &options.users
    };

    let mut config = ServerConfig::new(bind, root);
    for entry in users {
        let (user, password) = parse_user(entry)?;
        config = config.with_user(user, password);
    }
    if let Some(max) = options.max_connections.or(section.max_connections) {
        if max == 0 {
            return Err(ConfigError::Invalid {
                field: "max_connections",
                message: "must be greater than zero".into(),
            });
        }
        config = config.with_max_connections(max);
    }
    if let Some(ms) = options.idle_timeout_ms.or(section.idle_timeout_ms) {
        config = config.with_idle_timeout(Duration::from_millis(ms));
    }
    Ok(config)
}

/// Splits a `user:password` entry at the first colon.
pub fn parse_user(entry: &str) -> ConfigResult<(&str, &str)> {
    match entry.split_once(':') {
        Some((user, password)) if !user.is_empty() => Ok((user, password)),
        _ => Err(ConfigError::Invalid {
            field: "user",
            message: format!("expected `user:password`, got `{entry}`"),
        }),
    }
}
