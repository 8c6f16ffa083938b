//! tailsync command-line tool.
//!
//! Ships a growing local file to a remote store (`push`), mirrors a remote
//! file locally (`pull`), runs the store itself (`serve`), and inspects
//! watermark records (`offset`).

use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use config::{FileConfig, LoopOptions, PullOptions, PushOptions, RemoteOptions, ServeOptions};

#[derive(Parser)]
#[command(name = "tailsync")]
#[command(author, version, about = "Incremental file sync over a remote store", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    /// JSON file with default settings
    #[arg(global = true, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload new bytes of a local file to the remote store
    Push {
        /// Local file to ship
        #[arg(long)]
        local: Option<PathBuf>,

        /// Destination path on the remote store
        #[arg(long)]
        remote_path: Option<String>,

        /// Watermark record file
        #[arg(long)]
        watermark: Option<PathBuf>,

        /// Append a timestamped line to the local file each cycle
        #[arg(long)]
        heartbeat: bool,

        /// Stage extracted bytes in a temp file under this directory
        #[arg(long, value_name = "DIR")]
        staging_dir: Option<PathBuf>,

        #[command(flatten)]
        remote: RemoteArgs,

        #[command(flatten)]
        pacing: LoopArgs,
    },

    /// Download new bytes of a remote file into a local file
    Pull {
        /// Local mirror file
        #[arg(long)]
        local: Option<PathBuf>,

        /// Source path on the remote store
        #[arg(long)]
        remote_path: Option<String>,

        /// Watermark record file
        #[arg(long)]
        watermark: Option<PathBuf>,

        /// Always fetch the whole remote file and skip the known prefix
        #[arg(long)]
        no_range_reads: bool,

        /// Cut the local file back to the watermark on startup
        #[arg(long)]
        truncate_on_resume: bool,

        #[command(flatten)]
        remote: RemoteArgs,

        #[command(flatten)]
        pacing: LoopArgs,
    },

    /// Run the remote store
    Serve {
        /// Address to listen on
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Directory holding stored files
        #[arg(long)]
        root: Option<PathBuf>,

        /// Accepted login, repeatable
        #[arg(long = "user", value_name = "USER:PASSWORD")]
        users: Vec<String>,

        /// Maximum concurrent sessions
        #[arg(long)]
        max_connections: Option<usize>,

        /// Close sessions idle this long; 0 keeps them open
        #[arg(long)]
        idle_timeout_ms: Option<u64>,
    },

    /// Inspect or override a watermark record
    Offset {
        #[command(subcommand)]
        action: OffsetAction,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum OffsetAction {
    /// Print the stored offset
    Show {
        /// Watermark record file
        file: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Replace the stored offset
    Set {
        /// Watermark record file
        file: PathBuf,

        /// New offset
        value: u64,
    },
}

#[derive(Args)]
struct RemoteArgs {
    /// Remote store address (host:port)
    #[arg(long, env = "TAILSYNC_ADDRESS")]
    address: Option<String>,

    /// Login user
    #[arg(long, env = "TAILSYNC_USER")]
    user: Option<String>,

    /// Login password
    #[arg(long, env = "TAILSYNC_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Connect timeout in milliseconds
    #[arg(long)]
    connect_timeout_ms: Option<u64>,

    /// Per-operation timeout in milliseconds (0 disables it)
    #[arg(long)]
    io_timeout_ms: Option<u64>,
}

impl From<RemoteArgs> for RemoteOptions {
    fn from(args: RemoteArgs) -> Self {
        Self {
            address: args.address,
            user: args.user,
            password: args.password,
            connect_timeout_ms: args.connect_timeout_ms,
            io_timeout_ms: args.io_timeout_ms,
        }
    }
}

#[derive(Args)]
struct LoopArgs {
    /// Pause between cycles in milliseconds
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Stop after this many cycles
    #[arg(long)]
    max_cycles: Option<u64>,

    /// Rebuild the loop up to this many times after a network failure
    #[arg(long)]
    restart_attempts: Option<u32>,
}

impl From<LoopArgs> for LoopOptions {
    fn from(args: LoopArgs) -> Self {
        Self {
            interval_ms: args.interval_ms,
            max_cycles: args.max_cycles,
            restart_attempts: args.restart_attempts,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let result = dispatch(cli);
    if let Err(e) = &result {
        error!("{e}");
    }
    result
}

fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let file = FileConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Push {
            local,
            remote_path,
            watermark,
            heartbeat,
            staging_dir,
            remote,
            pacing,
        } => {
            let loop_settings = config::resolve_loop(pacing.into(), &file);
            let remote = config::resolve_remote(&remote.into(), &file)?;
            let options = PushOptions {
                local,
                remote_path,
                watermark,
                heartbeat,
                staging_dir,
            };
            let settings = config::resolve_push(options, &file)?;
            commands::push::run(settings, loop_settings, remote)
        }
        Commands::Pull {
            local,
            remote_path,
            watermark,
            no_range_reads,
            truncate_on_resume,
            remote,
            pacing,
        } => {
            let loop_settings = config::resolve_loop(pacing.into(), &file);
            let remote = config::resolve_remote(&remote.into(), &file)?;
            let options = PullOptions {
                local,
                remote_path,
                watermark,
                no_range_reads,
                truncate_on_resume,
            };
            let settings = config::resolve_pull(options, &file)?;
            commands::pull::run(settings, loop_settings, remote)
        }
        Commands::Serve {
            bind,
            root,
            users,
            max_connections,
            idle_timeout_ms,
        } => {
            let options = ServeOptions {
                bind,
                root,
                users,
                max_connections,
                idle_timeout_ms,
            };
            commands::serve::run(config::resolve_serve(options, &file)?)
        }
        Commands::Offset { action } => match action {
            OffsetAction::Show { file: path, json } => commands::offset::show(&path, json),
            OffsetAction::Set { file: path, value } => commands::offset::set(&path, value),
        },
        Commands::Version => {
            println!("tailsync {}", env!("CARGO_PKG_VERSION"));
            println!("Wire protocol version: {}", tailsync_protocol::PROTOCOL_VERSION);
            Ok(())
        }
    }
}
