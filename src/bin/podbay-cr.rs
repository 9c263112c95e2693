//! podbay-cr: checkpoint/restore control-plane client.
//!
//! Drives the daemon core directly against its state roots: loads the
//! persisted entities, then checkpoints or restores the requested
//! containers. Successful ids are printed as they complete; the first
//! failure stops processing and sets a non-zero exit code, preserving
//! the ids already printed.
//!
//! ```sh
//! podbay-cr checkpoint --export /tmp/redis.tar.zst --leave-running c3f2
//! podbay-cr restore --import /tmp/redis.tar.zst --pod 9a1b
//! ```

use clap::{Parser, Subcommand};
use podbay::{CheckpointOptions, Compression, Config, ContainerServer, RestoreRequest};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "podbay-cr",
    version,
    about = "Trigger container checkpoints or restores"
)]
struct Cli {
    /// Persistent state root of the daemon.
    #[arg(long, default_value = podbay::constants::DEFAULT_ROOT)]
    root: PathBuf,

    /// Runtime state root of the daemon.
    #[arg(long, default_value = podbay::constants::DEFAULT_RUN_ROOT)]
    run_root: PathBuf,

    /// Enable debug output.
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Checkpoints one or more containers.
    Checkpoint {
        /// Name of the tar archive used to export the checkpoint image.
        #[arg(short = 'e', long)]
        export: Option<PathBuf>,

        /// Keep all temporary checkpoint files.
        #[arg(short, long)]
        keep: bool,

        /// Leave the container running after writing the checkpoint.
        #[arg(short = 'R', long)]
        leave_running: bool,

        /// Checkpoint a container with established TCP connections.
        #[arg(long)]
        tcp_established: bool,

        /// Compression algorithm (gzip, none, zstd) for the archive.
        #[arg(short, long, default_value = "zstd")]
        compress: String,

        /// Container ids (full or unambiguous prefixes).
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Restores one or more containers.
    Restore {
        /// Restore from an exported checkpoint archive.
        #[arg(short, long)]
        import: Option<PathBuf>,

        /// Keep all temporary checkpoint and restore files.
        #[arg(short, long)]
        keep: bool,

        /// Pod to restore into. Defaults to the pod recorded in the
        /// checkpoint.
        #[arg(short, long)]
        pod: Option<String>,

        /// Restore a container with established TCP connections.
        #[arg(long)]
        tcp_established: bool,

        /// Container ids to restore from existing staging directories.
        ids: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("podbay-cr: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> podbay::Result<()> {
    let config = Config::with_roots(cli.root.clone(), cli.run_root.clone());
    let server = ContainerServer::new(config)?;
    server.load_state().await?;

    match cli.command {
        Command::Checkpoint {
            export,
            keep,
            leave_running,
            tcp_established,
            compress,
            ids,
        } => {
            let compression: Compression = compress.parse()?;
            for id in ids {
                let opts = CheckpointOptions {
                    leave_running,
                    keep,
                    tcp_established,
                    allow_stopped: false,
                    archive: export.clone(),
                    compression,
                };
                let checkpointed = server.checkpoint_container(&id, opts).await?;
                println!("{checkpointed}");
            }
        }
        Command::Restore {
            import,
            keep,
            pod,
            tcp_established,
            ids,
        } => {
            // With no ids, a lone --import restores the archive once.
            let sources: Vec<Option<String>> = if ids.is_empty() {
                if import.is_none() {
                    return Err(podbay::Error::InvalidArgument(
                        "restore needs --import or container ids".to_string(),
                    ));
                }
                vec![None]
            } else {
                ids.into_iter().map(Some).collect()
            };

            let mut results = Vec::new();
            for source in sources {
                let req = RestoreRequest {
                    container_id: source,
                    archive: import.clone(),
                    pod: pod.clone(),
                    name: None,
                    keep,
                    tcp_established,
                };
                let result = server.restore_container(req).await?;
                println!("{}", result.id);
                results.push(result);
            }
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
    }

    server.shutdown();
    Ok(())
}
