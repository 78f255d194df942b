//! Patchup CLI - keep a text file in sync with a patch server.

use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use patchup::chain::chain_filename;
use patchup::identity::random_username;
use patchup::{ChainStore, Client, Config, Identity, PatchUpReport, SyncReport};

/// Patchup - text file synchronization through verifiable patch chains
#[derive(Parser)]
#[command(name = "patchup")]
#[command(version)]
#[command(about = "Keep a text file in sync by exchanging patches")]
#[command(long_about = None)]
struct Cli {
    /// Directory holding configuration, identity and patch chains
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log debug output
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Server and user, remembered for later invocations once given.
#[derive(Args)]
struct ClientArgs {
    /// Server address, e.g. http://localhost:8002
    #[arg(short, long)]
    server: Option<String>,

    /// Username recorded in a newly created identity
    #[arg(short, long)]
    user: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Record the current content of a file and push it to the server
    Up {
        /// File to patch up
        #[arg(required = true)]
        file: PathBuf,

        #[command(flatten)]
        client: ClientArgs,
    },

    /// Exchange missing patches with the server without creating one
    Sync {
        /// File whose chain to synchronize
        #[arg(required = true)]
        file: PathBuf,

        #[command(flatten)]
        client: ClientArgs,
    },

    /// Reconstruct a file from the local chain
    Rebuild {
        /// File whose chain to replay
        #[arg(required = true)]
        file: PathBuf,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Compare a file with the server's reconstruction
    Status {
        /// File to check
        #[arg(required = true)]
        file: PathBuf,

        #[command(flatten)]
        client: ClientArgs,
    },

    /// Run the patch server
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind
        #[arg(short, long)]
        bind: Option<IpAddr>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(debug: bool) {
    let default = if debug { "patchup=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => Config::default_data_dir()?,
    };
    let mut config = Config::load(&data_dir)?;

    match cli.command {
        Commands::Up { file, client } => {
            remember(&mut config, client)?;
            let report = Client::connect(&config)?.patch_up(&file).await?;
            print_patch_up(&report);
            Ok(())
        }
        Commands::Sync { file, client } => {
            remember(&mut config, client)?;
            let filename = chain_filename(&file)?;
            let report = Client::connect(&config)?.sync(&filename).await?;
            print_sync(&filename, &report);
            Ok(())
        }
        Commands::Rebuild { file, output } => run_rebuild(&config, &file, output.as_deref()),
        Commands::Status { file, client } => {
            remember(&mut config, client)?;
            let status = Client::connect(&config)?.status(&file).await?;
            println!("local:  {}", status.local);
            println!("remote: {}", status.remote);
            if status.up_to_date() {
                println!("up to date");
            } else {
                println!("out of date, run `patchup up {}`", file.display());
            }
            Ok(())
        }
        Commands::Serve { port, bind } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(bind) = bind {
                config.server.bind_addr = bind;
            }
            patchup::server::serve(&config).await?;
            Ok(())
        }
    }
}

/// Merge command line client settings into the config and persist them.
fn remember(config: &mut Config, args: ClientArgs) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(server) = args.server {
        config.client.server_address = Some(server);
    }
    if let Some(user) = args.user {
        config.client.username = Some(user);
    }
    if config.client.username.is_none() {
        let username = random_username();
        info!("no username configured, using {username}");
        config.client.username = Some(username);
    }
    config.save()?;
    Ok(())
}

fn run_rebuild(
    config: &Config,
    file: &Path,
    output: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let filename = chain_filename(file)?;
    let identity = Identity::load(&config.identity_path())?;
    let store = ChainStore::new(config.client_store_dir());
    let rebuilt = config.rebuilder().rebuild(&store, &identity.id(), &filename)?;
    info!(
        patches = rebuilt.patches,
        mismatches = rebuilt.mismatches.len(),
        hash = %rebuilt.hash,
        "rebuilt {filename}"
    );

    match output {
        Some(path) => std::fs::write(path, &rebuilt.text)?,
        None => std::io::stdout().write_all(rebuilt.text.as_bytes())?,
    }
    Ok(())
}

fn print_patch_up(report: &PatchUpReport) {
    match (&report.created, &report.stats) {
        (Some(patch), Some(stats)) => println!(
            "{}: patch {} created (+{} -{} lines in {} hunks), {} uploaded",
            report.filename,
            patch.timestamp,
            stats.inserted,
            stats.deleted,
            stats.hunks,
            report.pushed.uploaded.len()
        ),
        _ => println!("{}: up to date ({})", report.filename, report.hash.short()),
    }
    if !report.pushed.failed.is_empty() || !report.pulled.failed.is_empty() {
        println!(
            "{}: {} transfers failed, run `patchup sync` to retry",
            report.filename,
            report.pushed.failed.len() + report.pulled.failed.len()
        );
    }
}

fn print_sync(filename: &str, report: &SyncReport) {
    println!(
        "{filename}: {} uploaded, {} downloaded, {} failed",
        report.uploaded.len(),
        report.downloaded.len(),
        report.failed.len()
    );
}
