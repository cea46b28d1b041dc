use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing::error;

use regpack::artifacts;
use regpack::config::Settings;
use regpack::daemon::{self, DaemonState};
use regpack::logging;
use regpack::oci::Architecture;
use regpack::pipeline::{DownloadRequest, Downloader};
use regpack::progress::{BarProgressStore, ProgressReporter};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// Settings file (YAML or JSON)
    #[arg(long, global = true, env = "REGPACK_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for finished archives and working directories
    #[arg(long, global = true)]
    download_dir: Option<PathBuf>,

    /// Append-only pipeline log
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Registry base URL
    #[arg(long, global = true)]
    registry_url: Option<String>,

    /// Token service base URL
    #[arg(long, global = true)]
    auth_url: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Download an image and build a docker-load archive
    Pull {
        /// Image name, e.g. "alpine" or "grafana/grafana"
        name: String,
        /// Tag (defaults to the configured default tag)
        #[arg(long, short)]
        tag: Option<String>,
        /// Target architecture: amd64, arm64 or arm
        #[arg(long, short)]
        arch: Option<Architecture>,
    },
    /// List archives in the download directory
    List,
    /// Delete an archive from the download directory
    Rm {
        /// Archive file name, e.g. "alpine_latest_amd64.tar"
        file: String,
    },
    /// Run the HTTP daemon
    Serve {
        /// Bind address, e.g. 127.0.0.1:43100
        #[arg(long)]
        listen: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match load_settings(&cli) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{}", e.user_message());
            return ExitCode::FAILURE;
        }
    };

    // Dropping the guard stops the background log writer.
    let _log_guard = match logging::init(&settings.log_file) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    match run(cli.command, settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => code,
    }
}

fn load_settings(cli: &Cli) -> regpack::Result<Settings> {
    let mut settings = Settings::load(cli.global.config.as_deref())?;
    let g = &cli.global;
    if let Some(dir) = &g.download_dir {
        settings.download_dir = dir.clone();
    }
    if let Some(file) = &g.log_file {
        settings.log_file = file.clone();
    }
    if let Some(url) = &g.registry_url {
        settings.registry.url = url.clone();
    }
    if let Some(url) = &g.auth_url {
        settings.registry.auth_url = url.clone();
    }
    if let Commands::Serve {
        listen: Some(listen),
    } = &cli.command
    {
        settings.listen = listen.clone();
    }
    settings.validate()?;
    Ok(settings)
}

async fn run(command: Commands, settings: Settings) -> Result<(), ExitCode> {
    match command {
        Commands::Pull { name, tag, arch } => cmd_pull(name, tag, arch, &settings).await,
        Commands::List => cmd_list(&settings),
        Commands::Rm { file } => cmd_rm(&file, &settings),
        Commands::Serve { .. } => cmd_serve(&settings).await,
    }
}

async fn cmd_pull(
    name: String,
    tag: Option<String>,
    arch: Option<Architecture>,
    settings: &Settings,
) -> Result<(), ExitCode> {
    let downloader = Downloader::new(settings).map_err(|e| fail(e, settings))?;
    let request = DownloadRequest {
        name,
        tag,
        architecture: arch,
    };
    let reporter = ProgressReporter::new(Arc::new(BarProgressStore::new()), "cli");

    let report = downloader
        .download(&request, &reporter)
        .await
        .map_err(|e| fail(e, settings))?;

    println!(
        "{} ({:.2} MB)",
        report.archive_path.display(),
        report.archive_size as f64 / 1024.0 / 1024.0
    );
    let mismatched = report.mismatched_layers();
    if mismatched > 0 {
        println!(
            "warning: {} layer(s) did not match their diffID; see {}",
            mismatched,
            settings.log_file.display()
        );
    }
    Ok(())
}

fn cmd_list(settings: &Settings) -> Result<(), ExitCode> {
    let archives = artifacts::list_archives(&settings.download_dir).map_err(|e| fail(e, settings))?;
    if archives.is_empty() {
        println!("no archives in {}", settings.download_dir.display());
        return Ok(());
    }
    for a in archives {
        let modified = std::time::UNIX_EPOCH + std::time::Duration::from_millis(a.modified_ms);
        println!(
            "{:<48} {:>10.2} MB  {}",
            a.name,
            a.size as f64 / 1024.0 / 1024.0,
            humantime::format_rfc3339_seconds(modified)
        );
    }
    Ok(())
}

fn cmd_rm(file: &str, settings: &Settings) -> Result<(), ExitCode> {
    artifacts::delete_archive(&settings.download_dir, file).map_err(|e| fail(e, settings))?;
    println!("deleted {}", file);
    Ok(())
}

async fn cmd_serve(settings: &Settings) -> Result<(), ExitCode> {
    let addr = settings.listen_addr().map_err(|e| fail(e, settings))?;
    let state = DaemonState::new(settings).map_err(|e| fail(e, settings))?;
    daemon::serve(addr, state).await.map_err(|e| fail(e, settings))
}

fn fail(err: regpack::Error, settings: &Settings) -> ExitCode {
    error!(error = %err, "command failed");
    eprintln!("{}", err.user_message());
    eprintln!("log: {}", settings.log_file.display());
    ExitCode::FAILURE
}
