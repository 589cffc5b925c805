use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use track_downloader::{
    DownloadCoordinator, DownloadOutcome, DownloadRequest, DownloaderConfig, ProgressEvent,
    ProgressListener, TransferState,
};

#[derive(Parser)]
#[command(name = "track-downloader", about = "Download purchased tracks into a local cache")]
struct Cli {
    /// JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    #[arg(long, global = true)]
    catalog_url: Option<String>,

    #[arg(long, global = true)]
    billing_url: Option<String>,

    /// Seconds without data before a transfer fails
    #[arg(long, global = true)]
    idle_timeout: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download a track, or report where the cached copy lives
    Download {
        #[arg(long)]
        user: String,
        #[arg(long)]
        track: String,
        #[arg(long, default_value = "")]
        title: String,
        #[arg(long)]
        artist: Option<String>,
    },
    /// Show whether a track is downloaded
    Status {
        #[arg(long)]
        track: String,
    },
    /// Delete the local copy of a track
    Remove {
        #[arg(long)]
        track: String,
    },
    /// List downloaded tracks
    List,
    /// Delete the oldest downloads until the cache fits in the budget
    Evict {
        #[arg(long)]
        max_bytes: u64,
    },
}

impl Cli {
    fn load_config(&self) -> Result<DownloaderConfig, String> {
        let mut config = match &self.config {
            Some(path) => DownloaderConfig::from_file(path).map_err(|e| e.to_string())?,
            None => DownloaderConfig::default(),
        };
        if let Some(dir) = &self.cache_dir {
            config.cache_dir = dir.clone();
        }
        if let Some(url) = &self.catalog_url {
            config.catalog_base_url = url.clone();
        }
        if let Some(url) = &self.billing_url {
            config.billing_base_url = url.clone();
        }
        if let Some(secs) = self.idle_timeout {
            config.idle_timeout_secs = secs;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let coordinator = match cli
        .load_config()
        .and_then(|config| DownloadCoordinator::from_config(&config).map_err(|e| e.to_string()))
    {
        Ok(coordinator) => coordinator,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Command::Download {
            user,
            track,
            title,
            artist,
        } => {
            let mut request = DownloadRequest::new(user, track, title);
            request.artist_hint = artist;

            let listener: ProgressListener = Arc::new(|event: &ProgressEvent| {
                if let ProgressEvent::Progress(fraction) = event {
                    eprint!("\r{:>5.1}%", fraction * 100.0);
                }
            });

            match coordinator.request_download(request, Some(listener)).await {
                DownloadOutcome::Completed { path } => {
                    eprintln!();
                    println!("{}", path.display());
                    ExitCode::SUCCESS
                }
                DownloadOutcome::Failed { error } => {
                    eprintln!();
                    match error.reason_code().as_str() {
                        reason if reason.starts_with("entitlement:") => {
                            println!("{} ({})", error, reason);
                        }
                        reason => println!("Download failed, try again ({})", reason),
                    }
                    ExitCode::FAILURE
                }
            }
        }
        Command::Status { track } => {
            match coordinator.transfer_state(&track) {
                TransferState::Completed(path) => println!("downloaded: {}", path.display()),
                TransferState::Downloading(fraction) => {
                    println!("downloading: {:.1}%", fraction * 100.0)
                }
                TransferState::Failed(error) => println!("failed: {}", error.reason_code()),
                TransferState::Idle => println!("not downloaded"),
            }
            ExitCode::SUCCESS
        }
        Command::Remove { track } => {
            if coordinator.remove_download(&track) {
                println!("removed {}", track);
                ExitCode::SUCCESS
            } else {
                println!("{} is not downloaded", track);
                ExitCode::FAILURE
            }
        }
        Command::List => {
            for entry in coordinator.list_downloads() {
                println!(
                    "{}\t{}\t{}",
                    entry.key,
                    entry.size_bytes,
                    entry.local_path.display()
                );
            }
            ExitCode::SUCCESS
        }
        Command::Evict { max_bytes } => {
            for key in coordinator.evict_to_budget(max_bytes) {
                println!("evicted {}", key);
            }
            ExitCode::SUCCESS
        }
    }
}
