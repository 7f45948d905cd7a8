use std::path::PathBuf;
use clap::{Parser, Subcommand};
use opal::{MetaInfo, Torrent, TorrentConfig};

#[derive(Parser)]
#[command(name = "opal", version, about = "A single-torrent BitTorrent leech client")]
struct Cli {

    /// Print debug-level output.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,

}

#[derive(Subcommand)]
enum Command {

    /// Download the contents of a .torrent file.
    Download {
        /// Path to the .torrent file to download.
        torrent_file: PathBuf,
        /// Directory the downloaded content is placed in.
        destination: PathBuf,
    },

}

#[tokio::main]
async fn main() {

    let cli = Cli::parse();

    // Set up logging.
    let level = if cli.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    let sub = tracing_subscriber::fmt()
        .with_max_level(level)
        .finish();
    tracing::subscriber::set_global_default(sub).expect("failed to set tracing subscriber");

    match cli.command {
        Command::Download { torrent_file, destination } => {
            if let Err(e) = download(torrent_file, destination).await {
                tracing::error!("{}", e);
                std::process::exit(1);
            }
        }
    }
}

async fn download(torrent_file: PathBuf, destination: PathBuf) -> Result<(), Box<dyn std::error::Error>> {

    let metainfo = MetaInfo::new(&torrent_file)?;
    tracing::info!(
        "downloading {} ({}) to {:?}",
        metainfo.name(),
        metainfo.size_fmt(),
        destination,
    );

    let config = TorrentConfig {
        output_dir: destination,
        ..TorrentConfig::default()
    };
    let mut torrent = Torrent::new(metainfo, config)?;
    torrent.start().await?;
    Ok(())
}
