//! CLI command implementations

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Subcommand;
use shoal_core::ShoalError;
use shoal_core::config::ShoalConfig;
use shoal_core::torrent::{
    BencodeTorrentParser, HttpTrackerClient, Session, SessionProgress, TorrentParser,
};
use tokio::net::TcpListener;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Download a torrent and exit when every piece is on disk
    Download {
        /// Path to the .torrent file
        torrent: PathBuf,
        /// Output directory for downloaded files
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Port announced to the tracker
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Print the contents of a torrent file
    Info {
        /// Path to the .torrent file
        torrent: PathBuf,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns the error of the command that failed
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Download {
            torrent,
            output,
            port,
        } => download(&torrent, output, port).await,
        Commands::Info { torrent } => show_info(&torrent).await,
    }
}

/// Download a torrent until complete or interrupted with Ctrl+C
///
/// # Errors
/// - `ShoalError::Torrent` - Parsing, tracker or session start failed
/// - `ShoalError::Io` - Listen port could not be bound
pub async fn download(
    torrent: &Path,
    output: Option<PathBuf>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let mut config = ShoalConfig::from_env();
    if let Some(output) = output {
        config.storage.download_dir = output;
    }
    if let Some(port) = port {
        config.network.listen_port = port;
    }

    let listener = TcpListener::bind(("0.0.0.0", config.network.listen_port))
        .await
        .map_err(ShoalError::from)
        .with_context(|| format!("binding port {}", config.network.listen_port))?;
    let accept_task = tokio::spawn(refuse_inbound(listener));

    let tracker = HttpTrackerClient::new(&config.network).map_err(ShoalError::from)?;
    let session = Session::prepare(config, torrent, &BencodeTorrentParser::new(), &tracker)
        .await
        .map_err(ShoalError::from)?;

    println!(
        "Downloading {} ({} peers)",
        session.metadata().name,
        session.registry().len()
    );
    session.start().await.map_err(ShoalError::from)?;

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let outcome = {
        let completion = session.wait_for_completion();
        tokio::pin!(completion);
        loop {
            tokio::select! {
                result = &mut completion => break result.map(|()| true),
                _ = tokio::signal::ctrl_c() => break Ok(false),
                _ = ticker.tick() => print_progress(session.progress()),
            }
        }
    };

    session.stop().await;
    accept_task.abort();

    match outcome.map_err(ShoalError::from)? {
        true => println!("Download complete: {}", session.metadata().name),
        false => {
            let progress = session.progress();
            println!(
                "Interrupted at {}/{} pieces",
                progress.completed_pieces, progress.total_pieces
            );
        }
    }
    Ok(())
}

/// Print the metadata of a torrent file
///
/// # Errors
/// - `ShoalError::Torrent` - Torrent file could not be read or parsed
pub async fn show_info(torrent: &Path) -> anyhow::Result<()> {
    let metadata = BencodeTorrentParser::new()
        .parse_torrent_file(torrent)
        .await
        .map_err(ShoalError::from)?;

    println!("Name:         {}", metadata.name);
    println!("Info hash:    {}", metadata.info_hash);
    println!("Total size:   {} bytes", metadata.total_length);
    println!(
        "Pieces:       {} x {} bytes",
        metadata.piece_count(),
        metadata.piece_length
    );
    for url in &metadata.announce_urls {
        println!("Tracker:      {url}");
    }
    if metadata.multi_file {
        println!("Files:");
        for file in &metadata.files {
            println!("  {} ({} bytes)", file.path.join("/"), file.length);
        }
    }
    Ok(())
}

fn print_progress(progress: SessionProgress) {
    println!(
        "{:>5.1}%  {}/{} pieces  {} peers",
        progress.ratio() * 100.0,
        progress.completed_pieces,
        progress.total_pieces,
        progress.connected_peers
    );
}

/// Accepts inbound peers and closes them; this client does not seed.
async fn refuse_inbound(listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((_, address)) => tracing::debug!("Dropping inbound connection from {}", address),
            Err(e) => {
                tracing::warn!("Listener stopped: {}", e);
                return;
            }
        }
    }
}
