//! warpcue - mesh-warped cue playback for concave projection surfaces
//!
//! Plays a list of video cues on a projector, bending every frame through a
//! user-edited control-point mesh so the picture lands undistorted on a
//! curved screen. The mesh is edited and cues are fired through an HTTP API.

mod config;
mod editor;
mod error;
mod frame;
mod history;
mod mesh;
mod output;
mod playback;
mod player;
mod playlist;
mod server;
mod session;
mod store;
mod warp;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::session::Session;
use crate::store::FileBlobStore;

/// warpcue - projection mesh warping and cue playback
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Web server port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory for the stored mesh and playlist (overrides config)
    #[arg(short, long)]
    storage: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("warpcue v{}", env!("CARGO_PKG_VERSION"));

    // Load or create configuration, CLI args override
    let mut config = config::Config::load_or_create(&args.config)?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(dir) = args.storage {
        config.storage.dir = dir;
    }

    info!(
        "Output: {}x{} @ {}fps",
        config.output.width, config.output.height, config.output.fps
    );
    let store = FileBlobStore::new(&config.storage.dir);
    info!("Storage: {:?} (autosave {})", store.dir(), config.storage.autosave);
    let session = Session::load(Box::new(store), config.session_settings())
        .context("Invalid default mesh in [mesh] config")?;
    if !session.is_persistent() {
        tracing::warn!("Storage unavailable, changes will not survive a restart");
    }

    let state = Arc::new(server::AppState::new(
        session,
        config.output.clone(),
        config.warp,
    ));

    // Start the render loop
    let render_state = state.clone();
    let mut render_handle =
        tokio::task::spawn_blocking(move || player::run_render_loop(render_state));

    // Start the web server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Starting web server at http://{}", addr);

    let server_state = state.clone();
    let server_handle = tokio::spawn(async move { server::run_server(&addr, server_state).await });

    // Wait for either to finish (or error), or for Ctrl-C
    tokio::select! {
        result = &mut render_handle => {
            match result {
                Ok(Ok(())) => info!("Render loop exited normally"),
                Ok(Err(e)) => tracing::error!("Render loop error: {}", e),
                Err(e) => tracing::error!("Render loop task panicked: {}", e),
            }
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => tracing::error!("Server error: {}", e),
                Err(e) => tracing::error!("Server task panicked: {}", e),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
    }

    state.shutdown();
    if !render_handle.is_finished() {
        let _ = render_handle.await;
    }

    if config.storage.autosave {
        if let Err(e) = state.session.lock().save() {
            tracing::error!("Final save failed: {}", e);
        }
    }

    Ok(())
}
