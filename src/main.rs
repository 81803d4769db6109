use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use color_eyre::eyre::eyre;
use tokio::sync::broadcast::error::RecvError;
use trackplayer::{
    BackendKind, FileSettings, PlayerEvent, SettingsStore, Track, TrackPlayer, TrackSource,
    util::{hook::set_panic_hook, log::initialize_logging},
};

/// Plays one track through the configured backend.
#[derive(Parser, Debug)]
#[command(name = "trackplayer", version, about)]
struct Cli {
    /// File path or http(s) URL.
    url: String,

    /// `in-process` or `external-process`.
    #[arg(long, env = "TRACKPLAYER_BACKEND")]
    backend: Option<BackendKind>,

    /// Path to the mpv binary for the external backend.
    #[arg(long, env = "TRACKPLAYER_MPV")]
    binary: Option<PathBuf>,

    #[arg(long)]
    volume: Option<f32>,

    #[arg(long)]
    speed: Option<f32>,

    /// Start position in seconds.
    #[arg(long)]
    seek: Option<f64>,

    /// Settings file, defaults to the user config directory.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> color_eyre::Result<()> {
    setup()?;
    let cli = Cli::parse();

    let path = match cli.config.clone() {
        Some(path) => path,
        None => FileSettings::default_path().ok_or_else(|| eyre!("no config directory"))?,
    };
    let settings = Arc::new(FileSettings::open(path));

    let mut config = settings.load();
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }
    if let Some(binary) = cli.binary.clone() {
        config.external.binary_path = Some(binary);
    }
    if let Some(volume) = cli.volume {
        config.volume = volume;
    }
    if let Some(speed) = cli.speed {
        config.speed = speed;
    }

    let player = TrackPlayer::new(config, settings)?;
    let mut events = player.subscribe();

    player.initialize().await?;
    player
        .load(TrackSource::new(cli.url.clone()), Track::new(cli.url.clone()))
        .await;
    player.play().await?;
    if let Some(seconds) = cli.seek {
        player.seek(seconds).await?;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(PlayerEvent::Ended) => {
                    println!("ended");
                    break;
                }
                Ok(event) if event.is_terminal_error() => {
                    eprintln!("{event:?}");
                    break;
                }
                Ok(PlayerEvent::Progress(progress)) => match progress.finite_duration() {
                    Some(duration) => println!("{:.1}/{:.1}s", progress.current_time, duration),
                    None => println!("{:.1}s", progress.current_time),
                },
                Ok(PlayerEvent::Error(e)) => eprintln!("error: {e}"),
                Ok(event) => println!("{event:?}"),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
        }
    }

    player.destroy().await;
    Ok(())
}

fn setup() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenv::dotenv().ok();
    set_panic_hook();
    initialize_logging()
}
