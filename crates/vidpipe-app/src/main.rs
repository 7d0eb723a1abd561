//! vidpipe - headless video player
//!
//! Plays a file (or a synthetic test pattern) through the decode pipeline
//! into an in-memory surface and reports playback metrics.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vidpipe_core::{BufferLedger, PlaybackConfig};
use vidpipe_media::PatternSpec;
use vidpipe_playback::{MemorySurface, PlaybackCallbacks, PlaybackScheduler, PlaybackStatus};

#[derive(Parser)]
#[command(name = "vidpipe", version, about = "Parallel-decode video player")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Play a video into an offscreen surface
    Play(PlayArgs),
    /// Print stream metadata as JSON
    Probe {
        path: PathBuf,
    },
}

#[derive(Args)]
struct PlayArgs {
    /// Video file to play; ignored with --pattern
    path: Option<PathBuf>,

    /// Play a synthetic pattern instead, e.g. 640x360@300
    #[arg(long)]
    pattern: Option<PatternSpec>,

    /// Seconds of playback before disposing
    #[arg(long, default_value_t = 5.0)]
    seconds: f64,

    /// Presentation rate override
    #[arg(long)]
    fps: Option<f64>,

    /// JSON playback configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Frame to seek to before playing
    #[arg(long)]
    seek: Option<usize>,

    /// Stop at the last frame instead of wrapping
    #[arg(long)]
    no_loop: bool,

    /// Print final metrics as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Play(args) => play(args),
        Command::Probe { path } => {
            let info = vidpipe_media::ffmpeg::probe(&path)?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(())
        }
    }
}

fn play(args: PlayArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => PlaybackConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PlaybackConfig::default(),
    };
    if args.fps.is_some() {
        config.target_fps = args.fps;
    }
    if args.no_loop {
        config.looping = false;
    }
    if !args.seconds.is_finite() || args.seconds < 0.0 {
        bail!("--seconds must be a non-negative number");
    }

    let errors = Arc::new(AtomicUsize::new(0));
    let callbacks = {
        let errors = Arc::clone(&errors);
        PlaybackCallbacks::new().on_error(move |message| {
            errors.fetch_add(1, Ordering::Relaxed);
            warn!("Playback error: {message}");
        })
    };

    let ledger = BufferLedger::new();
    let surface = MemorySurface::matching_stream();
    let mut scheduler = PlaybackScheduler::new(config, Box::new(surface.clone()), callbacks)?
        .with_ledger(ledger.clone());

    let path = match (args.pattern, args.path) {
        (Some(spec), _) => {
            scheduler = scheduler.with_opener(spec.opener(Default::default()));
            PathBuf::from("pattern")
        }
        (None, Some(path)) => path,
        (None, None) => bail!("either a path or --pattern is required"),
    };

    info!("vidpipe starting...");
    if !scheduler.load_video(&path) {
        bail!("failed to load {}", path.display());
    }
    if let Some(frame) = args.seek {
        scheduler.seek(frame)?;
    }
    scheduler.play()?;
    scheduler.run_for(Duration::from_secs_f64(args.seconds));

    let metrics = scheduler.performance_metrics();
    let final_frame = scheduler.current_frame();
    let status = scheduler.status();
    scheduler.dispose();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&metrics)?);
    } else {
        info!(
            frame = final_frame,
            %status,
            fps = %format!("{:.1}", metrics.fps),
            presented = metrics.frames_presented,
            underruns = metrics.underruns,
            "Playback finished"
        );
    }

    let live = ledger.live();
    if live != 0 {
        warn!(live, "Pixel buffers still alive after dispose");
    }
    if status == PlaybackStatus::Idle || errors.load(Ordering::Relaxed) > 0 {
        bail!("playback stopped on error");
    }
    Ok(())
}
