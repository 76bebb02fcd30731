//! trackfeed CLI
//!
//! Command-line interface for exercising the capture → adapt → schedule
//! pipeline against the in-process capture device.

use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use trackfeed::{
    adapter::{compute_geometry, ConstraintSet},
    capture::{FakeCaptureHost, SUPPORTED_PIXEL_FORMATS},
    config::{PipelineConfig, Preset, TrackConfig},
    scheduler::{BufferingState, PipelineStatistics},
    Error, Frame, FrameScheduler, Pipeline, Rect, RendererClient, Size, StartOutcome,
    TrackFrameStream, VideoCaptureFormat, VideoTrack, WallClockTimeSource,
};

#[derive(Parser)]
#[command(name = "trackfeed")]
#[command(about = "Video capture delivery pipeline - capture, adapt, schedule")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version and supported capture formats
    Info,

    /// List formats reported by the capture device
    Formats {
        /// Preset selecting the device mode
        #[arg(short, long, default_value = "vga30")]
        preset: String,
    },

    /// Print the geometry a constraint set produces for one frame size
    Adapt {
        /// Input frame size (e.g., 1280x720)
        #[arg(short, long)]
        input: Size,

        #[arg(long)]
        max_width: Option<u32>,

        #[arg(long)]
        max_height: Option<u32>,

        #[arg(long)]
        min_width: Option<u32>,

        #[arg(long)]
        min_height: Option<u32>,

        #[arg(long)]
        min_aspect: Option<f64>,

        #[arg(long)]
        max_aspect: Option<f64>,
    },

    /// Run the device through tracks and the scheduler, then print statistics
    Run {
        /// Configuration file (TOML)
        #[arg(short, long)]
        config: Option<std::path::PathBuf>,

        /// Preset to use when no configuration file is given
        #[arg(short, long)]
        preset: Option<String>,

        /// Seconds to run (Ctrl+C stops earlier)
        #[arg(short, long, default_value = "5")]
        seconds: u64,
    },

    /// List available presets
    Presets,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("trackfeed=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Info => cmd_info(),
        Commands::Formats { preset } => cmd_formats(preset).await,
        Commands::Adapt {
            input,
            max_width,
            max_height,
            min_width,
            min_height,
            min_aspect,
            max_aspect,
        } => {
            let constraints = ConstraintSet {
                max_width,
                max_height,
                min_width,
                min_height,
                min_aspect_ratio: min_aspect,
                max_aspect_ratio: max_aspect,
                max_frame_rate: None,
            };
            cmd_adapt(input, constraints)
        }
        Commands::Run {
            config,
            preset,
            seconds,
        } => cmd_run(config, preset, seconds).await,
        Commands::Presets => cmd_presets(),
    }
}

fn cmd_info() -> anyhow::Result<()> {
    println!("trackfeed {}", trackfeed::VERSION);
    println!("==============\n");

    println!("Capture pixel formats (shared memory):");
    for format in SUPPORTED_PIXEL_FORMATS {
        println!("  - {}", format);
    }
    println!(
        "\nDefault ready queue: {} frames",
        trackfeed::scheduler::MAX_VIDEO_FRAMES
    );
    println!(
        "Default source rate when unknown: {} fps",
        trackfeed::adapter::DEFAULT_FRAME_RATE
    );

    Ok(())
}

fn parse_preset(name: &str) -> anyhow::Result<Preset> {
    name.parse::<Preset>().map_err(|e| {
        anyhow::anyhow!("{e}. Use 'trackfeed presets' to see available presets.")
    })
}

fn device_format(config: &PipelineConfig) -> VideoCaptureFormat {
    config.capture.params().requested_format
}

async fn cmd_formats(preset: String) -> anyhow::Result<()> {
    let config = PipelineConfig::from_preset(parse_preset(&preset)?);
    let host = Arc::new(FakeCaptureHost::new(vec![device_format(&config)]));
    let pipeline = Pipeline::builder().host(host).config(&config).build()?;

    let (tx, rx) = tokio::sync::oneshot::channel();
    pipeline.supported_formats(move |formats| {
        let _ = tx.send(formats);
    });
    let formats = tokio::time::timeout(Duration::from_secs(2), rx).await??;

    println!("Device formats:");
    for format in formats {
        println!("  - {}", format);
    }
    Ok(())
}

fn cmd_adapt(input: Size, constraints: ConstraintSet) -> anyhow::Result<()> {
    constraints.validate()?;

    let visible = Rect::from_size(input);
    println!("Input:       {}", input);
    println!("Constraints: {}", constraints);
    match compute_geometry(visible, input, &constraints) {
        Some(geometry) => {
            println!("Visible:     {}", geometry.visible_rect);
            println!("Natural:     {}", geometry.natural_size);
        }
        None => println!("Unchanged (frame passed through)"),
    }
    Ok(())
}

/// Starts the clock when the scheduler has enough frames
struct ClockDriver {
    clock: Arc<WallClockTimeSource>,
    ended: Arc<tokio::sync::Notify>,
    stats: Mutex<PipelineStatistics>,
}

impl RendererClient for ClockDriver {
    fn on_buffering_state_change(&self, state: BufferingState) {
        match state {
            BufferingState::HaveEnough => self.clock.start_ticking(),
            BufferingState::HaveNothing => self.clock.stop_ticking(),
        }
    }

    fn on_ended(&self) {
        self.ended.notify_one();
    }

    fn on_error(&self, error: Error) {
        tracing::error!("Scheduler error: {}", error);
        self.ended.notify_one();
    }

    fn on_statistics_update(&self, stats: PipelineStatistics) {
        *self.stats.lock() = stats;
    }

    fn on_natural_size_change(&self, size: Size) {
        tracing::info!("Presented size is now {}", size);
    }
}

async fn cmd_run(
    config_path: Option<std::path::PathBuf>,
    preset: Option<String>,
    seconds: u64,
) -> anyhow::Result<()> {
    let mut config = match (config_path, preset) {
        (Some(path), _) => PipelineConfig::load(path)?,
        (None, Some(name)) => PipelineConfig::from_preset(parse_preset(&name)?),
        (None, None) => PipelineConfig::default(),
    };
    if config.tracks.is_empty() {
        config
            .tracks
            .push(TrackConfig::new("default", ConstraintSet::new()));
    }

    let host = Arc::new(FakeCaptureHost::producing(device_format(&config)));
    let pipeline = Pipeline::builder()
        .host(host.clone())
        .config(&config)
        .build()?;

    println!("Configuration:");
    println!(
        "  Capture: {} @ {}",
        config.capture.resolution, config.capture.framerate
    );
    for track in &config.tracks {
        println!("  Track {:<12} {}", track.name, track.constraints);
    }
    println!();

    let mut tracks: Vec<(String, VideoTrack)> = Vec::new();
    for track in &config.tracks {
        let name = track.name.clone();
        let handle = pipeline.add_track(track.constraints, move |outcome| match outcome {
            StartOutcome::Started => tracing::info!("Track {} started", name),
            StartOutcome::Failed { code, name: reason } => {
                tracing::error!("Track {} failed: {} ({})", name, code, reason)
            }
        })?;
        tracks.push((track.name.clone(), handle));
    }

    // The first track is presented
    let clock = Arc::new(WallClockTimeSource::new());
    let ended = Arc::new(tokio::sync::Notify::new());
    let driver = Arc::new(ClockDriver {
        clock: clock.clone(),
        ended: ended.clone(),
        stats: Mutex::new(PipelineStatistics::default()),
    });
    let painted = Arc::new(AtomicU64::new(0));
    let p = painted.clone();
    let scheduler = FrameScheduler::new(
        pipeline.context(),
        &config.scheduler,
        clock,
        driver.clone(),
        move |_frame: Frame| {
            p.fetch_add(1, Ordering::Relaxed);
        },
    );
    let (stream, sink) = TrackFrameStream::new(config.scheduler.max_ready_frames * 2);
    if let Some((_, track)) = tracks.first() {
        track.add_sink(sink);
    }
    scheduler.initialize(Box::new(stream))?;
    scheduler.start_playing_from(Duration::ZERO)?;

    println!("Running for {} s. Press Ctrl+C to stop.\n", seconds);
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
        _ = tokio::signal::ctrl_c() => println!("\nStopping..."),
        _ = ended.notified() => println!("Stream ended"),
    }

    scheduler.stop();
    let stats = pipeline.stats();
    let presented = *driver.stats.lock();

    println!("\nCapture:");
    println!("  Frames produced:  {}", host.frames_produced());
    println!("  Frames captured:  {}", stats.frames_captured);
    println!("  Buffers rejected: {}", stats.buffers_rejected);
    println!("  Buffers released: {}", stats.buffers_released);
    println!("  Frames delivered: {}", stats.frames_delivered);
    println!("  Adapter drops:    {}", stats.frames_dropped);

    println!("\nTracks:");
    for (name, track) in &tracks {
        println!(
            "  {:<12} {:>6} frames ({:?})",
            name,
            track.frames_received(),
            track.ready_state()
        );
    }

    println!("\nPresentation:");
    println!("  Frames painted:    {}", painted.load(Ordering::Relaxed));
    println!("  Frames dropped:    {}", presented.frames_dropped);
    println!(
        "  Background purged: {}",
        presented.frames_dropped_background
    );

    Ok(())
}

fn cmd_presets() -> anyhow::Result<()> {
    println!("Available Presets");
    println!("=================\n");

    let presets = [
        ("vga", Preset::Vga30, "640x480 @ 30 fps"),
        ("720p", Preset::Hd720p30, "1280x720 @ 30 fps"),
        ("720p60", Preset::Hd720p60, "1280x720 @ 60 fps"),
        ("1080p", Preset::FullHd1080p30, "1920x1080 @ 30 fps"),
    ];

    for (short, preset, description) in presets {
        println!("  {:<8} ({}) - {}", short, preset.name(), description);
    }

    println!("\nUsage: trackfeed run --preset <name>");

    Ok(())
}
