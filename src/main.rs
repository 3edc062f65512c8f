//! remote-worker - command-line driver for the recording engine
//!
//! Subcommands:
//! - `remote-worker record -o <file>` - Record until `stop` or EOF on stdin
//! - `remote-worker screenshot` - Take one screenshot now
//! - `remote-worker sessions` - List working directories left by failed merges
//! - `remote-worker recover <work_dir> -o <file>` - Merge a preserved session
//! - `remote-worker check` - Verify the FFmpeg binary
//! - `remote-worker config` - Print the effective configuration

use anyhow::{bail, Context, Result};
use app_lib::collector::Collaborators;
use app_lib::recording::capture::CaptureDevice;
use app_lib::recording::config::{config_path, load_config, load_config_from};
use app_lib::recording::encoder::FfmpegEncoder;
use app_lib::recording::ffmpeg::{ffmpeg_platform_info, FfmpegBinary};
use app_lib::recording::screenshot::Screenshotter;
use app_lib::recording::segment::merge_files;
use app_lib::recording::storage::{
    directory_size, list_segment_files, normalize_output_path, recoverable_sessions,
    remove_work_dir, SEGMENT_MANIFEST,
};
use app_lib::{CaptureMode, RecordingConfig, RecordingController};
use clap::{Parser, Subcommand};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "remote-worker")]
#[command(about = "Screen recording engine for the Remote Worker client")]
#[command(version)]
struct Cli {
    /// Config file (defaults to the per-user config location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record the screen, reading pause/resume/segment/shot/status/stop from stdin
    Record {
        /// Output video file
        #[arg(short, long)]
        output: PathBuf,

        /// User id for screenshot uploads and activity events
        #[arg(short, long)]
        user: Option<String>,

        /// Override the configured frame rate
        #[arg(long)]
        fps: Option<u8>,

        /// Capture PNG frames and encode each segment at close
        #[arg(long)]
        frames: bool,
    },

    /// Take a single screenshot
    Screenshot {
        /// Directory to write into
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// User id for upload and activity events
        #[arg(short, long)]
        user: Option<String>,
    },

    /// List session directories kept after a failed merge
    Sessions,

    /// Merge the segments of a preserved session directory
    Recover {
        /// Session working directory
        work_dir: PathBuf,

        /// Output video file
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Check that FFmpeg can be found and run
    Check,

    /// Print the effective configuration
    Config,
}

fn load(path: Option<&Path>) -> Result<RecordingConfig> {
    let config = match path {
        Some(path) => load_config_from(path),
        None => load_config(),
    };
    config.context("Failed to load recording config")
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load(cli.config.as_deref())?;

    match cli.command {
        Commands::Record {
            output,
            user,
            fps,
            frames,
        } => record(config, output, user, fps, frames),
        Commands::Screenshot { dir, user } => screenshot(config, dir, user),
        Commands::Sessions => sessions(&config),
        Commands::Recover { work_dir, output } => recover(&config, &work_dir, &output),
        Commands::Check => check(&config),
        Commands::Config => {
            let path = match cli.config {
                Some(path) => path,
                None => config_path()?,
            };
            eprintln!("# {}", path.display());
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

// =============================================================================
// Commands
// =============================================================================

fn record(
    mut config: RecordingConfig,
    output: PathBuf,
    user: Option<String>,
    fps: Option<u8>,
    frames: bool,
) -> Result<()> {
    if let Some(fps) = fps {
        config.framerate = fps;
    }
    if frames {
        config.capture_mode = CaptureMode::Frames;
    }

    let collaborators = Collaborators::from_config(&config, user)?;
    let recorder = RecordingController::from_config(config, collaborators)?;
    let output = recorder.start(&output)?;
    eprintln!("Recording to {} (type 'stop' or close stdin to finish)", output.display());

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let result = match line.trim() {
            "" => continue,
            "pause" => recorder.pause(),
            "resume" => recorder.resume().map(|info| {
                eprintln!("Segment {} started", info.index);
            }),
            "segment" => recorder.new_segment().map(|info| {
                eprintln!("Segment {} started", info.index);
            }),
            "shot" => recorder.capture_now().map(|path| {
                eprintln!("Screenshot {}", path.display());
            }),
            "status" => {
                println!("{}", serde_json::to_string_pretty(&recorder.status())?);
                Ok(())
            }
            "stop" | "quit" => break,
            other => {
                eprintln!("Unknown command '{}'", other);
                Ok(())
            }
        };
        if let Err(e) = result {
            eprintln!("Error [{:?}]: {}", e.code(), e);
        }
    }

    match recorder.stop()? {
        Some(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        None => bail!("Recording was not running: {}", recorder.last_status()),
    }
}

fn screenshot(config: RecordingConfig, dir: Option<PathBuf>, user: Option<String>) -> Result<()> {
    let binary = FfmpegBinary::resolve(config.ffmpeg_path.as_deref());
    let device = Arc::new(CaptureDevice::from_config(&config, binary));
    let collaborators = Collaborators::from_config(&config, user)?;

    let mut shots = config.screenshots.clone();
    if dir.is_some() {
        shots.output_dir = dir;
    }

    let shooter = Screenshotter::from_config(device, &shots, &config.temp_root(), collaborators);
    let path = shooter.capture_now()?;
    println!("{}", path.display());
    Ok(())
}

fn sessions(config: &RecordingConfig) -> Result<()> {
    let found = recoverable_sessions(&config.temp_root());
    if found.is_empty() {
        eprintln!("No preserved sessions under {}", config.temp_root().display());
    }
    for dir in found {
        let segments = list_segment_files(&dir)?.len();
        println!(
            "{}\t{} segment(s)\t{} bytes",
            dir.display(),
            segments,
            directory_size(&dir)
        );
    }
    Ok(())
}

fn recover(config: &RecordingConfig, work_dir: &Path, output: &Path) -> Result<()> {
    let files: Vec<PathBuf> = list_segment_files(work_dir)
        .with_context(|| format!("Failed to read {}", work_dir.display()))?
        .into_iter()
        .map(|(_, path)| path)
        .collect();
    if files.is_empty() {
        bail!("No segment files in {}", work_dir.display());
    }

    let binary = FfmpegBinary::resolve(config.ffmpeg_path.as_deref());
    let encoder = FfmpegEncoder::from_config(config, binary);
    let output = normalize_output_path(output, &config.container);

    let report = merge_files(
        &encoder,
        &files,
        &work_dir.join(SEGMENT_MANIFEST),
        &output,
        Duration::from_secs(config.merge_timeout_seconds),
    )?;
    remove_work_dir(work_dir)?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn check(config: &RecordingConfig) -> Result<()> {
    let binary = FfmpegBinary::resolve(config.ffmpeg_path.as_deref());
    let (platform, _) = ffmpeg_platform_info();
    let version = binary
        .check()
        .with_context(|| format!("FFmpeg at {} is not usable", binary.path().display()))?;
    println!("ffmpeg {} at {} ({})", version, binary.path().display(), platform);
    Ok(())
}
