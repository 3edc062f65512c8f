/**
 * ============================================================================
 * RECORDING TYPES MODULE
 * ============================================================================
 *
 * PURPOSE: Data structures for the segmented screen recording engine
 *
 * TYPES:
 * - RecordingConfig: Capture, encoder and screenshot configuration
 * - RecordingState: Controller state machine states
 * - SegmentInfo: Snapshot of one recording segment
 * - CapturedFrame: One frame written by the frame capture loop
 * - MergeReport: Outcome of merging segments into the final output
 * - RecordingStatus: Status for UI display
 *
 * ============================================================================
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// How segment video is produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    // FFmpeg grabs the screen itself and encodes straight into the segment file
    #[default]
    Direct,
    // Frames are captured to PNG files and encoded when the segment closes
    Frames,
}

// Configuration for screen recording capture
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordingConfig {
    // Target framerate for recording (fps)
    #[serde(default = "default_framerate")]
    pub framerate: u8,

    // CRF quality (0-51, lower = better quality, higher = smaller files)
    #[serde(default = "default_crf")]
    pub crf: u8,

    // x264 preset; the low-latency presets keep up with live capture
    #[serde(default = "default_preset")]
    pub preset: String,

    #[serde(default)]
    pub capture_mode: CaptureMode,

    // Grab device override (x11 display, avfoundation index, gdigrab target)
    #[serde(default)]
    pub screen_device: Option<String>,

    // Optional "WxH" capture size passed to the grabber
    #[serde(default)]
    pub capture_size: Option<String>,

    // Output container extension
    #[serde(default = "default_container")]
    pub container: String,

    // Explicit FFmpeg binary; resolved from env/bundle/PATH when absent
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,

    // Root for per-session working directories
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,

    // How long a stopped encoder gets to exit before it is killed
    #[serde(default = "default_termination_timeout_ms")]
    pub termination_timeout_ms: u64,

    // Upper bound for merge and frame-encode runs
    #[serde(default = "default_merge_timeout_seconds")]
    pub merge_timeout_seconds: u64,

    // An encoder that exits within this window after launch counts as a failed launch
    #[serde(default = "default_launch_grace_ms")]
    pub launch_grace_ms: u64,

    #[serde(default)]
    pub screenshots: ScreenshotConfig,

    #[serde(default)]
    pub upload: UploadConfig,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            framerate: default_framerate(),
            crf: default_crf(),
            preset: default_preset(),
            capture_mode: CaptureMode::default(),
            screen_device: None,
            capture_size: None,
            container: default_container(),
            ffmpeg_path: None,
            temp_dir: None,
            termination_timeout_ms: default_termination_timeout_ms(),
            merge_timeout_seconds: default_merge_timeout_seconds(),
            launch_grace_ms: default_launch_grace_ms(),
            screenshots: ScreenshotConfig::default(),
            upload: UploadConfig::default(),
        }
    }
}

fn default_framerate() -> u8 {
    15
}

fn default_crf() -> u8 {
    23
}

fn default_preset() -> String {
    "ultrafast".to_string()
}

fn default_container() -> String {
    "mkv".to_string()
}

fn default_termination_timeout_ms() -> u64 {
    5_000
}

fn default_merge_timeout_seconds() -> u64 {
    300
}

fn default_launch_grace_ms() -> u64 {
    500
}

impl RecordingConfig {
    // Resolve the root directory for session working directories
    pub fn temp_root(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(crate::recording::storage::default_temp_root)
    }

    // Parse capture_size ("1920x1080") into dimensions
    pub fn screen_size(&self) -> Option<(u32, u32)> {
        let size = self.capture_size.as_deref()?;
        let (w, h) = size.split_once('x')?;
        Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
    }
}

// Periodic screenshot configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScreenshotConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    // Random interval bounds between captures (seconds)
    #[serde(default = "default_min_interval")]
    pub min_interval_secs: u64,
    #[serde(default = "default_max_interval")]
    pub max_interval_secs: u64,

    // Cancellation polling granularity while sleeping
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    // Local directory for screenshot files; temp root when absent
    #[serde(default)]
    pub output_dir: Option<PathBuf>,

    // Remote base directory; the user id is appended per upload
    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,
}

impl Default for ScreenshotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_interval_secs: default_min_interval(),
            max_interval_secs: default_max_interval(),
            poll_interval_ms: default_poll_interval_ms(),
            output_dir: None,
            remote_dir: default_remote_dir(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_min_interval() -> u64 {
    600
}

fn default_max_interval() -> u64 {
    1800
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_remote_dir() -> String {
    "/screenshots".to_string()
}

// Where captured screenshots are sent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UploadConfig {
    #[default]
    Disabled,
    Http {
        url: String,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
    },
    LocalCopy {
        root: PathBuf,
    },
}

// Controller state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordingState {
    Idle,
    Recording,
    Paused,
    Stopping,
    Stopped,
}

impl RecordingState {
    pub fn is_recording(self) -> bool {
        matches!(self, RecordingState::Recording | RecordingState::Paused)
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            RecordingState::Idle => 0,
            RecordingState::Recording => 1,
            RecordingState::Paused => 2,
            RecordingState::Stopping => 3,
            RecordingState::Stopped => 4,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => RecordingState::Recording,
            2 => RecordingState::Paused,
            3 => RecordingState::Stopping,
            4 => RecordingState::Stopped,
            _ => RecordingState::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentStatus {
    Active,
    Closed,
    Merged,
}

// Snapshot of one recording segment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentInfo {
    pub index: u32,
    pub path: PathBuf,
    pub status: SegmentStatus,
    // Encoder pid while one is attached to the segment
    pub encoder_pid: Option<u32>,
}

// One frame written by the frame capture loop
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapturedFrame {
    pub index: u64,
    pub path: PathBuf,
    pub captured_at: DateTime<Utc>,
}

// Frame loop result once it has been joined
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureSummary {
    pub frames: usize,
    pub failures: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeMode {
    // No segments were recorded
    Empty,
    // Single segment moved into place without re-encoding
    Renamed,
    // Segments stream-copied into one container
    Concatenated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeReport {
    pub output: PathBuf,
    pub segments: usize,
    pub mode: MergeMode,
}

// Recording status for UI display
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingStatus {
    pub state: RecordingState,
    pub is_recording: bool,
    pub session_id: Option<String>,
    pub output_path: Option<PathBuf>,
    pub segment_count: usize,
    pub active_segment: Option<u32>,
    pub started_at: Option<String>,
    pub last_message: String,
}
