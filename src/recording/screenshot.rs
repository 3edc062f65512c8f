/**
 * ============================================================================
 * SCREENSHOT SCHEDULER MODULE
 * ============================================================================
 *
 * PURPOSE: Periodic still captures while a recording is in progress
 *
 * FUNCTIONALITY:
 * - Randomized interval between captures (600-1800s by default)
 * - Sleep in short slices so stop() returns within one poll interval
 * - Each capture: PNG file -> upload -> `screenshot_taken` activity event
 * - Manual capture_now() through the same path
 *
 * ============================================================================
 */

use crate::collector::Collaborators;
use crate::recording::capture::CaptureDevice;
use crate::recording::error::EngineResult;
use crate::recording::types::{RecordingState, ScreenshotConfig};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub const SCREENSHOT_EVENT: &str = "screenshot_taken";

// Takes one screenshot and hands it to the collaborators
pub struct Screenshotter {
    device: Arc<CaptureDevice>,
    output_dir: PathBuf,
    remote_dir: String,
    collaborators: Collaborators,
    // Keeps same-millisecond captures apart
    sequence: AtomicU64,
}

impl Screenshotter {
    pub fn new(
        device: Arc<CaptureDevice>,
        output_dir: PathBuf,
        remote_dir: String,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            device,
            output_dir,
            remote_dir,
            collaborators,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn from_config(
        device: Arc<CaptureDevice>,
        config: &ScreenshotConfig,
        temp_root: &Path,
        collaborators: Collaborators,
    ) -> Self {
        let output_dir = config
            .output_dir
            .clone()
            .unwrap_or_else(|| temp_root.join("screenshots"));
        Self::new(device, output_dir, config.remote_dir.clone(), collaborators)
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    // Unique per call: `screenshot_<unix>_<millis>_<seq>.png`
    pub fn screenshot_path(&self, at: DateTime<Utc>) -> PathBuf {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.output_dir.join(format!(
            "screenshot_{}_{:03}_{:04}.png",
            at.timestamp(),
            at.timestamp_subsec_millis(),
            seq
        ))
    }

    // Remote directory for this user: "<remote_dir>/<user_id>/"
    pub fn remote_path(&self) -> String {
        format!(
            "{}/{}/",
            self.remote_dir.trim_end_matches('/'),
            self.collaborators.user_id
        )
    }

    // Capture, upload and log one screenshot
    //
    // Upload and activity failures are logged; the local file is kept either way.
    pub fn capture_now(&self) -> EngineResult<PathBuf> {
        let path = self.screenshot_path(Utc::now());
        let written = self.device.capture_screenshot(&path)?;
        log::info!("Screenshot saved to {:?}", written);

        let remote = self.remote_path();
        if let Err(e) = self.collaborators.uploader.upload(&written, &remote) {
            log::warn!("Screenshot upload failed, kept at {:?}: {}", written, e);
        }

        if let Err(e) = self
            .collaborators
            .activity
            .record(&self.collaborators.user_id, SCREENSHOT_EVENT)
        {
            log::warn!("Failed to record screenshot activity: {}", e);
        }

        Ok(written)
    }
}

// Uniformly random wait in [min, max]
pub fn next_interval(min: Duration, max: Duration) -> Duration {
    let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
    let millis = rand::thread_rng().gen_range(lo.as_millis()..=hi.as_millis());
    Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
}

// Sleep `total` in slices of `poll`; false when cancelled first
pub fn interruptible_sleep(total: Duration, poll: Duration, cancel: &AtomicBool) -> bool {
    let deadline = Instant::now() + total;
    let poll = poll.max(Duration::from_millis(1));
    loop {
        if cancel.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(poll.min(deadline - now));
    }
}

pub struct ScreenshotScheduler {
    cancel: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl ScreenshotScheduler {
    pub fn start(
        shooter: Arc<Screenshotter>,
        config: &ScreenshotConfig,
        state: Arc<AtomicU8>,
    ) -> EngineResult<Self> {
        Self::start_with_bounds(
            shooter,
            Duration::from_secs(config.min_interval_secs),
            Duration::from_secs(config.max_interval_secs),
            Duration::from_millis(config.poll_interval_ms),
            state,
        )
    }

    pub fn start_with_bounds(
        shooter: Arc<Screenshotter>,
        min: Duration,
        max: Duration,
        poll: Duration,
        state: Arc<AtomicU8>,
    ) -> EngineResult<Self> {
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = cancel.clone();

        log::info!("Screenshot scheduler started ({:?} - {:?})", min, max);
        let worker = std::thread::Builder::new()
            .name("screenshot-timer".to_string())
            .spawn(move || loop {
                let wait = next_interval(min, max);
                log::debug!("Next screenshot in {:?}", wait);
                if !interruptible_sleep(wait, poll, &flag) {
                    break;
                }

                let current = RecordingState::from_u8(state.load(Ordering::SeqCst));
                if !current.is_recording() {
                    log::debug!("Skipping screenshot while {:?}", current);
                    continue;
                }
                if let Err(e) = shooter.capture_now() {
                    log::warn!("Scheduled screenshot failed: {}", e);
                }
            })?;

        Ok(Self {
            cancel,
            worker: Some(worker),
        })
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    // Cancel and join; idempotent
    pub fn stop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Screenshot thread panicked");
            }
            log::info!("Screenshot scheduler stopped");
        }
    }
}

impl Drop for ScreenshotScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
