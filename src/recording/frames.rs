/**
 * ============================================================================
 * FRAME CAPTURE LOOP MODULE
 * ============================================================================
 *
 * PURPOSE: Capture PNG frames at a target rate on a dedicated thread
 *
 * FUNCTIONALITY:
 * - One OS thread per active Frames-mode segment
 * - Failed captures are counted and skipped, never fatal
 * - stop() joins the thread; no frame is appended after it returns
 *
 * ============================================================================
 */

use crate::recording::capture::CaptureDevice;
use crate::recording::error::EngineResult;
use crate::recording::storage::frame_path;
use crate::recording::types::{CaptureSummary, CapturedFrame};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

// Longest uninterrupted sleep, so stop() is not held up by a slow frame rate
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);
const WARN_FAILURES: u64 = 3;

// Remaining sleep after a capture that took `elapsed`
pub fn pacing_sleep(interval: Duration, elapsed: Duration) -> Duration {
    interval.saturating_sub(elapsed)
}

pub struct FrameCaptureLoop {
    device: Arc<CaptureDevice>,
    frames_dir: PathBuf,
    frames: Arc<Mutex<Vec<CapturedFrame>>>,
    failures: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl FrameCaptureLoop {
    pub fn new(device: Arc<CaptureDevice>, frames_dir: PathBuf) -> Self {
        Self {
            device,
            frames_dir,
            frames: Arc::new(Mutex::new(Vec::new())),
            failures: Arc::new(AtomicU64::new(0)),
            shutdown: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn frames_dir(&self) -> &Path {
        &self.frames_dir
    }

    pub fn start(&mut self, target_fps: u8) -> EngineResult<()> {
        if self.worker.is_some() {
            log::warn!("Frame capture into {:?} already started", self.frames_dir);
            return Ok(());
        }

        std::fs::create_dir_all(&self.frames_dir)?;
        self.shutdown.store(false, Ordering::SeqCst);

        let device = self.device.clone();
        let frames = self.frames.clone();
        let failures = self.failures.clone();
        let shutdown = self.shutdown.clone();
        let dir = self.frames_dir.clone();
        let interval = Duration::from_secs_f64(1.0 / f64::from(target_fps.max(1)));

        log::info!(
            "Starting frame capture at {} fps into {:?}",
            target_fps.max(1),
            dir
        );

        let worker = std::thread::Builder::new()
            .name("frame-capture".to_string())
            .spawn(move || {
                capture_loop(&device, &dir, interval, &frames, &failures, &shutdown)
            })?;
        self.worker = Some(worker);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    // Idempotent; joins the capture thread
    pub fn stop(&mut self) -> CaptureSummary {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Frame capture thread for {:?} panicked", self.frames_dir);
            }
        }

        let summary = CaptureSummary {
            frames: self.lock_frames().len(),
            failures: self.failures.load(Ordering::SeqCst),
        };
        log::info!(
            "Frame capture into {:?} stopped: {} frames, {} failures",
            self.frames_dir,
            summary.frames,
            summary.failures
        );
        summary
    }

    pub fn frames(&self) -> Vec<CapturedFrame> {
        self.lock_frames().clone()
    }

    fn lock_frames(&self) -> std::sync::MutexGuard<'_, Vec<CapturedFrame>> {
        self.frames.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Drop for FrameCaptureLoop {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
        }
    }
}

fn capture_loop(
    device: &CaptureDevice,
    dir: &Path,
    interval: Duration,
    frames: &Mutex<Vec<CapturedFrame>>,
    failures: &AtomicU64,
    shutdown: &AtomicBool,
) {
    while !shutdown.load(Ordering::SeqCst) {
        let started = Instant::now();
        let captured_at = Utc::now();
        // Index by successful frames so the sequence stays contiguous
        let index = frames.lock().unwrap_or_else(|p| p.into_inner()).len() as u64;

        match device.capture_frame_to_file(&frame_path(dir, index)) {
            Ok(path) => {
                frames
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .push(CapturedFrame {
                        index,
                        path,
                        captured_at,
                    });
            }
            Err(e) => {
                let count = failures.fetch_add(1, Ordering::SeqCst) + 1;
                if count <= WARN_FAILURES {
                    log::warn!("Frame capture failed ({} so far): {}", count, e);
                } else {
                    log::debug!("Frame capture failed ({} so far): {}", count, e);
                }
            }
        }

        let mut remaining = pacing_sleep(interval, started.elapsed());
        while !remaining.is_zero() && !shutdown.load(Ordering::SeqCst) {
            let slice = remaining.min(SHUTDOWN_POLL);
            std::thread::sleep(slice);
            remaining -= slice;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::testing::FakeFrameSource;

    fn device(source: FakeFrameSource) -> Arc<CaptureDevice> {
        Arc::new(CaptureDevice::new(Box::new(source)))
    }

    #[test]
    fn test_pacing_sleep() {
        let interval = Duration::from_millis(100);
        assert_eq!(pacing_sleep(interval, Duration::from_millis(30)), Duration::from_millis(70));
        assert_eq!(pacing_sleep(interval, Duration::from_millis(100)), Duration::ZERO);
        assert_eq!(pacing_sleep(interval, Duration::from_millis(250)), Duration::ZERO);
    }

    #[test]
    fn test_captures_contiguous_frames() {
        let dir = tempfile::tempdir().unwrap();
        let mut capture = FrameCaptureLoop::new(device(FakeFrameSource::new()), dir.path().join("frames"));
        capture.start(50).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        let summary = capture.stop();

        let frames = capture.frames();
        assert!(summary.frames > 0);
        assert_eq!(summary.frames, frames.len());
        assert_eq!(summary.failures, 0);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.index, i as u64);
            assert!(frame.path.is_file());
        }
        assert!(frames.windows(2).all(|w| w[0].captured_at <= w[1].captured_at));
    }

    #[test]
    fn test_no_frames_after_stop() {
        let dir = tempfile::tempdir().unwrap();
        let mut capture = FrameCaptureLoop::new(device(FakeFrameSource::new()), dir.path().join("frames"));
        capture.start(60).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        let summary = capture.stop();
        assert!(!capture.is_running());

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(capture.frames().len(), summary.frames);
        // Idempotent
        assert_eq!(capture.stop(), summary);
    }

    #[test]
    fn test_failures_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut capture = FrameCaptureLoop::new(
            device(FakeFrameSource::failing_every(2)),
            dir.path().join("frames"),
        );
        capture.start(50).unwrap();
        std::thread::sleep(Duration::from_millis(250));
        let summary = capture.stop();

        assert!(summary.failures > 0);
        assert!(summary.frames > 0);
        let indices: Vec<u64> = capture.frames().iter().map(|f| f.index).collect();
        assert_eq!(indices, (0..indices.len() as u64).collect::<Vec<_>>());
    }

    #[test]
    fn test_stop_is_prompt_at_low_rate() {
        let dir = tempfile::tempdir().unwrap();
        let mut capture = FrameCaptureLoop::new(device(FakeFrameSource::new()), dir.path().join("frames"));
        capture.start(1).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        capture.stop();
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
