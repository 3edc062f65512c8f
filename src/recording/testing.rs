// In-crate fakes so engine tests need neither FFmpeg nor a display.

use crate::collector::{ActivityLog, ScreenshotUploader};
use crate::recording::capture::FrameSource;
use crate::recording::encoder::{
    EncoderDriver, EncoderInput, EncoderProcess, EncoderProcessHandle, ProcessExit,
};
use crate::recording::error::{EngineError, EngineResult};
use crate::recording::types::RecordingConfig;
use image::{Rgba, RgbaImage};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// Config rooted in a test directory with short timeouts
pub fn test_config(temp_root: &Path) -> RecordingConfig {
    let mut config = RecordingConfig::default();
    config.temp_dir = Some(temp_root.to_path_buf());
    config.termination_timeout_ms = 200;
    config.launch_grace_ms = 20;
    config.merge_timeout_seconds = 5;
    config.screenshots.enabled = false;
    config.screenshots.output_dir = Some(temp_root.join("screenshots"));
    config
}

// =============================================================================
// Frame Source
// =============================================================================

pub struct FakeFrameSource {
    calls: u64,
    fail_every: Option<u64>,
    delay: Duration,
}

impl FakeFrameSource {
    pub fn new() -> Self {
        Self {
            calls: 0,
            fail_every: None,
            delay: Duration::ZERO,
        }
    }

    // Every n-th capture fails; 1 fails them all
    pub fn failing_every(n: u64) -> Self {
        Self {
            fail_every: Some(n),
            ..Self::new()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl FrameSource for FakeFrameSource {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn capture_still(&mut self) -> EngineResult<RgbaImage> {
        self.calls += 1;
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if let Some(n) = self.fail_every {
            if self.calls % n == 0 {
                return Err(EngineError::CaptureUnavailable(
                    "fake display unavailable".to_string(),
                ));
            }
        }
        Ok(RgbaImage::from_pixel(2, 2, Rgba([self.calls as u8, 0, 0, 255])))
    }
}

// =============================================================================
// Encoder Process
// =============================================================================

pub struct FakeProcess {
    pid: u32,
    pub exit: Arc<Mutex<Option<ProcessExit>>>,
    pub killed: Arc<AtomicBool>,
    ignore_stop: bool,
    live: Option<Arc<AtomicUsize>>,
}

impl FakeProcess {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            exit: Arc::new(Mutex::new(None)),
            killed: Arc::new(AtomicBool::new(false)),
            ignore_stop: false,
            live: None,
        }
    }

    pub fn exited(pid: u32, code: i32) -> Self {
        let process = Self::new(pid);
        *process.exit.lock().unwrap() = Some(ProcessExit { code: Some(code) });
        process
    }

    fn ignoring_stop(mut self, ignore: bool) -> Self {
        self.ignore_stop = ignore;
        self
    }

    fn tracked(mut self, live: Arc<AtomicUsize>) -> Self {
        self.live = Some(live);
        self
    }

    fn finish(&mut self, exit: ProcessExit) {
        let mut current = self.exit.lock().unwrap();
        if current.is_none() {
            *current = Some(exit);
        }
    }

    fn release_live(&mut self) {
        if let Some(live) = self.live.take() {
            live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl EncoderProcess for FakeProcess {
    fn id(&self) -> u32 {
        self.pid
    }

    fn try_wait(&mut self) -> io::Result<Option<ProcessExit>> {
        let exit = *self.exit.lock().unwrap();
        if exit.is_some() {
            self.release_live();
        }
        Ok(exit)
    }

    fn request_stop(&mut self) -> io::Result<()> {
        if !self.ignore_stop {
            self.finish(ProcessExit { code: Some(0) });
        }
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.killed.store(true, Ordering::SeqCst);
        self.finish(ProcessExit { code: None });
        self.release_live();
        Ok(())
    }
}

// =============================================================================
// Encoder Driver
// =============================================================================

// Screen runs write `segment:<file name>` into the output, frame runs write
// `frames:<count>`, concat runs join the listed files byte for byte.
#[derive(Default)]
pub struct FakeEncoder {
    pub launches: Mutex<Vec<(EncoderInput, PathBuf)>>,
    pub fail_launch: AtomicBool,
    pub exit_on_launch: AtomicBool,
    pub ignore_stop: AtomicBool,
    pub concat_exit_code: AtomicI32,
    pub frames_exit_code: AtomicI32,
    pub live: Arc<AtomicUsize>,
    pub max_live: Arc<AtomicUsize>,
    next_pid: AtomicU32,
}

impl FakeEncoder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn screen_launches(&self) -> Vec<PathBuf> {
        self.launches
            .lock()
            .unwrap()
            .iter()
            .filter(|(input, _)| matches!(input, EncoderInput::Screen(_)))
            .map(|(_, output)| output.clone())
            .collect()
    }

    pub fn concat_launches(&self) -> usize {
        self.launches
            .lock()
            .unwrap()
            .iter()
            .filter(|(input, _)| matches!(input, EncoderInput::Concat { .. }))
            .count()
    }

    pub fn frame_launches(&self) -> usize {
        self.launches
            .lock()
            .unwrap()
            .iter()
            .filter(|(input, _)| matches!(input, EncoderInput::FrameManifest { .. }))
            .count()
    }

    fn concat(manifest: &Path, output: &Path) -> io::Result<()> {
        let listing = std::fs::read_to_string(manifest)?;
        let mut bytes = Vec::new();
        for line in listing.lines() {
            if let Some(quoted) = line.strip_prefix("file '").and_then(|l| l.strip_suffix('\'')) {
                let path = quoted.replace(r"'\''", "'");
                bytes.extend(std::fs::read(path)?);
            }
        }
        std::fs::write(output, bytes)
    }

    fn count_frames(manifest: &Path) -> io::Result<usize> {
        let listing = std::fs::read_to_string(manifest)?;
        Ok(listing.lines().filter(|l| l.starts_with("duration ")).count())
    }
}

impl EncoderDriver for FakeEncoder {
    fn launch(&self, input: &EncoderInput, output: &Path) -> EngineResult<EncoderProcessHandle> {
        if self.fail_launch.load(Ordering::SeqCst) {
            return Err(EngineError::EncoderLaunch("fake encoder refused".to_string()));
        }

        self.launches
            .lock()
            .unwrap()
            .push((input.clone(), output.to_path_buf()));
        let pid = 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst);

        let process = match input {
            EncoderInput::Screen(_) => {
                if self.exit_on_launch.load(Ordering::SeqCst) {
                    FakeProcess::exited(pid, 1)
                } else {
                    let name = output
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    std::fs::write(output, format!("segment:{}", name))?;
                    let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
                    self.max_live.fetch_max(now, Ordering::SeqCst);
                    FakeProcess::new(pid)
                        .ignoring_stop(self.ignore_stop.load(Ordering::SeqCst))
                        .tracked(self.live.clone())
                }
            }
            EncoderInput::FrameManifest { manifest } => {
                let code = self.frames_exit_code.load(Ordering::SeqCst);
                if code == 0 {
                    let frames = Self::count_frames(manifest)?;
                    std::fs::write(output, format!("frames:{}", frames))?;
                }
                FakeProcess::exited(pid, code)
            }
            EncoderInput::Concat { manifest } => {
                let code = self.concat_exit_code.load(Ordering::SeqCst);
                if code == 0 {
                    Self::concat(manifest, output)?;
                }
                FakeProcess::exited(pid, code)
            }
        };

        Ok(EncoderProcessHandle::new(Box::new(process), input.label()))
    }
}

// =============================================================================
// Collaborators
// =============================================================================

#[derive(Default)]
pub struct FakeUploader {
    pub uploads: Mutex<Vec<(PathBuf, String)>>,
    pub fail: AtomicBool,
}

impl ScreenshotUploader for FakeUploader {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn upload(&self, local: &Path, remote_dir: &str) -> EngineResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(EngineError::Upload("fake server down".to_string()));
        }
        self.uploads
            .lock()
            .unwrap()
            .push((local.to_path_buf(), remote_dir.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeActivityLog {
    pub events: Mutex<Vec<(String, String)>>,
}

impl ActivityLog for FakeActivityLog {
    fn record(&self, user_id: &str, event: &str) -> EngineResult<()> {
        self.events
            .lock()
            .unwrap()
            .push((user_id.to_string(), event.to_string()));
        Ok(())
    }
}
