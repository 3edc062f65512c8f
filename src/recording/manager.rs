/**
 * ============================================================================
 * RECORDING MANAGER MODULE
 * ============================================================================
 *
 * PURPOSE: Thread-safe recording state machine driven by the UI, tray and CLI
 *
 * RESPONSIBILITIES:
 * - start/pause/resume/new_segment/stop over one recording session
 * - Periodic screenshots while a session is recording or paused
 * - Status for UI display, last human-readable status message
 * - Stop on teardown so no encoder or thread outlives the controller
 *
 * STATE MACHINE:
 *   Idle/Stopped --start--> Recording <--pause/resume--> Paused
 *   Recording/Paused --stop--> Stopping --> Stopped
 *
 * RECORDING FLOW:
 * 1. start: create session working directory, begin segment 0
 * 2. pause: end the active segment (encoder stopped and reaped)
 * 3. resume: begin the next segment
 * 4. stop: end the active segment, merge all segments into the output
 *
 * ============================================================================
 */

use crate::collector::Collaborators;
use crate::recording::capture::{CaptureDevice, ScreenshotCallback};
use crate::recording::encoder::{cleanup_orphaned_encoders, EncoderDriver, FfmpegEncoder};
use crate::recording::error::{EngineError, EngineResult};
use crate::recording::ffmpeg::FfmpegBinary;
use crate::recording::screenshot::{ScreenshotScheduler, Screenshotter};
use crate::recording::segment::{SegmentManager, SegmentPlan};
use crate::recording::storage::{normalize_output_path, SegmentFileNamer};
use crate::recording::types::*;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

// One start..stop recording
struct RecordingSession {
    id: String,
    output: PathBuf,
    started_at: DateTime<Utc>,
    segments: SegmentManager,
}

// Everything guarded by the session mutex
struct SessionSlot {
    state: RecordingState,
    session: Option<RecordingSession>,
    scheduler: Option<ScreenshotScheduler>,
    last_message: String,
}

struct ControllerInner {
    config: RecordingConfig,
    driver: Arc<dyn EncoderDriver>,
    device: Arc<CaptureDevice>,
    collaborators: Collaborators,
    shooter: Arc<Screenshotter>,
    // Mirror of SessionSlot::state for background threads
    state: Arc<AtomicU8>,
    slot: Mutex<SessionSlot>,
}

// Public handle; clones share one recording engine
#[derive(Clone)]
pub struct RecordingController {
    inner: Arc<ControllerInner>,
}

impl RecordingController {
    pub fn new(
        config: RecordingConfig,
        driver: Arc<dyn EncoderDriver>,
        device: Arc<CaptureDevice>,
    ) -> EngineResult<Self> {
        Self::with_collaborators(config, driver, device, Collaborators::default())
    }

    pub fn with_collaborators(
        config: RecordingConfig,
        driver: Arc<dyn EncoderDriver>,
        device: Arc<CaptureDevice>,
        collaborators: Collaborators,
    ) -> EngineResult<Self> {
        config.validate()?;

        let shooter = Arc::new(Screenshotter::from_config(
            device.clone(),
            &config.screenshots,
            &config.temp_root(),
            collaborators.clone(),
        ));

        Ok(Self {
            inner: Arc::new(ControllerInner {
                config,
                driver,
                device,
                collaborators,
                shooter,
                state: Arc::new(AtomicU8::new(RecordingState::Idle.as_u8())),
                slot: Mutex::new(SessionSlot {
                    state: RecordingState::Idle,
                    session: None,
                    scheduler: None,
                    last_message: "Idle".to_string(),
                }),
            }),
        })
    }

    // Real FFmpeg encoder and capture backend for this platform
    pub fn from_config(config: RecordingConfig, collaborators: Collaborators) -> EngineResult<Self> {
        config.validate()?;

        let binary = FfmpegBinary::resolve(config.ffmpeg_path.as_deref());
        let orphans = cleanup_orphaned_encoders(&config.temp_root());
        if !orphans.is_empty() {
            log::warn!("Terminated {} orphaned encoder(s): {:?}", orphans.len(), orphans);
        }

        let driver: Arc<dyn EncoderDriver> =
            Arc::new(FfmpegEncoder::from_config(&config, binary.clone()));
        let device = Arc::new(CaptureDevice::from_config(&config, binary));
        log::info!("Capture backend: {}", device.source_name());

        Self::with_collaborators(config, driver, device, collaborators)
    }

    pub fn config(&self) -> &RecordingConfig {
        &self.inner.config
    }

    // Start recording into `output`; returns the normalized output path
    pub fn start(&self, output: &Path) -> EngineResult<PathBuf> {
        self.inner.start(output)
    }

    pub fn pause(&self) -> EngineResult<()> {
        self.inner.pause()
    }

    pub fn resume(&self) -> EngineResult<SegmentInfo> {
        self.inner.resume()
    }

    // Close the active segment and immediately begin the next one
    pub fn new_segment(&self) -> EngineResult<SegmentInfo> {
        self.inner.new_segment()
    }

    // Finish the session; Ok(None) when nothing was recording
    pub fn stop(&self) -> EngineResult<Option<MergeReport>> {
        self.inner.stop()
    }

    pub fn capture_now(&self) -> EngineResult<PathBuf> {
        self.inner.shooter.capture_now()
    }

    pub fn set_screenshot_callback(&self, callback: Option<ScreenshotCallback>) {
        self.inner.device.set_screenshot_callback(callback);
    }

    pub fn state(&self) -> RecordingState {
        self.inner.current_state()
    }

    pub fn is_recording(&self) -> bool {
        self.state().is_recording()
    }

    pub fn status(&self) -> RecordingStatus {
        self.inner.status()
    }

    pub fn last_status(&self) -> String {
        self.inner.lock().last_message.clone()
    }

    pub fn segments(&self) -> Vec<SegmentInfo> {
        self.inner
            .lock()
            .session
            .as_ref()
            .map(|s| s.segments.segments())
            .unwrap_or_default()
    }
}

impl ControllerInner {
    fn lock(&self) -> MutexGuard<'_, SessionSlot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_state(&self) -> RecordingState {
        RecordingState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, slot: &mut SessionSlot, state: RecordingState) {
        if slot.state != state {
            log::info!("Recording state {:?} -> {:?}", slot.state, state);
        }
        slot.state = state;
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn set_message(slot: &mut SessionSlot, message: impl Into<String>) {
        slot.last_message = message.into();
    }

    fn record_activity(&self, event: &str) {
        if let Err(e) = self
            .collaborators
            .activity
            .record(&self.collaborators.user_id, event)
        {
            log::warn!("Failed to record activity {}: {}", event, e);
        }
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    fn start(&self, output: &Path) -> EngineResult<PathBuf> {
        let mut slot = self.lock();

        if matches!(
            slot.state,
            RecordingState::Recording | RecordingState::Paused | RecordingState::Stopping
        ) {
            return Err(EngineError::AlreadyRecording);
        }

        let output = normalize_output_path(output, &self.config.container);
        let session_id = uuid::Uuid::new_v4().to_string();
        log::info!("Starting recording session {} -> {:?}", session_id, output);

        let namer = SegmentFileNamer::create(
            &self.config.temp_root(),
            &session_id,
            &self.config.container,
        )?;
        let mut segments = SegmentManager::new(
            namer,
            self.driver.clone(),
            self.device.clone(),
            SegmentPlan::from_config(&self.config),
        );

        if let Err(e) = segments.begin_segment() {
            if let Err(cleanup) = segments.cleanup() {
                log::warn!("Failed to clean up after failed start: {}", cleanup);
            }
            log::error!("Failed to start recording: {}", e);
            Self::set_message(&mut slot, format!("Failed to start recording: {}", e));
            return Err(e);
        }

        slot.session = Some(RecordingSession {
            id: session_id,
            output: output.clone(),
            started_at: Utc::now(),
            segments,
        });
        self.set_state(&mut slot, RecordingState::Recording);
        Self::set_message(&mut slot, format!("Recording to {}", output.display()));

        if self.config.screenshots.enabled {
            match ScreenshotScheduler::start(
                self.shooter.clone(),
                &self.config.screenshots,
                self.state.clone(),
            ) {
                Ok(scheduler) => slot.scheduler = Some(scheduler),
                Err(e) => log::warn!("Screenshot scheduler not started: {}", e),
            }
        }
        drop(slot);

        self.record_activity("recording_started");
        Ok(output)
    }

    fn pause(&self) -> EngineResult<()> {
        let mut slot = self.lock();
        if slot.state != RecordingState::Recording {
            return Err(EngineError::InvalidState {
                operation: "pause",
                state: slot.state,
            });
        }

        let result = match slot.session.as_mut() {
            Some(session) => match session.segments.active_index() {
                Some(index) => session.segments.end_segment(index).map(|_| ()),
                None => Ok(()),
            },
            None => Ok(()),
        };

        // Paused in every outcome: no segment is active any more
        self.set_state(&mut slot, RecordingState::Paused);
        match result {
            Ok(()) => {
                Self::set_message(&mut slot, "Paused");
                Ok(())
            }
            Err(e @ EngineError::EncoderTerminationTimeout { .. }) => {
                log::warn!("{}", e);
                Self::set_message(&mut slot, format!("Paused ({})", e));
                Ok(())
            }
            Err(e) => {
                Self::set_message(&mut slot, format!("Paused with error: {}", e));
                Err(e)
            }
        }
    }

    fn resume(&self) -> EngineResult<SegmentInfo> {
        let mut slot = self.lock();
        if slot.state != RecordingState::Paused {
            return Err(EngineError::InvalidState {
                operation: "resume",
                state: slot.state,
            });
        }

        let state = slot.state;
        let Some(session) = slot.session.as_mut() else {
            return Err(EngineError::InvalidState {
                operation: "resume",
                state,
            });
        };

        match session.segments.begin_segment() {
            Ok(info) => {
                self.set_state(&mut slot, RecordingState::Recording);
                Self::set_message(&mut slot, format!("Recording segment {}", info.index));
                Ok(info)
            }
            Err(e) => {
                log::error!("Failed to resume recording: {}", e);
                Self::set_message(&mut slot, format!("Resume failed: {}", e));
                Err(e)
            }
        }
    }

    fn new_segment(&self) -> EngineResult<SegmentInfo> {
        let mut slot = self.lock();
        if slot.state != RecordingState::Recording {
            return Err(EngineError::InvalidState {
                operation: "start a new segment",
                state: slot.state,
            });
        }

        let state = slot.state;
        let Some(session) = slot.session.as_mut() else {
            return Err(EngineError::InvalidState {
                operation: "start a new segment",
                state,
            });
        };

        let ended = match session.segments.active_index() {
            Some(index) => session.segments.end_segment(index).map(|_| ()),
            None => Ok(()),
        };
        let outcome = match ended {
            Ok(()) => session.segments.begin_segment(),
            Err(EngineError::EncoderTerminationTimeout { pid, timeout }) => {
                log::warn!("Encoder (pid {}) killed after {:?}", pid, timeout);
                session.segments.begin_segment()
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(info) => {
                Self::set_message(&mut slot, format!("Recording segment {}", info.index));
                Ok(info)
            }
            Err(e) => {
                // Nothing is active any more
                self.set_state(&mut slot, RecordingState::Paused);
                Self::set_message(&mut slot, format!("Paused, new segment failed: {}", e));
                Err(e)
            }
        }
    }

    fn stop(&self) -> EngineResult<Option<MergeReport>> {
        let scheduler = {
            let mut slot = self.lock();
            if !slot.state.is_recording() {
                return Ok(None);
            }
            self.set_state(&mut slot, RecordingState::Stopping);
            Self::set_message(&mut slot, "Stopping");
            slot.scheduler.take()
        };

        // Joined outside the lock; a screenshot callback may query the controller
        if let Some(mut scheduler) = scheduler {
            scheduler.stop();
        }

        let mut slot = self.lock();
        let result = match slot.session.take() {
            Some(mut session) => Self::finish_session(&mut session),
            None => Ok(MergeReport {
                output: PathBuf::new(),
                segments: 0,
                mode: MergeMode::Empty,
            }),
        };

        self.set_state(&mut slot, RecordingState::Stopped);
        match &result {
            Ok(report) => Self::set_message(
                &mut slot,
                format!(
                    "Saved {} ({} segment(s), {:?})",
                    report.output.display(),
                    report.segments,
                    report.mode
                ),
            ),
            Err(e) => Self::set_message(&mut slot, format!("Stop failed: {}", e)),
        }
        drop(slot);

        self.record_activity("recording_stopped");
        result.map(Some)
    }

    fn finish_session(session: &mut RecordingSession) -> EngineResult<MergeReport> {
        if let Some(index) = session.segments.active_index() {
            match session.segments.end_segment(index) {
                Ok(_) => {}
                Err(e @ EngineError::EncoderTerminationTimeout { .. }) => log::warn!("{}", e),
                Err(e) => log::error!("Final segment {} ended with error: {}", index, e),
            }
        }

        let elapsed = Utc::now() - session.started_at;
        log::info!(
            "Session {} ran {:.1}s, merging into {:?}",
            session.id,
            elapsed.num_milliseconds() as f64 / 1000.0,
            session.output
        );

        match session.segments.merge_all(&session.output) {
            Ok(report) => Ok(report),
            Err(e) => {
                log::error!(
                    "Merge failed, segment files kept in {:?}: {}",
                    session.segments.work_dir(),
                    e
                );
                Err(e)
            }
        }
    }

    fn status(&self) -> RecordingStatus {
        let slot = self.lock();
        let session = slot.session.as_ref();
        RecordingStatus {
            state: slot.state,
            is_recording: slot.state.is_recording(),
            session_id: session.map(|s| s.id.clone()),
            output_path: session.map(|s| s.output.clone()),
            segment_count: session.map(|s| s.segments.segments().len()).unwrap_or(0),
            active_segment: session.and_then(|s| s.segments.active_index()),
            started_at: session.map(|s| s.started_at.to_rfc3339()),
            last_message: slot.last_message.clone(),
        }
    }
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        if self.current_state().is_recording() {
            log::info!("Recording controller dropped while recording, stopping");
            if let Err(e) = self.stop() {
                log::error!("Stop during teardown failed: {}", e);
            }
        }
    }
}
