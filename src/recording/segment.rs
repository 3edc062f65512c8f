/**
 * ============================================================================
 * SEGMENT MANAGER MODULE
 * ============================================================================
 *
 * PURPOSE: Begin and end recording segments, merge them into the output
 *
 * FUNCTIONALITY:
 * - Direct mode: one FFmpeg screen encoder per segment
 * - Frames mode: one frame capture loop per segment, encoded at close
 * - Lossless merge: rename for one segment, concat stream copy for several
 * - Segment files are preserved whenever the merge fails
 *
 * INVARIANTS:
 * - At most one segment is Active
 * - Indices are zero-based and gapless; failed begins consume no index
 * - Every segment is Closed (and its encoder reaped) before a merge
 *
 * ============================================================================
 */

use crate::recording::capture::CaptureDevice;
use crate::recording::encoder::{run_to_completion, EncoderDriver, EncoderInput, EncoderProcessHandle};
use crate::recording::error::{EngineError, EngineResult};
use crate::recording::ffmpeg::ScreenGrab;
use crate::recording::frames::FrameCaptureLoop;
use crate::recording::storage::{self, SegmentFileNamer};
use crate::recording::types::{
    CaptureMode, MergeMode, MergeReport, RecordingConfig, SegmentInfo, SegmentStatus,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

// How segments are produced and how long each step may take
#[derive(Debug, Clone)]
pub struct SegmentPlan {
    pub mode: CaptureMode,
    pub grab: ScreenGrab,
    pub termination_timeout: Duration,
    pub merge_timeout: Duration,
    pub launch_grace: Duration,
}

impl SegmentPlan {
    pub fn from_config(config: &RecordingConfig) -> Self {
        Self {
            mode: config.capture_mode,
            grab: ScreenGrab::new(
                config.framerate,
                config.screen_device.clone(),
                config.screen_size(),
            ),
            termination_timeout: Duration::from_millis(config.termination_timeout_ms),
            merge_timeout: Duration::from_secs(config.merge_timeout_seconds),
            launch_grace: Duration::from_millis(config.launch_grace_ms),
        }
    }
}

struct SegmentEntry {
    info: SegmentInfo,
    encoder: Option<EncoderProcessHandle>,
    frames: Option<FrameCaptureLoop>,
}

pub struct SegmentManager {
    namer: SegmentFileNamer,
    driver: Arc<dyn EncoderDriver>,
    device: Arc<CaptureDevice>,
    plan: SegmentPlan,
    segments: Vec<SegmentEntry>,
    next_index: u32,
}

impl SegmentManager {
    pub fn new(
        namer: SegmentFileNamer,
        driver: Arc<dyn EncoderDriver>,
        device: Arc<CaptureDevice>,
        plan: SegmentPlan,
    ) -> Self {
        Self {
            namer,
            driver,
            device,
            plan,
            segments: Vec::new(),
            next_index: 0,
        }
    }

    pub fn work_dir(&self) -> &Path {
        self.namer.work_dir()
    }

    pub fn segments(&self) -> Vec<SegmentInfo> {
        self.segments.iter().map(|s| s.info.clone()).collect()
    }

    pub fn active_index(&self) -> Option<u32> {
        self.segments
            .iter()
            .find(|s| s.info.status == SegmentStatus::Active)
            .map(|s| s.info.index)
    }

    // =========================================================================
    // Begin
    // =========================================================================

    pub fn begin_segment(&mut self) -> EngineResult<SegmentInfo> {
        if let Some(active) = self.active_index() {
            return Err(EngineError::SegmentActive(active));
        }

        let index = self.next_index;
        let path = self.namer.segment_path(index);

        let entry = match self.plan.mode {
            CaptureMode::Direct => {
                let handle = self.launch_screen_encoder(&path)?;
                SegmentEntry {
                    info: SegmentInfo {
                        index,
                        path,
                        status: SegmentStatus::Active,
                        encoder_pid: Some(handle.pid()),
                    },
                    encoder: Some(handle),
                    frames: None,
                }
            }
            CaptureMode::Frames => {
                let mut capture =
                    FrameCaptureLoop::new(self.device.clone(), self.namer.frames_dir(index));
                capture.start(self.plan.grab.fps)?;
                SegmentEntry {
                    info: SegmentInfo {
                        index,
                        path,
                        status: SegmentStatus::Active,
                        encoder_pid: None,
                    },
                    encoder: None,
                    frames: Some(capture),
                }
            }
        };

        self.next_index += 1;
        let info = entry.info.clone();
        self.segments.push(entry);
        log::info!("Segment {} started: {:?}", info.index, info.path);
        Ok(info)
    }

    fn launch_screen_encoder(&self, path: &Path) -> EngineResult<EncoderProcessHandle> {
        let mut handle = self
            .driver
            .launch(&EncoderInput::Screen(self.plan.grab.clone()), path)?;

        // An encoder that cannot open the grab device dies right away
        if let Some(exit) = handle.wait_timeout(self.plan.launch_grace) {
            let details = handle.diagnostics();
            drop(handle);
            let _ = fs::remove_file(path);
            log::error!("Screen encoder exited immediately with {:?}: {}", exit.code, details);
            return Err(EngineError::EncoderLaunch(format!(
                "encoder exited immediately with {:?}{}{}",
                exit.code,
                if details.is_empty() { "" } else { ": " },
                details
            )));
        }

        Ok(handle)
    }

    // =========================================================================
    // End
    // =========================================================================

    // Close a segment. The segment is Closed in every outcome.
    pub fn end_segment(&mut self, index: u32) -> EngineResult<SegmentInfo> {
        let Some(entry) = self.segments.iter_mut().find(|s| s.info.index == index) else {
            return Err(EngineError::UnknownSegment(index));
        };

        if entry.info.status != SegmentStatus::Active {
            return Ok(entry.info.clone());
        }

        let result = match (entry.encoder.take(), entry.frames.take()) {
            (Some(handle), _) => {
                close_encoder(self.driver.as_ref(), handle, self.plan.termination_timeout)
            }
            (None, Some(capture)) => encode_frames(
                self.driver.as_ref(),
                &self.namer,
                capture,
                index,
                &entry.info.path,
                self.plan.grab.fps,
                self.plan.merge_timeout,
            ),
            (None, None) => Ok(()),
        };

        entry.info.status = SegmentStatus::Closed;
        entry.info.encoder_pid = None;
        log::info!("Segment {} closed", index);

        result.map(|_| entry.info.clone())
    }

    // =========================================================================
    // Merge
    // =========================================================================

    // Merge every closed segment into `output` and remove the working directory
    pub fn merge_all(&mut self, output: &Path) -> EngineResult<MergeReport> {
        if let Some(active) = self.active_index() {
            return Err(EngineError::SegmentActive(active));
        }

        if self.segments.is_empty() {
            log::info!("No segments recorded, nothing to merge");
            storage::remove_work_dir(self.namer.work_dir())?;
            return Ok(MergeReport {
                output: output.to_path_buf(),
                segments: 0,
                mode: MergeMode::Empty,
            });
        }

        let mut files = Vec::new();
        for segment in &self.segments {
            let usable = fs::metadata(&segment.info.path)
                .map(|m| m.is_file() && m.len() > 0)
                .unwrap_or(false);
            if usable {
                files.push(segment.info.path.clone());
            } else {
                log::warn!(
                    "Segment {} has no usable file at {:?}, skipping",
                    segment.info.index,
                    segment.info.path
                );
            }
        }

        if files.is_empty() {
            return Err(EngineError::Merge(format!(
                "none of the {} segments produced a file",
                self.segments.len()
            )));
        }

        let report = merge_files(
            self.driver.as_ref(),
            &files,
            &self.namer.manifest_path(),
            output,
            self.plan.merge_timeout,
        )?;

        for segment in &mut self.segments {
            segment.info.status = SegmentStatus::Merged;
        }

        if let Err(e) = storage::remove_work_dir(self.namer.work_dir()) {
            log::error!("Failed to remove working directory after merge: {}", e);
        }

        Ok(report)
    }

    // Stop anything still running and delete the working directory
    pub fn cleanup(&mut self) -> EngineResult<()> {
        for segment in &mut self.segments {
            if let Some(mut capture) = segment.frames.take() {
                capture.stop();
            }
            if let Some(mut handle) = segment.encoder.take() {
                let _ = handle.kill();
            }
            segment.info.status = SegmentStatus::Closed;
            segment.info.encoder_pid = None;
        }
        storage::remove_work_dir(self.namer.work_dir())
    }
}

fn close_encoder(
    driver: &dyn EncoderDriver,
    mut handle: EncoderProcessHandle,
    timeout: Duration,
) -> EngineResult<()> {
    if let Err(e) = driver.terminate(&mut handle) {
        log::warn!("{}", e);
    }

    match handle.wait_timeout(timeout) {
        Some(exit) => {
            if !exit.success() {
                log::warn!(
                    "Screen encoder (pid {}) exited with {:?}: {}",
                    handle.pid(),
                    exit.code,
                    handle.diagnostics()
                );
            }
            Ok(())
        }
        None => {
            let pid = handle.pid();
            log::warn!(
                "Screen encoder (pid {}) ignored stop for {:?}, killing",
                pid,
                timeout
            );
            handle.kill()?;
            Err(EngineError::EncoderTerminationTimeout { pid, timeout })
        }
    }
}

fn encode_frames(
    driver: &dyn EncoderDriver,
    namer: &SegmentFileNamer,
    mut capture: FrameCaptureLoop,
    index: u32,
    output: &Path,
    fps: u8,
    timeout: Duration,
) -> EngineResult<()> {
    let summary = capture.stop();
    let frames = capture.frames();
    let frames_dir = capture.frames_dir().to_path_buf();
    drop(capture);

    if frames.is_empty() {
        let _ = storage::remove_work_dir(&frames_dir);
        return Err(EngineError::EncoderFailed(format!(
            "segment {} captured no frames ({} failures)",
            index, summary.failures
        )));
    }

    let manifest = namer.frame_manifest_path(index);
    let last_duration = Duration::from_secs_f64(1.0 / f64::from(fps.max(1)));
    storage::write_frame_manifest(&manifest, &frames, last_duration)?;

    let input = EncoderInput::FrameManifest { manifest };
    match run_to_completion(driver, &input, output, timeout) {
        Ok(exit) if exit.success() => {
            storage::remove_work_dir(&frames_dir)?;
            log::info!("Encoded {} frames into {:?}", frames.len(), output);
            Ok(())
        }
        Ok(exit) => Err(EngineError::EncoderFailed(format!(
            "frame encoder for segment {} exited with {:?}, frames kept in {:?}",
            index, exit.code, frames_dir
        ))),
        Err(EngineError::EncoderTerminationTimeout { timeout, .. }) => {
            Err(EngineError::EncoderFailed(format!(
                "frame encoder for segment {} exceeded {:?}, frames kept in {:?}",
                index, timeout, frames_dir
            )))
        }
        Err(e) => Err(e),
    }
}

// Move a file, copying across filesystems
fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) => {
            log::debug!("Rename {:?} -> {:?} failed ({}), copying", from, to, e);
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}

// Merge ordered segment files into `output`
//
// Zero files is a no-op, one is moved into place, several are stream copied
// through the concat demuxer. Inputs are only deleted after a successful merge.
pub fn merge_files(
    driver: &dyn EncoderDriver,
    files: &[PathBuf],
    manifest: &Path,
    output: &Path,
    timeout: Duration,
) -> EngineResult<MergeReport> {
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| EngineError::Merge(format!("cannot create {:?}: {}", parent, e)))?;
    }

    let report = |mode| MergeReport {
        output: output.to_path_buf(),
        segments: files.len(),
        mode,
    };

    match files {
        [] => Ok(report(MergeMode::Empty)),
        [single] => {
            move_file(single, output).map_err(|e| {
                EngineError::Merge(format!("cannot move {:?} to {:?}: {}", single, output, e))
            })?;
            log::info!("Single segment moved to {:?}", output);
            Ok(report(MergeMode::Renamed))
        }
        _ => {
            storage::write_segment_manifest(manifest, files)?;
            let input = EncoderInput::Concat {
                manifest: manifest.to_path_buf(),
            };

            let failure = match run_to_completion(driver, &input, output, timeout) {
                Ok(exit) if exit.success() => None,
                Ok(exit) => Some(format!("concat exited with {:?}", exit.code)),
                Err(EngineError::EncoderTerminationTimeout { timeout, .. }) => {
                    Some(format!("concat did not finish within {:?}", timeout))
                }
                Err(e) => Some(e.to_string()),
            };

            if let Some(reason) = failure {
                let _ = fs::remove_file(output);
                log::error!("Merge failed, {} segment files preserved: {}", files.len(), reason);
                return Err(EngineError::Merge(reason));
            }

            for file in files {
                if let Err(e) = fs::remove_file(file) {
                    log::warn!("Failed to remove merged segment {:?}: {}", file, e);
                }
            }
            let _ = fs::remove_file(manifest);
            log::info!("Merged {} segments into {:?}", files.len(), output);
            Ok(report(MergeMode::Concatenated))
        }
    }
}
