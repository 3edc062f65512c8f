/**
 * ============================================================================
 * RECORDING MODULE
 * ============================================================================
 *
 * PURPOSE: Segmented screen recording engine driven by external FFmpeg processes
 *
 * SUBMODULES:
 * - capture: Still capture (FrameSource) and the shared CaptureDevice
 * - config: Configuration persistence and validation
 * - encoder: FFmpeg process supervision behind the EncoderDriver trait
 * - error: Error taxonomy with stable codes
 * - ffmpeg: FFmpeg binary resolution and screen grab arguments
 * - frames: Background frame capture loop
 * - manager: RecordingController state machine
 * - screenshot: Periodic screenshot scheduler
 * - segment: Segment lifecycle and final merge
 * - storage: Session working directory layout and manifests
 * - types: Data structures and models
 *
 * ARCHITECTURE:
 * 1. start: a session working directory is created and segment 0 begins
 * 2. Direct mode: FFmpeg grabs the screen straight into the segment file
 * 3. Frames mode: PNG frames are captured and encoded when the segment closes
 * 4. pause ends the active segment, resume begins the next one
 * 5. stop merges every segment into the output with a stream copy
 *
 * OUTPUT FORMAT:
 * - <temp_root>/session_<uuid>/segment_0000.mkv, segment_0001.mkv, ...
 * - segments.txt: concat manifest used for the merge
 * - Final output: one container at the caller's path
 *
 * ============================================================================
 */

pub mod capture;
pub mod config;
pub mod encoder;
pub mod error;
pub mod ffmpeg;
pub mod frames;
pub mod manager;
pub mod screenshot;
pub mod segment;
pub mod storage;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;
