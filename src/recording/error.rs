/**
 * ============================================================================
 * ENGINE ERROR MODULE
 * ============================================================================
 *
 * PURPOSE: One error type for every recording engine operation
 *
 * - EngineError carries the human-readable message
 * - ErrorCode is the stable reason callers branch on
 * - Errors serialize as their display string for UI and IPC
 *
 * ============================================================================
 */

use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::recording::types::RecordingState;

// Stable reason codes surfaced to callers alongside the human-readable message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    CaptureUnavailable,
    CaptureWriteError,
    EncoderLaunchFailed,
    EncoderTerminationTimeout,
    EncoderFailed,
    MergeFailed,
    AlreadyRecording,
    InvalidState,
    Config,
    Upload,
    Io,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Capture unavailable: {0}")]
    CaptureUnavailable(String),

    #[error("Failed to write capture to {path:?}: {reason}")]
    CaptureWrite { path: PathBuf, reason: String },

    #[error("Encoder launch failed: {0}")]
    EncoderLaunch(String),

    #[error("Encoder (pid {pid}) did not exit within {timeout:?}, killed")]
    EncoderTerminationTimeout { pid: u32, timeout: Duration },

    #[error("Encoder failed: {0}")]
    EncoderFailed(String),

    #[error("Merge failed: {0}")]
    Merge(String),

    #[error("A recording is already in progress")]
    AlreadyRecording,

    #[error("Cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: RecordingState,
    },

    #[error("Segment {0} is still active")]
    SegmentActive(u32),

    #[error("Segment {0} does not exist")]
    UnknownSegment(u32),

    #[error("Config Error: {0}")]
    Config(String),

    #[error("Upload Error: {0}")]
    Upload(String),

    #[error("IO Error: {0}")]
    Io(#[from] io::Error),
}

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::CaptureUnavailable(_) => ErrorCode::CaptureUnavailable,
            EngineError::CaptureWrite { .. } => ErrorCode::CaptureWriteError,
            EngineError::EncoderLaunch(_) => ErrorCode::EncoderLaunchFailed,
            EngineError::EncoderTerminationTimeout { .. } => ErrorCode::EncoderTerminationTimeout,
            EngineError::EncoderFailed(_) => ErrorCode::EncoderFailed,
            EngineError::Merge(_) => ErrorCode::MergeFailed,
            EngineError::AlreadyRecording => ErrorCode::AlreadyRecording,
            EngineError::InvalidState { .. }
            | EngineError::SegmentActive(_)
            | EngineError::UnknownSegment(_) => ErrorCode::InvalidState,
            EngineError::Config(_) => ErrorCode::Config,
            EngineError::Upload(_) => ErrorCode::Upload,
            EngineError::Io(_) => ErrorCode::Io,
        }
    }

    // Per-frame failures are skipped by the capture loop instead of escalated
    pub fn is_transient(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::CaptureUnavailable | ErrorCode::CaptureWriteError
        )
    }
}

// Allow serializing errors to send to the UI layer
impl Serialize for EngineError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(EngineError::AlreadyRecording.code(), ErrorCode::AlreadyRecording);
        assert_eq!(EngineError::Merge("x".into()).code(), ErrorCode::MergeFailed);
        assert_eq!(EngineError::SegmentActive(2).code(), ErrorCode::InvalidState);
        let io_err: EngineError = io::Error::new(io::ErrorKind::Other, "disk").into();
        assert_eq!(io_err.code(), ErrorCode::Io);
    }

    #[test]
    fn test_transient_errors() {
        assert!(EngineError::CaptureUnavailable("no display".into()).is_transient());
        assert!(!EngineError::EncoderLaunch("missing".into()).is_transient());
    }

    #[test]
    fn test_error_serializes_as_message() {
        let err = EngineError::InvalidState {
            operation: "pause",
            state: RecordingState::Idle,
        };
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(json, "\"Cannot pause while Idle\"");
    }
}
