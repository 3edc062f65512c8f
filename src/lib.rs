pub mod collector;
pub mod recording;

pub use recording::error::{EngineError, EngineResult, ErrorCode};
pub use recording::manager::RecordingController;
pub use recording::types::{CaptureMode, RecordingConfig, RecordingState, RecordingStatus};
