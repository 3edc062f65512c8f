/**
 * ============================================================================
 * COLLECTOR MODULE
 * ============================================================================
 *
 * PURPOSE: Collaborators that receive what the recording engine produces
 *
 * ARCHITECTURE:
 * - upload: Screenshot delivery (HTTP multipart, local copy, disabled)
 * - activity: Append-only activity log (JSON lines or plain log output)
 *
 * Both are fire-and-forget from the engine's point of view: failures are
 * logged by the caller and never retried.
 *
 * ============================================================================
 */

pub mod activity;
pub mod upload;

use crate::recording::error::EngineResult;
use crate::recording::types::RecordingConfig;
use std::path::Path;
use std::sync::Arc;

pub use activity::{JsonlActivityLog, LogActivityLog};
pub use upload::{uploader_from_config, HttpUploader, LocalCopyUploader, NoopUploader};

// Sends a captured screenshot to its destination
pub trait ScreenshotUploader: Send + Sync {
    fn name(&self) -> &'static str;
    fn upload(&self, local: &Path, remote_dir: &str) -> EngineResult<()>;
}

// Records user activity events such as `screenshot_taken`
pub trait ActivityLog: Send + Sync {
    fn record(&self, user_id: &str, event: &str) -> EngineResult<()>;
}

// Everything the screenshot path reports to
#[derive(Clone)]
pub struct Collaborators {
    pub uploader: Arc<dyn ScreenshotUploader>,
    pub activity: Arc<dyn ActivityLog>,
    pub user_id: String,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            uploader: Arc::new(NoopUploader),
            activity: Arc::new(LogActivityLog),
            user_id: whoami(),
        }
    }
}

impl Collaborators {
    pub fn from_config(config: &RecordingConfig, user_id: Option<String>) -> EngineResult<Self> {
        let activity: Arc<dyn ActivityLog> = match activity::default_activity_path() {
            Some(path) => Arc::new(JsonlActivityLog::new(path)),
            None => Arc::new(LogActivityLog),
        };

        Ok(Self {
            uploader: uploader_from_config(&config.upload)?,
            activity,
            user_id: user_id.unwrap_or_else(whoami),
        })
    }
}

// Fallback user id when none was supplied
fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
