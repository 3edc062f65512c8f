/**
 * ============================================================================
 * ACTIVITY LOG MODULE
 * ============================================================================
 *
 * PURPOSE: Record user activity events produced by the engine
 *
 * IMPLEMENTATIONS:
 * - JsonlActivityLog: append-only JSON lines file with hostname and timestamp
 * - LogActivityLog: events written to the log output only
 *
 * ============================================================================
 */

use crate::collector::ActivityLog;
use crate::recording::error::{EngineError, EngineResult};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

// One line of the activity log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityEvent {
    pub user_id: String,
    pub event: String,
    pub timestamp: String,
    pub hostname: String,
}

// Get the default activity log location
pub fn default_activity_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join("remote-worker").join("activity.jsonl"))
}

fn host() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

// Append-only JSON lines file
pub struct JsonlActivityLog {
    path: PathBuf,
    hostname: String,
    write_lock: Mutex<()>,
}

impl JsonlActivityLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            hostname: host(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl ActivityLog for JsonlActivityLog {
    fn record(&self, user_id: &str, event: &str) -> EngineResult<()> {
        let entry = ActivityEvent {
            user_id: user_id.to_string(),
            event: event.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            hostname: self.hostname.clone(),
        };
        let line = serde_json::to_string(&entry)
            .map_err(|e| EngineError::Upload(format!("Failed to serialize activity: {}", e)))?;

        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }
}

// Activity events written to the log output only
pub struct LogActivityLog;

impl ActivityLog for LogActivityLog {
    fn record(&self, user_id: &str, event: &str) -> EngineResult<()> {
        log::info!("Activity: user={} event={}", user_id, event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jsonl_appends_events() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlActivityLog::new(dir.path().join("logs").join("activity.jsonl"));
        log.record("alice", "screenshot_taken").unwrap();
        log.record("alice", "recording_started").unwrap();

        let contents = std::fs::read_to_string(log.path()).unwrap();
        let events: Vec<ActivityEvent> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "screenshot_taken");
        assert_eq!(events[1].user_id, "alice");
        assert!(chrono::DateTime::parse_from_rfc3339(&events[0].timestamp).is_ok());
        assert!(!events[0].hostname.is_empty());
    }

    #[test]
    fn test_log_activity_never_fails() {
        assert!(LogActivityLog.record("bob", "screenshot_taken").is_ok());
    }
}
