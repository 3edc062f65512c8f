/**
 * ============================================================================
 * RECORDING CONFIG MODULE
 * ============================================================================
 *
 * PURPOSE: Configuration persistence for the recording engine
 *
 * FUNCTIONALITY:
 * - Load/save recording configuration to disk
 * - Default configuration when none exists
 * - Range validation before a config is used or saved
 *
 * ============================================================================
 */

use crate::recording::error::{EngineError, EngineResult};
use crate::recording::types::RecordingConfig;
use std::path::{Path, PathBuf};

// x264 presets accepted for live capture
pub const VALID_PRESETS: &[&str] = &[
    "ultrafast",
    "superfast",
    "veryfast",
    "faster",
    "fast",
    "medium",
    "slow",
];

// Get config file path
pub fn config_path() -> EngineResult<PathBuf> {
    let base = dirs::config_dir()
        .ok_or_else(|| EngineError::Config("No config directory on this platform".to_string()))?;
    Ok(base.join("remote-worker").join("recording_config.json"))
}

// Load configuration from the default location
pub fn load_config() -> EngineResult<RecordingConfig> {
    load_config_from(&config_path()?)
}

// Save configuration to the default location
pub fn save_config(config: &RecordingConfig) -> EngineResult<()> {
    save_config_to(&config_path()?, config)
}

// Load configuration from disk
pub fn load_config_from(path: &Path) -> EngineResult<RecordingConfig> {
    if !path.exists() {
        log::info!("No recording config found at {:?}, using defaults", path);
        return Ok(RecordingConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| EngineError::Config(format!("Failed to read config: {}", e)))?;

    let config: RecordingConfig = serde_json::from_str(&contents)
        .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

    config.validate()?;

    log::info!("Loaded recording config from {:?}", path);
    Ok(config)
}

// Save configuration to disk
pub fn save_config_to(path: &Path, config: &RecordingConfig) -> EngineResult<()> {
    config.validate()?;

    // Ensure directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| EngineError::Config(format!("Failed to create config dir: {}", e)))?;
    }

    let contents = serde_json::to_string_pretty(config)
        .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

    std::fs::write(path, contents)
        .map_err(|e| EngineError::Config(format!("Failed to write config: {}", e)))?;

    log::info!("Saved recording config to {:?}", path);
    Ok(())
}

impl RecordingConfig {
    // Validate ranges before the config is used
    pub fn validate(&self) -> EngineResult<()> {
        if self.framerate < 1 || self.framerate > 60 {
            return Err(EngineError::Config("Framerate must be between 1 and 60".to_string()));
        }

        if self.crf > 51 {
            return Err(EngineError::Config("CRF must be between 0 and 51".to_string()));
        }

        if !VALID_PRESETS.contains(&self.preset.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid preset '{}'. Valid options: {}",
                self.preset,
                VALID_PRESETS.join(", ")
            )));
        }

        if self.container.trim().is_empty() || self.container.contains('.') {
            return Err(EngineError::Config(
                "Container must be a bare extension such as 'mkv'".to_string(),
            ));
        }

        if self.termination_timeout_ms == 0 || self.merge_timeout_seconds == 0 {
            return Err(EngineError::Config("Timeouts must be positive".to_string()));
        }

        let shots = &self.screenshots;
        if shots.min_interval_secs == 0 || shots.min_interval_secs > shots.max_interval_secs {
            return Err(EngineError::Config(format!(
                "Screenshot interval must satisfy 0 < min <= max (got {}..{})",
                shots.min_interval_secs, shots.max_interval_secs
            )));
        }

        if shots.poll_interval_ms == 0 {
            return Err(EngineError::Config(
                "Screenshot poll interval must be positive".to_string(),
            ));
        }

        if let Some(size) = &self.capture_size {
            if self.screen_size().is_none() {
                return Err(EngineError::Config(format!(
                    "Capture size '{}' is not of the form WxH",
                    size
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::error::ErrorCode;
    use crate::recording::types::CaptureMode;

    #[test]
    fn test_config_serialization() {
        let config = RecordingConfig::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed: RecordingConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_load_missing_config_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, RecordingConfig::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("recording_config.json");

        let mut config = RecordingConfig::default();
        config.framerate = 5;
        config.capture_mode = CaptureMode::Frames;
        save_config_to(&path, &config).unwrap();

        let loaded = load_config_from(&path).unwrap();
        assert_eq!(loaded.framerate, 5);
        assert_eq!(loaded.capture_mode, CaptureMode::Frames);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recording_config.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = load_config_from(&path).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Config);
    }

    #[test]
    fn test_validate_ranges() {
        let mut config = RecordingConfig::default();
        assert!(config.validate().is_ok());

        config.framerate = 0;
        assert!(config.validate().is_err());
        config.framerate = 61;
        assert!(config.validate().is_err());
        config.framerate = 30;

        config.crf = 52;
        assert!(config.validate().is_err());
        config.crf = 23;

        config.preset = "placebo".to_string();
        assert!(config.validate().is_err());
        config.preset = "veryfast".to_string();

        config.screenshots.min_interval_secs = 2000;
        assert!(config.validate().is_err());
        config.screenshots.min_interval_secs = 600;

        config.container = String::new();
        assert!(config.validate().is_err());
        config.container = "mkv".to_string();

        config.capture_size = Some("big".to_string());
        assert!(config.validate().is_err());
        config.capture_size = Some("1280x720".to_string());
        assert!(config.validate().is_ok());
    }
}
