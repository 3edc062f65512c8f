/**
 * ============================================================================
 * FFMPEG BINARY MODULE
 * ============================================================================
 *
 * PURPOSE: Locate the FFmpeg binary and describe the platform screen grab
 *
 * FUNCTIONALITY:
 * - Resolve FFmpeg: configured path, REMOTE_WORKER_FFMPEG, bundled copy, PATH
 * - Version check used by the `check` command
 * - Per-platform grab input arguments (x11grab, gdigrab, avfoundation)
 *
 * BUNDLED LAYOUT:
 * - <exe dir>/resources/ffmpeg/{platform}/{arch}/ffmpeg[.exe]
 *
 * ============================================================================
 */

use crate::recording::error::{EngineError, EngineResult};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

pub const FFMPEG_ENV_VAR: &str = "REMOTE_WORKER_FFMPEG";

static VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"ffmpeg version (\S+)").expect("valid version regex"));

// =============================================================================
// Binary Resolution
// =============================================================================

// Get platform-specific FFmpeg binary name and subdirectory
pub fn ffmpeg_platform_info() -> (&'static str, &'static str) {
    #[cfg(target_os = "windows")]
    {
        ("windows/x86_64", "ffmpeg.exe")
    }
    #[cfg(target_os = "macos")]
    {
        #[cfg(target_arch = "aarch64")]
        {
            ("darwin/aarch64", "ffmpeg")
        }
        #[cfg(not(target_arch = "aarch64"))]
        {
            ("darwin/x86_64", "ffmpeg")
        }
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        #[cfg(target_arch = "aarch64")]
        {
            ("linux/aarch64", "ffmpeg")
        }
        #[cfg(not(target_arch = "aarch64"))]
        {
            ("linux/x86_64", "ffmpeg")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FfmpegBinary {
    path: PathBuf,
}

impl FfmpegBinary {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    // Resolve the FFmpeg binary
    //
    // Searches in order:
    // 1. Path from the recording config
    // 2. REMOTE_WORKER_FFMPEG environment variable
    // 3. Bundled: {exe_dir}/resources/ffmpeg/{platform}/{arch}/ffmpeg
    // 4. ffmpeg on PATH
    pub fn resolve(configured: Option<&Path>) -> Self {
        if let Some(path) = configured {
            if path.exists() {
                log::info!("FFmpeg from config: {:?}", path);
                return Self::new(path);
            }
            log::warn!("Configured FFmpeg {:?} does not exist, searching", path);
        }

        if let Some(path) = std::env::var_os(FFMPEG_ENV_VAR).map(PathBuf::from) {
            if path.exists() {
                log::info!("FFmpeg from {}: {:?}", FFMPEG_ENV_VAR, path);
                return Self::new(path);
            }
            log::warn!("{} points at missing file {:?}", FFMPEG_ENV_VAR, path);
        }

        let (platform_subdir, bin_name) = ffmpeg_platform_info();

        if let Some(exe_dir) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
        {
            let bundled = exe_dir
                .join("resources")
                .join("ffmpeg")
                .join(platform_subdir)
                .join(bin_name);
            if bundled.exists() {
                log::info!("FFmpeg found at bundled path: {:?}", bundled);
                return Self::new(bundled);
            }
        }

        if let Some(found) = find_on_path(bin_name) {
            log::info!("FFmpeg found on PATH: {:?}", found);
            return Self::new(found);
        }

        // Let the spawn report the failure with a useful message
        log::warn!("FFmpeg not found, falling back to bare '{}'", bin_name);
        Self::new(bin_name)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.path);
        cmd.arg("-hide_banner");
        cmd
    }

    // Check that FFmpeg runs and report its version
    pub fn check(&self) -> EngineResult<String> {
        let output = Command::new(&self.path)
            .arg("-version")
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .map_err(|e| {
                EngineError::EncoderLaunch(format!(
                    "FFmpeg failed to execute: {}. Path: {:?}",
                    e, self.path
                ))
            })?;

        if !output.status.success() {
            return Err(EngineError::EncoderLaunch(format!(
                "FFmpeg -version exited with {:?}",
                output.status.code()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let version = parse_version(&stdout).unwrap_or_else(|| "unknown".to_string());
        log::info!("FFmpeg check passed: {:?} (version {})", self.path, version);
        Ok(version)
    }
}

fn find_on_path(bin_name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(bin_name))
        .find(|candidate| candidate.is_file())
}

// Extract the version token from `ffmpeg -version` output
pub fn parse_version(output: &str) -> Option<String> {
    VERSION_RE
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

// =============================================================================
// Screen Grab Input
// =============================================================================

// Platform default grab target
pub fn default_screen_device() -> String {
    #[cfg(target_os = "windows")]
    {
        "desktop".to_string()
    }
    #[cfg(target_os = "macos")]
    {
        "1:none".to_string()
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        std::env::var("DISPLAY")
            .ok()
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| ":0.0".to_string())
    }
}

fn grab_format() -> &'static str {
    #[cfg(target_os = "windows")]
    {
        "gdigrab"
    }
    #[cfg(target_os = "macos")]
    {
        "avfoundation"
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        "x11grab"
    }
}

// FFmpeg screen grab input description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenGrab {
    pub fps: u8,
    pub device: Option<String>,
    pub size: Option<(u32, u32)>,
}

impl ScreenGrab {
    pub fn new(fps: u8, device: Option<String>, size: Option<(u32, u32)>) -> Self {
        Self { fps, device, size }
    }

    pub fn device(&self) -> String {
        self.device.clone().unwrap_or_else(default_screen_device)
    }

    // Input arguments placed before the output options
    pub fn input_args(&self) -> Vec<String> {
        let mut args = vec![
            "-f".to_string(),
            grab_format().to_string(),
            "-framerate".to_string(),
            self.fps.max(1).to_string(),
        ];

        #[cfg(target_os = "macos")]
        args.extend(["-capture_cursor".to_string(), "1".to_string()]);

        if let Some((w, h)) = self.size {
            args.push("-video_size".to_string());
            args.push(format!("{}x{}", w, h));
        }

        args.push("-i".to_string());
        args.push(self.device());
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ffmpeg_platform_info() {
        let (subdir, name) = ffmpeg_platform_info();
        assert!(!subdir.is_empty());
        assert!(!name.is_empty());
        #[cfg(target_os = "windows")]
        assert!(name.ends_with(".exe"));
    }

    #[test]
    fn test_parse_version() {
        let out = "ffmpeg version 6.1.1-3ubuntu5 Copyright (c) 2000-2023 the FFmpeg developers\n";
        assert_eq!(parse_version(out), Some("6.1.1-3ubuntu5".to_string()));
        assert_eq!(parse_version("not ffmpeg"), None);
    }

    #[test]
    fn test_resolve_prefers_existing_configured_path() {
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("ffmpeg-custom");
        std::fs::write(&fake, b"").unwrap();
        let binary = FfmpegBinary::resolve(Some(&fake));
        assert_eq!(binary.path(), fake.as_path());
    }

    #[test]
    fn test_resolve_never_fails() {
        let binary = FfmpegBinary::resolve(Some(Path::new("/definitely/not/here/ffmpeg")));
        assert!(!binary.path().as_os_str().is_empty());
    }

    #[test]
    fn test_screen_grab_args() {
        let grab = ScreenGrab::new(15, Some("custom".to_string()), Some((1280, 720)));
        let args = grab.input_args();
        assert_eq!(args[0], "-f");
        assert_eq!(args[1], grab_format());
        assert!(args.windows(2).any(|w| w[0] == "-framerate" && w[1] == "15"));
        assert!(args.windows(2).any(|w| w[0] == "-video_size" && w[1] == "1280x720"));
        assert_eq!(args[args.len() - 2], "-i");
        assert_eq!(args[args.len() - 1], "custom");
    }

    #[test]
    fn test_screen_grab_default_device() {
        let grab = ScreenGrab::new(0, None, None);
        let args = grab.input_args();
        assert!(args.windows(2).any(|w| w[0] == "-framerate" && w[1] == "1"));
        assert!(!args.contains(&"-video_size".to_string()));
        assert_eq!(args[args.len() - 1], default_screen_device());
    }
}
