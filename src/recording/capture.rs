/**
 * ============================================================================
 * RECORDING CAPTURE MODULE
 * ============================================================================
 *
 * PURPOSE: Still-image screen capture shared by the frame loop and screenshots
 *
 * FUNCTIONALITY:
 * - FrameSource trait: one still of the current display as RGBA or PNG
 * - FFmpeg single-frame grab (default on every platform)
 * - Native scap capture (cargo feature `native-capture`)
 * - CaptureDevice: serializes captures and fires the screenshot callback
 *
 * ============================================================================
 */

use crate::recording::error::{EngineError, EngineResult};
use crate::recording::ffmpeg::{FfmpegBinary, ScreenGrab};
use crate::recording::types::RecordingConfig;
use image::{ImageFormat, RgbaImage};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

// Callback invoked with the path of every screenshot taken through the device
pub type ScreenshotCallback = Arc<dyn Fn(&Path) + Send + Sync>;

// =============================================================================
// Frame Sources
// =============================================================================

pub trait FrameSource: Send {
    fn name(&self) -> &'static str;

    // Capture the current display into memory
    fn capture_still(&mut self) -> EngineResult<RgbaImage>;

    // Capture the current display into a PNG file
    fn capture_frame_to_file(&mut self, path: &Path) -> EngineResult<PathBuf> {
        let image = self.capture_still()?;
        save_png(&image, path)?;
        Ok(path.to_path_buf())
    }
}

// Write an RGBA buffer as PNG, creating the parent directory
pub fn save_png(image: &RgbaImage, path: &Path) -> EngineResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| EngineError::CaptureWrite {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    }

    image
        .save_with_format(path, ImageFormat::Png)
        .map_err(|e| EngineError::CaptureWrite {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

// Single-frame grab through FFmpeg
pub struct FfmpegFrameSource {
    binary: FfmpegBinary,
    grab: ScreenGrab,
}

impl FfmpegFrameSource {
    pub fn new(binary: FfmpegBinary, grab: ScreenGrab) -> Self {
        Self { binary, grab }
    }

    fn grab_args(&self) -> Vec<String> {
        let mut args = vec!["-loglevel".to_string(), "error".to_string()];
        args.extend(self.grab.input_args());
        args.extend(["-frames:v".to_string(), "1".to_string()]);
        args
    }

    fn run(&self, extra: &[&str], output: &str) -> EngineResult<std::process::Output> {
        let output = self
            .binary
            .command()
            .args(self.grab_args())
            .args(extra)
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| {
                EngineError::CaptureUnavailable(format!(
                    "Failed to run FFmpeg at {:?}: {}",
                    self.binary.path(),
                    e
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::CaptureUnavailable(format!(
                "Cannot grab {}: {}",
                self.grab.device(),
                stderr.trim()
            )));
        }

        Ok(output)
    }
}

impl FrameSource for FfmpegFrameSource {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn capture_still(&mut self) -> EngineResult<RgbaImage> {
        let output = self.run(&["-f", "image2pipe", "-c:v", "png"], "pipe:1")?;
        let image = image::load_from_memory_with_format(&output.stdout, ImageFormat::Png)
            .map_err(|e| EngineError::CaptureUnavailable(format!("Undecodable grab: {}", e)))?;
        Ok(image.to_rgba8())
    }

    fn capture_frame_to_file(&mut self, path: &Path) -> EngineResult<PathBuf> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::CaptureWrite {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        }

        let target = path.to_string_lossy().into_owned();
        self.run(&["-update", "1", "-y"], &target)?;

        // FFmpeg can exit cleanly without producing the image on a full disk
        if !path.is_file() {
            return Err(EngineError::CaptureWrite {
                path: path.to_path_buf(),
                reason: "FFmpeg produced no output".to_string(),
            });
        }
        Ok(path.to_path_buf())
    }
}

#[cfg(feature = "native-capture")]
mod native {
    use super::*;
    use scap::{
        capturer::{Capturer, Options},
        frame::{Frame, FrameType},
        Target,
    };
    use std::time::{Duration, Instant};

    // Native capture through scap; a capturer is built per still
    pub struct ScapFrameSource {
        display_index: usize,
    }

    impl ScapFrameSource {
        pub fn new(display_index: usize) -> Self {
            Self { display_index }
        }

        pub fn available() -> bool {
            scap::is_supported() && scap::has_permission()
        }
    }

    impl FrameSource for ScapFrameSource {
        fn name(&self) -> &'static str {
            "scap"
        }

        fn capture_still(&mut self) -> EngineResult<RgbaImage> {
            if !scap::is_supported() {
                return Err(EngineError::CaptureUnavailable(
                    "Screen capture not supported on this platform".to_string(),
                ));
            }
            if !scap::has_permission() {
                return Err(EngineError::CaptureUnavailable(
                    "Screen recording permission not granted".to_string(),
                ));
            }

            let target = scap::get_all_targets()
                .into_iter()
                .filter(|t| matches!(t, Target::Display(_)))
                .nth(self.display_index)
                .ok_or_else(|| {
                    EngineError::CaptureUnavailable(format!(
                        "Display {} not found",
                        self.display_index
                    ))
                })?;

            let options = Options {
                fps: 30,
                target: Some(target),
                show_cursor: true,
                show_highlight: false,
                excluded_targets: None,
                output_type: FrameType::BGRAFrame,
                output_resolution: scap::capturer::Resolution::Captured,
                ..Default::default()
            };

            let mut capturer = Capturer::build(options).map_err(|e| {
                EngineError::CaptureUnavailable(format!("Failed to create capturer: {:?}", e))
            })?;
            capturer.start_capture();
            let result = first_frame(&mut capturer);
            capturer.stop_capture();
            result
        }
    }

    fn first_frame(capturer: &mut Capturer) -> EngineResult<RgbaImage> {
        let start = Instant::now();
        let timeout = Duration::from_secs(5);

        while start.elapsed() < timeout {
            match capturer.get_next_frame() {
                Ok(frame) => {
                    let converted = match frame {
                        Frame::BGRA(f) => bgrx_to_rgba(f.width as u32, f.height as u32, &f.data),
                        Frame::BGR0(f) => bgrx_to_rgba(f.width as u32, f.height as u32, &f.data),
                        Frame::BGRx(f) => bgrx_to_rgba(f.width as u32, f.height as u32, &f.data),
                        Frame::RGBx(f) => rgbx_to_rgba(f.width as u32, f.height as u32, &f.data),
                        _ => continue,
                    };
                    // Empty frames show up while the capturer warms up
                    if let Some(image) = converted {
                        return Ok(image);
                    }
                }
                Err(_) => std::thread::sleep(Duration::from_millis(20)),
            }
        }

        Err(EngineError::CaptureUnavailable(format!(
            "Timeout waiting for first frame after {:.1}s",
            timeout.as_secs_f32()
        )))
    }

    pub(super) fn bgrx_to_rgba(width: u32, height: u32, data: &[u8]) -> Option<RgbaImage> {
        if data.len() != (width * height * 4) as usize || data.is_empty() {
            return None;
        }
        let pixels = data
            .chunks_exact(4)
            .flat_map(|px| [px[2], px[1], px[0], 255])
            .collect();
        RgbaImage::from_raw(width, height, pixels)
    }

    pub(super) fn rgbx_to_rgba(width: u32, height: u32, data: &[u8]) -> Option<RgbaImage> {
        if data.len() != (width * height * 4) as usize || data.is_empty() {
            return None;
        }
        let pixels = data
            .chunks_exact(4)
            .flat_map(|px| [px[0], px[1], px[2], 255])
            .collect();
        RgbaImage::from_raw(width, height, pixels)
    }
}

#[cfg(feature = "native-capture")]
pub use native::ScapFrameSource;

// Pick the capture backend for this build
pub fn default_frame_source(config: &RecordingConfig, binary: FfmpegBinary) -> Box<dyn FrameSource> {
    #[cfg(feature = "native-capture")]
    {
        if ScapFrameSource::available() {
            log::info!("Using native scap frame source");
            return Box::new(ScapFrameSource::new(0));
        }
        log::warn!("Native capture unavailable, falling back to FFmpeg grab");
    }

    let grab = ScreenGrab::new(1, config.screen_device.clone(), config.screen_size());
    Box::new(FfmpegFrameSource::new(binary, grab))
}

// =============================================================================
// Capture Device
// =============================================================================

// The one capture instance of a controller
pub struct CaptureDevice {
    source: Mutex<Box<dyn FrameSource>>,
    callback: RwLock<Option<ScreenshotCallback>>,
}

impl CaptureDevice {
    pub fn new(source: Box<dyn FrameSource>) -> Self {
        Self {
            source: Mutex::new(source),
            callback: RwLock::new(None),
        }
    }

    pub fn from_config(config: &RecordingConfig, binary: FfmpegBinary) -> Self {
        Self::new(default_frame_source(config, binary))
    }

    fn lock_source(&self) -> MutexGuard<'_, Box<dyn FrameSource>> {
        self.source.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn source_name(&self) -> &'static str {
        self.lock_source().name()
    }

    pub fn capture_still(&self) -> EngineResult<RgbaImage> {
        self.lock_source().capture_still()
    }

    pub fn capture_frame_to_file(&self, path: &Path) -> EngineResult<PathBuf> {
        self.lock_source().capture_frame_to_file(path)
    }

    // Capture a screenshot file and notify the registered callback
    pub fn capture_screenshot(&self, path: &Path) -> EngineResult<PathBuf> {
        let written = self.capture_frame_to_file(path)?;

        // Capture lock is released here; the callback may capture again
        let callback = self
            .callback
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(callback) = callback {
            callback(&written);
        }

        Ok(written)
    }

    pub fn set_screenshot_callback(&self, callback: Option<ScreenshotCallback>) {
        *self
            .callback
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = callback;
    }
}
