/**
 * ============================================================================
 * RECORDING STORAGE MODULE
 * ============================================================================
 *
 * PURPOSE: Layout of a recording session's working directory
 *
 * FUNCTIONALITY:
 * - Deterministic zero-padded segment and frame names
 * - Concat manifests for merging segments and encoding frames
 * - Output extension normalization
 * - Working directory cleanup, size and recovery scan
 *
 * FILE STRUCTURE:
 * <temp_root>/
 * └── session_<uuid>/
 *     ├── segment_0000.mkv
 *     ├── segment_0001.mkv
 *     ├── segment_0002_frames/       # Frames mode, until encoded
 *     │   ├── frame_000000.png
 *     │   └── frames.txt
 *     └── segments.txt               # merge manifest
 *
 * ============================================================================
 */

use crate::recording::error::{EngineError, EngineResult};
use crate::recording::types::CapturedFrame;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use walkdir::WalkDir;

static SEGMENT_FILE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^segment_(\d{4,})\.(\w+)$").expect("valid segment regex"));

pub const SEGMENT_MANIFEST: &str = "segments.txt";
pub const FRAME_MANIFEST: &str = "frames.txt";

// Get the default root for session working directories
pub fn default_temp_root() -> PathBuf {
    std::env::temp_dir().join("remote-worker")
}

pub fn session_dir_name(session_id: &str) -> String {
    format!("session_{}", session_id)
}

// Names every file inside one session working directory
#[derive(Debug, Clone)]
pub struct SegmentFileNamer {
    work_dir: PathBuf,
    extension: String,
}

impl SegmentFileNamer {
    // Create the session working directory under temp_root
    pub fn create(temp_root: &Path, session_id: &str, extension: &str) -> EngineResult<Self> {
        let work_dir = temp_root.join(session_dir_name(session_id));
        fs::create_dir_all(&work_dir)?;
        log::info!("Created session working directory {:?}", work_dir);
        Ok(Self::for_existing(work_dir, extension))
    }

    // Attach to a directory that already exists (recovery)
    pub fn for_existing(work_dir: PathBuf, extension: &str) -> Self {
        Self {
            work_dir,
            extension: extension.trim_start_matches('.').to_string(),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn segment_path(&self, index: u32) -> PathBuf {
        self.work_dir
            .join(format!("segment_{:04}.{}", index, self.extension))
    }

    pub fn frames_dir(&self, index: u32) -> PathBuf {
        self.work_dir.join(format!("segment_{:04}_frames", index))
    }

    pub fn frame_manifest_path(&self, index: u32) -> PathBuf {
        self.frames_dir(index).join(FRAME_MANIFEST)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.work_dir.join(SEGMENT_MANIFEST)
    }
}

pub fn frame_path(frames_dir: &Path, index: u64) -> PathBuf {
    frames_dir.join(format!("frame_{:06}.png", index))
}

// Make the output extension match the container.
// "out" -> "out.mkv", "out.mkv" unchanged, "out.mp4" -> "out.mp4.mkv"
pub fn normalize_output_path(path: &Path, container: &str) -> PathBuf {
    let container = container.trim_start_matches('.');
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case(container) => path.to_path_buf(),
        None | Some("") => path.with_extension(container),
        Some(_) => {
            let mut name = path.as_os_str().to_os_string();
            name.push(".");
            name.push(container);
            PathBuf::from(name)
        }
    }
}

// Quote a path for a concat demuxer `file` directive
pub fn escape_concat_path(path: &Path) -> String {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    absolute.to_string_lossy().replace('\'', r"'\''")
}

// Write via temp file + rename so a crash never leaves half a manifest
fn write_atomic(path: &Path, contents: &str) -> EngineResult<()> {
    let temp_path = path.with_extension("txt.tmp");
    fs::write(&temp_path, contents)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

// Write the merge manifest listing segment files in order
pub fn write_segment_manifest(manifest: &Path, files: &[PathBuf]) -> EngineResult<()> {
    let mut contents = String::new();
    for file in files {
        let _ = writeln!(contents, "file '{}'", escape_concat_path(file));
    }
    write_atomic(manifest, &contents)?;
    log::debug!("Wrote segment manifest {:?} ({} files)", manifest, files.len());
    Ok(())
}

// Write a frame manifest with per-frame durations from capture timestamps
//
// The last frame gets `last_duration` and is listed twice, otherwise the
// concat demuxer drops its duration.
pub fn write_frame_manifest(
    manifest: &Path,
    frames: &[CapturedFrame],
    last_duration: Duration,
) -> EngineResult<()> {
    let Some(last) = frames.last() else {
        return Err(EngineError::EncoderFailed(
            "No frames captured for segment".to_string(),
        ));
    };

    let mut contents = String::new();
    for pair in frames.windows(2) {
        let gap = (pair[1].captured_at - pair[0].captured_at)
            .to_std()
            .unwrap_or_default()
            .max(Duration::from_millis(1));
        let _ = writeln!(contents, "file '{}'", escape_concat_path(&pair[0].path));
        let _ = writeln!(contents, "duration {:.6}", gap.as_secs_f64());
    }
    let _ = writeln!(contents, "file '{}'", escape_concat_path(&last.path));
    let _ = writeln!(contents, "duration {:.6}", last_duration.as_secs_f64());
    let _ = writeln!(contents, "file '{}'", escape_concat_path(&last.path));

    write_atomic(manifest, &contents)
}

// Remove a working directory; missing directories are fine
pub fn remove_work_dir(path: &Path) -> EngineResult<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => {
            log::info!("Removed working directory {:?}", path);
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

// Calculate total bytes under a directory
pub fn directory_size(path: &Path) -> u64 {
    if !path.exists() {
        return 0;
    }

    WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

// List segment files of a working directory in index order
pub fn list_segment_files(work_dir: &Path) -> EngineResult<Vec<(u32, PathBuf)>> {
    let mut segments: Vec<(u32, PathBuf)> = fs::read_dir(work_dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|e| {
            let name = e.file_name();
            let caps = SEGMENT_FILE_RE.captures(name.to_str()?)?;
            let index = caps.get(1)?.as_str().parse().ok()?;
            Some((index, e.path()))
        })
        .collect();

    segments.sort_by_key(|(index, _)| *index);
    Ok(segments)
}

// Session directories left behind by failed merges or crashes
pub fn recoverable_sessions(temp_root: &Path) -> Vec<PathBuf> {
    if !temp_root.exists() {
        return Vec::new();
    }

    WalkDir::new(temp_root)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .filter(|e| e.file_name().to_string_lossy().starts_with("session_"))
        .map(|e| e.into_path())
        .filter(|dir| {
            list_segment_files(dir)
                .map(|files| !files.is_empty())
                .unwrap_or(false)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_segment_names_are_zero_padded() {
        let root = tempfile::tempdir().unwrap();
        let namer = SegmentFileNamer::create(root.path(), "abc", "mkv").unwrap();
        assert!(namer.work_dir().is_dir());
        assert!(namer.work_dir().ends_with("session_abc"));
        assert_eq!(namer.extension(), "mkv");
        assert!(namer.segment_path(0).ends_with("segment_0000.mkv"));
        assert!(namer.segment_path(12).ends_with("segment_0012.mkv"));
        assert!(namer.frames_dir(3).ends_with("segment_0003_frames"));
        assert!(namer.manifest_path().ends_with("segments.txt"));
        assert!(frame_path(&namer.frames_dir(0), 7).ends_with("frame_000007.png"));
    }

    #[test]
    fn test_normalize_output_path() {
        assert_eq!(
            normalize_output_path(Path::new("/tmp/out"), "mkv"),
            PathBuf::from("/tmp/out.mkv")
        );
        assert_eq!(
            normalize_output_path(Path::new("/tmp/out.mkv"), "mkv"),
            PathBuf::from("/tmp/out.mkv")
        );
        assert_eq!(
            normalize_output_path(Path::new("/tmp/out.MKV"), "mkv"),
            PathBuf::from("/tmp/out.MKV")
        );
        assert_eq!(
            normalize_output_path(Path::new("/tmp/out.mp4"), "mkv"),
            PathBuf::from("/tmp/out.mp4.mkv")
        );
    }

    #[test]
    fn test_escape_concat_path() {
        let escaped = escape_concat_path(Path::new("/tmp/it's here/seg.mkv"));
        assert_eq!(escaped, r"/tmp/it'\''s here/seg.mkv");
    }

    #[test]
    fn test_segment_manifest_order() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join(SEGMENT_MANIFEST);
        let files = vec![dir.path().join("segment_0000.mkv"), dir.path().join("segment_0001.mkv")];
        write_segment_manifest(&manifest, &files).unwrap();

        let contents = fs::read_to_string(&manifest).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("segment_0000.mkv'"));
        assert!(lines[1].ends_with("segment_0001.mkv'"));
        assert!(!dir.path().join("segments.txt.tmp").exists());
    }

    #[test]
    fn test_frame_manifest_durations() {
        let dir = tempfile::tempdir().unwrap();
        let t0 = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let frames: Vec<CapturedFrame> = [0i64, 100, 350]
            .iter()
            .enumerate()
            .map(|(i, ms)| CapturedFrame {
                index: i as u64,
                path: frame_path(dir.path(), i as u64),
                captured_at: t0 + chrono::Duration::milliseconds(*ms),
            })
            .collect();

        let manifest = dir.path().join(FRAME_MANIFEST);
        write_frame_manifest(&manifest, &frames, Duration::from_millis(200)).unwrap();
        let contents = fs::read_to_string(&manifest).unwrap();
        let durations: Vec<&str> = contents
            .lines()
            .filter_map(|l| l.strip_prefix("duration "))
            .collect();
        assert_eq!(durations, vec!["0.100000", "0.250000", "0.200000"]);
        // Last frame repeated
        let files: Vec<&str> = contents.lines().filter(|l| l.starts_with("file ")).collect();
        assert_eq!(files.len(), 4);
        assert_eq!(files[2], files[3]);
    }

    #[test]
    fn test_frame_manifest_requires_frames() {
        let dir = tempfile::tempdir().unwrap();
        let err = write_frame_manifest(&dir.path().join(FRAME_MANIFEST), &[], Duration::from_secs(1))
            .unwrap_err();
        assert_eq!(err.code(), crate::recording::error::ErrorCode::EncoderFailed);
    }

    #[test]
    fn test_remove_work_dir_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("session_x");
        fs::create_dir_all(dir.join("nested")).unwrap();
        fs::write(dir.join("nested").join("f"), b"1234").unwrap();
        assert_eq!(directory_size(&dir), 4);

        remove_work_dir(&dir).unwrap();
        assert!(!dir.exists());
        remove_work_dir(&dir).unwrap();
        assert_eq!(directory_size(&dir), 0);
    }

    #[test]
    fn test_list_segment_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["segment_0002.mkv", "segment_0000.mkv", "segments.txt", "segment_0001.mkv"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        fs::create_dir(dir.path().join("segment_0003_frames")).unwrap();

        let indices: Vec<u32> = list_segment_files(dir.path())
            .unwrap()
            .into_iter()
            .map(|(i, _)| i)
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_recoverable_sessions() {
        let root = tempfile::tempdir().unwrap();
        let with_segments = root.path().join("session_a");
        let empty = root.path().join("session_b");
        let unrelated = root.path().join("other");
        for dir in [&with_segments, &empty, &unrelated] {
            fs::create_dir_all(dir).unwrap();
        }
        fs::write(with_segments.join("segment_0000.mkv"), b"x").unwrap();
        fs::write(unrelated.join("segment_0000.mkv"), b"x").unwrap();

        assert_eq!(recoverable_sessions(root.path()), vec![with_segments]);
    }
}
