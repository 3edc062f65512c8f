/**
 * ============================================================================
 * ENCODER PROCESS MODULE
 * ============================================================================
 *
 * PURPOSE: Launch and supervise external FFmpeg encoder processes
 *
 * FUNCTIONALITY:
 * - EncoderDriver trait: launch, terminate, liveness
 * - EncoderProcessHandle: scoped handle that kills and reaps on drop
 * - FFmpeg argument building for screen grab, frame manifest and concat
 * - Orphan cleanup of encoders left behind by a crashed session
 *
 * GRACEFUL STOP:
 * - FFmpeg stdin is piped; writing `q` asks it to finalize the container
 * - Escalation to kill is left to the caller's timeout
 *
 * ============================================================================
 */

use crate::recording::error::{EngineError, EngineResult};
use crate::recording::ffmpeg::{FfmpegBinary, ScreenGrab};
use crate::recording::types::RecordingConfig;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use sysinfo::{Pid, System};

const STDERR_TAIL_LINES: usize = 20;
const WAIT_POLL: Duration = Duration::from_millis(20);

// =============================================================================
// Process Handles
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    // None when terminated by a signal
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

// A running encoder process
pub trait EncoderProcess: Send {
    fn id(&self) -> u32;
    fn try_wait(&mut self) -> io::Result<Option<ProcessExit>>;
    // Ask the process to finish on its own
    fn request_stop(&mut self) -> io::Result<()>;
    // Kill and reap
    fn kill(&mut self) -> io::Result<()>;
    // Recent diagnostic output
    fn diagnostics(&self) -> String {
        String::new()
    }
}

// std::process::Child with piped stdin and a stderr reader thread
pub struct ChildProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    reader: Option<JoinHandle<()>>,
}

impl ChildProcess {
    pub fn new(mut child: Child, label: &str) -> Self {
        let stdin = child.stdin.take();
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));

        // Drain stderr so FFmpeg never blocks on a full pipe
        let reader = child.stderr.take().map(|stderr| {
            let tail = stderr_tail.clone();
            let label = label.to_string();
            std::thread::spawn(move || {
                use std::io::{BufRead, BufReader};
                let reader = BufReader::new(stderr);
                for line in reader.lines() {
                    match line {
                        Ok(line) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            log::debug!("{} stderr: {}", label, line);
                            let mut tail = tail.lock().unwrap_or_else(|p| p.into_inner());
                            if tail.len() == STDERR_TAIL_LINES {
                                tail.pop_front();
                            }
                            tail.push_back(line);
                        }
                        Err(e) => {
                            log::debug!("Error reading {} stderr: {}", label, e);
                            break;
                        }
                    }
                }
            })
        });

        Self {
            child,
            stdin,
            stderr_tail,
            reader,
        }
    }

    fn join_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

impl EncoderProcess for ChildProcess {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn try_wait(&mut self) -> io::Result<Option<ProcessExit>> {
        let status = self.child.try_wait()?;
        if status.is_some() {
            self.join_reader();
        }
        Ok(status.map(|s| ProcessExit { code: s.code() }))
    }

    fn request_stop(&mut self) -> io::Result<()> {
        let Some(mut stdin) = self.stdin.take() else {
            return Ok(());
        };
        // Dropping stdin afterwards closes the pipe, which also ends FFmpeg
        match stdin.write_all(b"q\n").and_then(|_| stdin.flush()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn kill(&mut self) -> io::Result<()> {
        self.stdin.take();
        match self.child.kill() {
            Ok(()) => {}
            // Already exited
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
            Err(e) => return Err(e),
        }
        self.child.wait()?;
        self.join_reader();
        Ok(())
    }

    fn diagnostics(&self) -> String {
        let tail = self.stderr_tail.lock().unwrap_or_else(|p| p.into_inner());
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

// Scoped ownership of one encoder process
//
// Dropping a handle whose process is still running kills and reaps it.
pub struct EncoderProcessHandle {
    process: Box<dyn EncoderProcess>,
    pid: u32,
    label: String,
    exit: Option<ProcessExit>,
}

impl std::fmt::Debug for EncoderProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncoderProcessHandle")
            .field("pid", &self.pid)
            .field("label", &self.label)
            .field("exit", &self.exit)
            .finish()
    }
}

impl EncoderProcessHandle {
    pub fn new(process: Box<dyn EncoderProcess>, label: impl Into<String>) -> Self {
        let pid = process.id();
        Self {
            process,
            pid,
            label: label.into(),
            exit: None,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    // Cached exit status, if the process has been observed to exit
    pub fn exit(&self) -> Option<ProcessExit> {
        self.exit
    }

    pub fn poll_exit(&mut self) -> Option<ProcessExit> {
        if self.exit.is_none() {
            match self.process.try_wait() {
                Ok(status) => self.exit = status,
                Err(e) => log::warn!("Failed to poll {} (pid {}): {}", self.label, self.pid, e),
            }
        }
        self.exit
    }

    pub fn is_alive(&mut self) -> bool {
        self.poll_exit().is_none()
    }

    pub fn request_stop(&mut self) -> EngineResult<()> {
        if !self.is_alive() {
            return Ok(());
        }
        log::info!("Requesting {} (pid {}) to stop", self.label, self.pid);
        self.process.request_stop().map_err(|e| {
            EngineError::EncoderFailed(format!("Failed to signal pid {}: {}", self.pid, e))
        })
    }

    pub fn kill(&mut self) -> EngineResult<()> {
        if !self.is_alive() {
            return Ok(());
        }
        log::warn!("Killing {} (pid {})", self.label, self.pid);
        self.process.kill().map_err(|e| {
            EngineError::EncoderFailed(format!("Failed to kill pid {}: {}", self.pid, e))
        })?;
        self.exit = Some(self.poll_exit().unwrap_or(ProcessExit { code: None }));
        Ok(())
    }

    // Wait for exit, returning None if the process is still running at the deadline
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<ProcessExit> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(exit) = self.poll_exit() {
                return Some(exit);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(WAIT_POLL.min(deadline.saturating_duration_since(Instant::now())));
        }
    }

    pub fn diagnostics(&self) -> String {
        self.process.diagnostics()
    }
}

impl Drop for EncoderProcessHandle {
    fn drop(&mut self) {
        if self.is_alive() {
            log::warn!(
                "{} (pid {}) still running when its handle was dropped, killing",
                self.label,
                self.pid
            );
            if let Err(e) = self.process.kill() {
                log::error!("Failed to kill pid {}: {}", self.pid, e);
            }
        }
    }
}

// =============================================================================
// Encoder Driver
// =============================================================================

// What an encoder run reads from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderInput {
    // Live screen grab encoded to H.264
    Screen(ScreenGrab),
    // Concat-demuxer manifest of PNG frames with per-frame durations
    FrameManifest { manifest: PathBuf },
    // Concat-demuxer manifest of segment files, stream copied
    Concat { manifest: PathBuf },
}

impl EncoderInput {
    pub fn label(&self) -> &'static str {
        match self {
            EncoderInput::Screen(_) => "screen encoder",
            EncoderInput::FrameManifest { .. } => "frame encoder",
            EncoderInput::Concat { .. } => "segment merge",
        }
    }
}

pub trait EncoderDriver: Send + Sync {
    fn launch(&self, input: &EncoderInput, output: &Path) -> EngineResult<EncoderProcessHandle>;

    // Signal only; escalation is the caller's job
    fn terminate(&self, handle: &mut EncoderProcessHandle) -> EngineResult<()> {
        handle.request_stop()
    }

    fn is_alive(&self, handle: &mut EncoderProcessHandle) -> bool {
        handle.is_alive()
    }
}

// Launch an encoder and wait for it to finish, killing it at the deadline
pub fn run_to_completion(
    driver: &dyn EncoderDriver,
    input: &EncoderInput,
    output: &Path,
    timeout: Duration,
) -> EngineResult<ProcessExit> {
    let mut handle = driver.launch(input, output)?;
    match handle.wait_timeout(timeout) {
        Some(exit) => {
            if !exit.success() {
                log::error!(
                    "{} exited with {:?}: {}",
                    handle.label(),
                    exit.code,
                    handle.diagnostics()
                );
            }
            Ok(exit)
        }
        None => {
            let pid = handle.pid();
            handle.kill()?;
            Err(EngineError::EncoderTerminationTimeout { pid, timeout })
        }
    }
}

// FFmpeg-backed encoder driver
pub struct FfmpegEncoder {
    binary: FfmpegBinary,
    crf: u8,
    preset: String,
}

impl FfmpegEncoder {
    pub fn new(binary: FfmpegBinary, crf: u8, preset: impl Into<String>) -> Self {
        Self {
            binary,
            crf,
            preset: preset.into(),
        }
    }

    pub fn from_config(config: &RecordingConfig, binary: FfmpegBinary) -> Self {
        Self::new(binary, config.crf, config.preset.clone())
    }

    pub fn binary(&self) -> &FfmpegBinary {
        &self.binary
    }

    fn h264_args(&self) -> Vec<String> {
        vec![
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            self.preset.clone(),
            "-crf".to_string(),
            self.crf.to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
        ]
    }

    // Full FFmpeg argument list (after the binary) for one run
    pub fn build_args(&self, input: &EncoderInput, output: &Path) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-y".to_string(),
            "-nostats".to_string(),
            "-loglevel".to_string(),
            "warning".to_string(),
        ];

        match input {
            EncoderInput::Screen(grab) => {
                args.extend(grab.input_args());
                args.extend(self.h264_args());
                args.extend(["-tune".to_string(), "zerolatency".to_string()]);
            }
            EncoderInput::FrameManifest { manifest } => {
                args.extend(concat_input(manifest));
                // yuv420p needs even dimensions
                args.extend([
                    "-vf".to_string(),
                    "pad=ceil(iw/2)*2:ceil(ih/2)*2".to_string(),
                    "-fps_mode".to_string(),
                    "vfr".to_string(),
                ]);
                args.extend(self.h264_args());
            }
            EncoderInput::Concat { manifest } => {
                args.extend(concat_input(manifest));
                args.extend(["-c".to_string(), "copy".to_string()]);
            }
        }

        args.push(output.to_string_lossy().into_owned());
        args
    }
}

fn concat_input(manifest: &Path) -> Vec<String> {
    vec![
        "-f".to_string(),
        "concat".to_string(),
        "-safe".to_string(),
        "0".to_string(),
        "-i".to_string(),
        manifest.to_string_lossy().into_owned(),
    ]
}

impl EncoderDriver for FfmpegEncoder {
    fn launch(&self, input: &EncoderInput, output: &Path) -> EngineResult<EncoderProcessHandle> {
        let args = self.build_args(input, output);
        log::info!(
            "Spawning {}: {:?} {}",
            input.label(),
            self.binary.path(),
            args.join(" ")
        );

        let child = self
            .binary
            .command()
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                EngineError::EncoderLaunch(format!(
                    "Failed to spawn FFmpeg at {:?}: {}",
                    self.binary.path(),
                    e
                ))
            })?;

        let process = ChildProcess::new(child, input.label());
        let handle = EncoderProcessHandle::new(Box::new(process), input.label());
        log::info!("{} running with pid {}", input.label(), handle.pid());
        Ok(handle)
    }
}

// =============================================================================
// Orphan Cleanup
// =============================================================================

// What the orphan scan knows about one process
#[derive(Debug, Clone)]
pub struct ProcessSnapshot {
    pub pid: u32,
    pub name: String,
    pub cmd: Vec<String>,
    pub parent: Option<u32>,
}

// True when some argument is a path inside `temp_root` (whole components)
fn references_root(cmd: &[String], temp_root: &Path) -> bool {
    cmd.iter().any(|arg| Path::new(arg).starts_with(temp_root))
}

// An FFmpeg process working under `temp_root` whose parent is gone
//
// A live parent still owns the encoder (another recorder instance, or a host
// embedding this engine), so it is left alone. Init adoption (pid 0/1) counts
// as gone.
pub fn is_orphaned_encoder(
    process: &ProcessSnapshot,
    temp_root: &Path,
    parent_alive: impl Fn(u32) -> bool,
) -> bool {
    if !process.name.to_lowercase().starts_with("ffmpeg") {
        return false;
    }
    if !references_root(&process.cmd, temp_root) {
        return false;
    }
    match process.parent {
        None | Some(0) | Some(1) => true,
        Some(parent) => !parent_alive(parent),
    }
}

// Kill orphaned FFmpeg processes left in this engine's temp root
//
// Returns the pids that were terminated.
pub fn cleanup_orphaned_encoders(temp_root: &Path) -> Vec<u32> {
    if temp_root.as_os_str().is_empty() {
        return Vec::new();
    }

    log::info!("Checking for orphaned encoder processes under {:?}", temp_root);
    let mut system = System::new_all();
    system.refresh_processes();

    let own_pid = std::process::id();
    let parent_alive = |parent: u32| system.process(Pid::from_u32(parent)).is_some();
    let mut terminated = Vec::new();

    for (pid, process) in system.processes() {
        if pid.as_u32() == own_pid {
            continue;
        }
        let snapshot = ProcessSnapshot {
            pid: pid.as_u32(),
            name: process.name().to_string(),
            cmd: process.cmd().to_vec(),
            parent: process.parent().map(|p| p.as_u32()),
        };
        if !is_orphaned_encoder(&snapshot, temp_root, parent_alive) {
            continue;
        }

        log::warn!("Found orphaned encoder: {} (PID: {})", snapshot.name, pid);
        if process.kill() {
            log::info!("Terminated orphaned encoder (PID: {})", pid);
            terminated.push(snapshot.pid);
        } else {
            log::error!("Failed to terminate orphaned encoder (PID: {})", pid);
        }
    }

    terminated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::testing::FakeProcess;
    use std::sync::atomic::Ordering;

    fn encoder() -> FfmpegEncoder {
        FfmpegEncoder::new(FfmpegBinary::new("ffmpeg"), 23, "ultrafast")
    }

    #[test]
    fn test_screen_args() {
        let grab = ScreenGrab::new(15, Some(":1".to_string()), None);
        let args = encoder().build_args(&EncoderInput::Screen(grab), Path::new("/w/segment_0000.mkv"));
        assert_eq!(args[0], "-y");
        assert!(args.windows(2).any(|w| w[0] == "-c:v" && w[1] == "libx264"));
        assert!(args.windows(2).any(|w| w[0] == "-crf" && w[1] == "23"));
        assert!(args.windows(2).any(|w| w[0] == "-preset" && w[1] == "ultrafast"));
        assert!(args.windows(2).any(|w| w[0] == "-tune" && w[1] == "zerolatency"));
        assert!(args.windows(2).any(|w| w[0] == "-i" && w[1] == ":1"));
        assert_eq!(args.last().unwrap(), "/w/segment_0000.mkv");
        assert_eq!(encoder().binary().path(), Path::new("ffmpeg"));
    }

    #[test]
    fn test_concat_args_stream_copy() {
        let input = EncoderInput::Concat {
            manifest: PathBuf::from("/w/segments.txt"),
        };
        let args = encoder().build_args(&input, Path::new("/out/final.mkv"));
        let joined = args.join(" ");
        assert!(joined.contains("-f concat -safe 0 -i /w/segments.txt"));
        assert!(joined.contains("-c copy"));
        assert!(!joined.contains("libx264"));
        assert_eq!(args.last().unwrap(), "/out/final.mkv");
    }

    #[test]
    fn test_frame_manifest_args() {
        let input = EncoderInput::FrameManifest {
            manifest: PathBuf::from("/w/segment_0000_frames/frames.txt"),
        };
        let args = encoder().build_args(&input, Path::new("/w/segment_0000.mkv"));
        assert!(args.windows(2).any(|w| w[0] == "-fps_mode" && w[1] == "vfr"));
        assert!(args.windows(2).any(|w| w[0] == "-c:v" && w[1] == "libx264"));
        assert!(args.windows(2).any(|w| w[0] == "-f" && w[1] == "concat"));
    }

    #[test]
    fn test_launch_missing_binary_fails() {
        let driver = FfmpegEncoder::new(FfmpegBinary::new("/nonexistent/ffmpeg-binary"), 23, "ultrafast");
        let err = driver
            .launch(
                &EncoderInput::Concat {
                    manifest: PathBuf::from("m.txt"),
                },
                Path::new("out.mkv"),
            )
            .unwrap_err();
        assert_eq!(err.code(), crate::recording::error::ErrorCode::EncoderLaunchFailed);
    }

    #[test]
    fn test_handle_drop_kills_live_process() {
        let process = FakeProcess::new(7);
        let killed = process.killed.clone();
        let handle = EncoderProcessHandle::new(Box::new(process), "test");
        assert_eq!(handle.pid(), 7);
        drop(handle);
        assert!(killed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_handle_drop_leaves_exited_process() {
        let process = FakeProcess::new(8);
        let killed = process.killed.clone();
        let exited = process.exit.clone();
        let mut handle = EncoderProcessHandle::new(Box::new(process), "test");
        *exited.lock().unwrap() = Some(ProcessExit { code: Some(0) });
        assert_eq!(handle.exit(), None);
        assert_eq!(handle.poll_exit(), Some(ProcessExit { code: Some(0) }));
        assert_eq!(handle.exit(), Some(ProcessExit { code: Some(0) }));
        drop(handle);
        assert!(!killed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_wait_timeout_expires() {
        let mut handle = EncoderProcessHandle::new(Box::new(FakeProcess::new(9)), "test");
        let started = Instant::now();
        assert_eq!(handle.wait_timeout(Duration::from_millis(60)), None);
        assert!(started.elapsed() >= Duration::from_millis(60));
        handle.kill().unwrap();
        assert!(!handle.is_alive());
    }

    #[test]
    fn test_request_stop_ends_cooperative_process() {
        let mut handle = EncoderProcessHandle::new(Box::new(FakeProcess::new(10)), "test");
        handle.request_stop().unwrap();
        assert_eq!(
            handle.wait_timeout(Duration::from_millis(200)),
            Some(ProcessExit { code: Some(0) })
        );
    }

    #[test]
    fn test_cleanup_ignores_unrelated_processes() {
        let root = tempfile::tempdir().unwrap();
        assert!(cleanup_orphaned_encoders(root.path()).is_empty());
    }

    fn snapshot(name: &str, arg: &str, parent: Option<u32>) -> ProcessSnapshot {
        ProcessSnapshot {
            pid: 4242,
            name: name.to_string(),
            cmd: vec![name.to_string(), "-i".to_string(), arg.to_string()],
            parent,
        }
    }

    #[test]
    fn test_orphan_requires_dead_parent() {
        let root = Path::new("/tmp/remote-worker");
        let arg = "/tmp/remote-worker/session_a/segment_0000.mkv";

        assert!(!is_orphaned_encoder(&snapshot("ffmpeg", arg, Some(500)), root, |_| true));
        assert!(is_orphaned_encoder(&snapshot("ffmpeg", arg, Some(500)), root, |_| false));
        assert!(is_orphaned_encoder(&snapshot("ffmpeg", arg, Some(1)), root, |_| true));
        assert!(is_orphaned_encoder(&snapshot("ffmpeg.exe", arg, None), root, |_| true));
    }

    #[test]
    fn test_orphan_matches_whole_path_components() {
        let root = Path::new("/tmp/remote-worker");
        let sibling = "/tmp/remote-worker-other/session_a/segment_0000.mkv";
        assert!(!is_orphaned_encoder(&snapshot("ffmpeg", sibling, None), root, |_| false));
        let unrelated = "/home/me/video.mkv";
        assert!(!is_orphaned_encoder(&snapshot("ffmpeg", unrelated, None), root, |_| false));
        let inside = "/tmp/remote-worker/session_a/segments.txt";
        assert!(!is_orphaned_encoder(&snapshot("sh", inside, None), root, |_| false));
    }

    #[cfg(unix)]
    #[test]
    fn test_cleanup_spares_encoder_with_live_parent() {
        let bin = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let fake_ffmpeg = bin.path().join("ffmpeg");
        std::fs::copy("/bin/sh", &fake_ffmpeg).unwrap();

        let segment = root.path().join("session_live").join("segment_0000.mkv");
        let mut child = std::process::Command::new(&fake_ffmpeg)
            .arg("-c")
            .arg("sleep 5; true")
            .arg(&segment)
            .spawn()
            .unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let killed = cleanup_orphaned_encoders(root.path());
        assert!(!killed.contains(&child.id()));
        assert!(child.try_wait().unwrap().is_none());

        child.kill().unwrap();
        child.wait().unwrap();
    }
}
