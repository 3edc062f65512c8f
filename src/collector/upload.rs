/**
 * ============================================================================
 * SCREENSHOT UPLOAD MODULE
 * ============================================================================
 *
 * PURPOSE: Deliver screenshots to the monitoring server
 *
 * IMPLEMENTATIONS:
 * - HttpUploader: multipart POST with optional basic auth
 * - LocalCopyUploader: copy into a directory tree (shared drive, tests)
 * - NoopUploader: uploads disabled
 *
 * The engine calls upload() from plain OS threads, so the HTTP client drives
 * its own current-thread tokio runtime. Calls made from inside another runtime
 * are driven on a short-lived helper thread.
 *
 * ============================================================================
 */

use crate::collector::ScreenshotUploader;
use crate::recording::error::{EngineError, EngineResult};
use crate::recording::types::UploadConfig;
use reqwest::multipart::{Form, Part};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

// Build the uploader selected by the config
pub fn uploader_from_config(config: &UploadConfig) -> EngineResult<Arc<dyn ScreenshotUploader>> {
    Ok(match config {
        UploadConfig::Disabled => Arc::new(NoopUploader),
        UploadConfig::Http {
            url,
            username,
            password,
        } => Arc::new(HttpUploader::new(
            url.clone(),
            username.clone(),
            password.clone(),
        )?),
        UploadConfig::LocalCopy { root } => Arc::new(LocalCopyUploader::new(root.clone())),
    })
}

fn file_name(local: &Path) -> EngineResult<String> {
    local
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| EngineError::Upload(format!("{:?} has no file name", local)))
}

// =============================================================================
// HTTP
// =============================================================================

pub struct HttpUploader {
    url: String,
    username: Option<String>,
    password: Option<String>,
    client: reqwest::Client,
    runtime: tokio::runtime::Runtime,
}

impl HttpUploader {
    pub fn new(
        url: String,
        username: Option<String>,
        password: Option<String>,
    ) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(UPLOAD_TIMEOUT)
            .build()
            .map_err(|e| EngineError::Upload(format!("Failed to create HTTP client: {}", e)))?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        Ok(Self {
            url,
            username,
            password,
            client,
            runtime,
        })
    }

    async fn send(&self, name: String, bytes: Vec<u8>, remote_dir: &str) -> EngineResult<()> {
        let part = Part::bytes(bytes)
            .file_name(name)
            .mime_str("image/png")
            .map_err(|e| EngineError::Upload(format!("Invalid mime type: {}", e)))?;
        let form = Form::new()
            .text("remote_dir", remote_dir.to_string())
            .part("file", part);

        let mut request = self.client.post(&self.url).multipart(form);
        if let Some(user) = &self.username {
            request = request.basic_auth(user, self.password.as_ref());
        }

        let response = tokio::time::timeout(UPLOAD_TIMEOUT, request.send())
            .await
            .map_err(|_| EngineError::Upload(format!("Upload timed out after {:?}", UPLOAD_TIMEOUT)))?
            .map_err(|e| EngineError::Upload(format!("Failed to send upload: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(EngineError::Upload(format!(
                "Server returned {}: {}",
                status, body
            )));
        }

        Ok(())
    }
}

impl ScreenshotUploader for HttpUploader {
    fn name(&self) -> &'static str {
        "http"
    }

    fn upload(&self, local: &Path, remote_dir: &str) -> EngineResult<()> {
        let name = file_name(local)?;
        let bytes = std::fs::read(local)?;
        log::info!(
            "Uploading {} ({} bytes) to {} [{}]",
            name,
            bytes.len(),
            self.url,
            remote_dir
        );

        // block_on panics on a thread already inside a runtime (async hosts)
        if tokio::runtime::Handle::try_current().is_err() {
            return self.runtime.block_on(self.send(name, bytes, remote_dir));
        }
        std::thread::scope(|scope| {
            scope
                .spawn(move || self.runtime.block_on(self.send(name, bytes, remote_dir)))
                .join()
                .unwrap_or_else(|_| Err(EngineError::Upload("Upload thread panicked".to_string())))
        })
    }
}

// =============================================================================
// Local copy
// =============================================================================

pub struct LocalCopyUploader {
    root: PathBuf,
}

impl LocalCopyUploader {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    // Where a screenshot lands for a given remote directory
    pub fn destination(&self, local: &Path, remote_dir: &str) -> EngineResult<PathBuf> {
        let relative = remote_dir.trim_matches('/');
        Ok(self.root.join(relative).join(file_name(local)?))
    }
}

impl ScreenshotUploader for LocalCopyUploader {
    fn name(&self) -> &'static str {
        "local-copy"
    }

    fn upload(&self, local: &Path, remote_dir: &str) -> EngineResult<()> {
        let dest = self.destination(local, remote_dir)?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::Upload(format!("Failed to create {:?}: {}", parent, e)))?;
        }
        std::fs::copy(local, &dest)
            .map_err(|e| EngineError::Upload(format!("Failed to copy to {:?}: {}", dest, e)))?;
        log::info!("Copied screenshot to {:?}", dest);
        Ok(())
    }
}

pub struct NoopUploader;

impl ScreenshotUploader for NoopUploader {
    fn name(&self) -> &'static str {
        "disabled"
    }

    fn upload(&self, local: &Path, _remote_dir: &str) -> EngineResult<()> {
        log::debug!("Uploads disabled, keeping {:?} locally", local);
        Ok(())
    }
}
