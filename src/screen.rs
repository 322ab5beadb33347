//! Screenshot provider: grab the display, shrink it to the logical
//! resolution, encode it for the model.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, ImageEncoder};
use tracing::debug;
use uuid::Uuid;

use crate::display::{DisplayProfile, Resolution};
use crate::error::CaptureError;
use crate::retry::RetryPolicy;
use crate::types::ImageArtifact;

/// Source of raw frames of the full physical display.
#[async_trait]
pub trait ScreenCapturer: Send + Sync {
    async fn grab(&self) -> Result<DynamicImage, CaptureError>;
}

/// macOS `screencapture`, one scratch file per call.
pub struct ScreencaptureCli {
    scratch_dir: PathBuf,
}

impl ScreencaptureCli {
    pub fn new() -> Self {
        Self {
            scratch_dir: std::env::temp_dir(),
        }
    }
}

impl Default for ScreencaptureCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScreenCapturer for ScreencaptureCli {
    async fn grab(&self) -> Result<DynamicImage, CaptureError> {
        let path = self
            .scratch_dir
            .join(format!("screenshot_{}.png", Uuid::new_v4().simple()));

        let output = tokio::process::Command::new("screencapture")
            .arg("-x")
            .arg("-t")
            .arg("png")
            .arg(&path)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CaptureError::Unavailable(format!("failed to run screencapture: {e}")))?;

        if !output.status.success() {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(CaptureError::Unavailable(format!(
                "screencapture exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let bytes = read_scratch(&path).await?;

        tokio::task::spawn_blocking(move || image::load_from_memory(&bytes))
            .await
            .map_err(|e| CaptureError::Decode(e.to_string()))?
            .map_err(|e| CaptureError::Decode(e.to_string()))
    }
}

/// Reads and deletes a scratch capture, whatever the read outcome.
async fn read_scratch(path: &Path) -> Result<Vec<u8>, CaptureError> {
    let read = tokio::fs::read(path).await;
    let _ = tokio::fs::remove_file(path).await;
    match read {
        Ok(bytes) => Ok(bytes),
        // A locked session exits 0 without writing anything.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CaptureError::Unavailable(
            "screencapture produced no image (is the session locked?)".into(),
        )),
        Err(e) => Err(e.into()),
    }
}

/// Captures are independent: no buffer is shared between calls.
#[derive(Clone)]
pub struct ScreenshotProvider {
    capturer: Arc<dyn ScreenCapturer>,
    retry: RetryPolicy,
}

impl ScreenshotProvider {
    pub fn new(capturer: Arc<dyn ScreenCapturer>, retry: RetryPolicy) -> Self {
        Self { capturer, retry }
    }

    pub async fn capture(&self, profile: &DisplayProfile) -> Result<ImageArtifact, CaptureError> {
        let frame = self
            .retry
            .run("screen capture", || self.capturer.grab())
            .await?;
        let target = profile.logical();
        tokio::task::spawn_blocking(move || encode_png(frame, target))
            .await
            .map_err(|e| CaptureError::Encode(e.to_string()))?
    }
}

/// Resizes to `target` and encodes as base64 PNG.
pub fn encode_png(frame: DynamicImage, target: Resolution) -> Result<ImageArtifact, CaptureError> {
    let original = (frame.width(), frame.height());
    let frame = if original == (target.width, target.height) {
        frame
    } else {
        frame.resize_exact(target.width, target.height, FilterType::Triangle)
    };
    let rgba = frame.to_rgba8();

    let mut png = Vec::new();
    PngEncoder::new_with_quality(Cursor::new(&mut png), CompressionType::Fast, PngFilter::Adaptive)
        .write_image(rgba.as_raw(), target.width, target.height, ExtendedColorType::Rgba8)
        .map_err(|e| CaptureError::Encode(e.to_string()))?;

    debug!(
        "[screen] {}x{} -> {} ({} bytes)",
        original.0,
        original.1,
        target,
        png.len()
    );

    Ok(ImageArtifact {
        media_type: "image/png",
        data: general_purpose::STANDARD.encode(&png),
        width: target.width,
        height: target.height,
    })
}

/// Writes a screenshot to `dir` so an operator can see where a session got stuck.
pub async fn save_artifact(
    artifact: &ImageArtifact,
    dir: &Path,
    stem: &str,
) -> Result<PathBuf, CaptureError> {
    let bytes = general_purpose::STANDARD
        .decode(&artifact.data)
        .map_err(|e| CaptureError::Decode(e.to_string()))?;
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!("{stem}.png"));
    tokio::fs::write(&path, bytes).await?;
    Ok(path)
}
