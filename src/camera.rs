// Still-image capture via the Raspberry Pi camera CLI.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::CameraConfig;
use crate::errors::CaptureError;

/// Camera collaborator. One successful call produces exactly one image
/// payload; calls are safe to repeat. Timeouts are enforced by the
/// caller, not here.
#[async_trait]
pub trait ImageCapture: Send + Sync {
    async fn capture(&self) -> Result<Bytes, CaptureError>;
    async fn check_connection(&self) -> bool;
    fn type_name(&self) -> &'static str;
}

/// Captures stills by shelling out to `rpicam-still` (or a compatible
/// binary), reading the JPEG from its stdout.
pub struct CliCamera {
    command: String,
    settle_ms: u64,
}

impl CliCamera {
    pub fn new(config: &CameraConfig) -> Self {
        Self {
            command: config.command.clone(),
            settle_ms: config.settle_ms,
        }
    }
}

#[async_trait]
impl ImageCapture for CliCamera {
    async fn capture(&self) -> Result<Bytes, CaptureError> {
        let settle = self.settle_ms.to_string();
        let output = tokio::process::Command::new(&self.command)
            .args(["--output", "-", "--timeout", &settle, "--nopreview"])
            .output()
            .await
            .map_err(|e| {
                if e.kind() == ErrorKind::NotFound {
                    CaptureError::DeviceUnavailable(format!(
                        "capture command not found: {}",
                        self.command
                    ))
                } else {
                    CaptureError::IoError(e)
                }
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_capture_failure(&stderr));
        }

        if output.stdout.is_empty() {
            return Err(CaptureError::SensorFault(
                "capture produced no image data".to_string(),
            ));
        }

        Ok(Bytes::from(output.stdout))
    }

    async fn check_connection(&self) -> bool {
        let output = tokio::process::Command::new(&self.command)
            .arg("--list-cameras")
            .output()
            .await;

        match output {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                output.status.success() && !stdout.to_ascii_lowercase().contains("no cameras")
            }
            Err(_) => false,
        }
    }

    fn type_name(&self) -> &'static str {
        "CLI still camera"
    }
}

fn classify_capture_failure(stderr: &str) -> CaptureError {
    let lowered = stderr.to_ascii_lowercase();
    let detail = stderr.lines().last().unwrap_or("unknown failure").to_string();
    if lowered.contains("no cameras") || lowered.contains("device") {
        CaptureError::DeviceUnavailable(detail)
    } else {
        CaptureError::SensorFault(detail)
    }
}

// Minimal valid JPEG header/trailer, enough for anything that treats the
// payload as opaque bytes.
const PLACEHOLDER_JPEG: &[u8] = &[
    0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46, 0x49, 0x46, 0x00, 0x01, 0x01, 0x00, 0x00,
    0x01, 0x00, 0x01, 0x00, 0x00, 0xFF, 0xD9,
];

/// Mock camera for bench operation without camera hardware.
pub struct MockCamera;

#[async_trait]
impl ImageCapture for MockCamera {
    async fn capture(&self) -> Result<Bytes, CaptureError> {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        Ok(Bytes::from_static(PLACEHOLDER_JPEG))
    }

    async fn check_connection(&self) -> bool {
        true
    }

    fn type_name(&self) -> &'static str {
        "Mock camera"
    }
}

/// Build the configured camera. The camera is a required collaborator:
/// a probe failure here aborts startup.
pub async fn new_camera(config: &CameraConfig) -> Result<Arc<dyn ImageCapture>, CaptureError> {
    if config.use_mock {
        info!("Using mock camera");
        return Ok(Arc::new(MockCamera));
    }

    let camera = CliCamera::new(config);
    info!(command = %config.command, "Probing camera");
    if !camera.check_connection().await {
        warn!(command = %config.command, "Camera probe failed");
        return Err(CaptureError::DeviceUnavailable(format!(
            "no camera detected via {}",
            config.command
        )));
    }

    info!("Camera initialized successfully");
    Ok(Arc::new(camera))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_camera_produces_jpeg_payload() {
        let camera = MockCamera;
        let data = camera.capture().await.unwrap();
        assert!(data.starts_with(&[0xFF, 0xD8]));
        assert!(data.ends_with(&[0xFF, 0xD9]));
        assert!(camera.check_connection().await);
    }

    #[test]
    fn test_missing_device_classified_as_unavailable() {
        let err = classify_capture_failure("ERROR: *** no cameras available ***");
        assert!(matches!(err, CaptureError::DeviceUnavailable(_)));
    }

    #[test]
    fn test_other_failures_classified_as_sensor_fault() {
        let err = classify_capture_failure("ERROR: frame wait timed out");
        assert!(matches!(err, CaptureError::SensorFault(_)));
    }
}
