// ESC/POS thermal printer output. The device is a raw character device
// (e.g. /dev/usb/lp0); jobs are rendered to command bytes and written
// in one shot.

use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::config::PrinterConfig;
use crate::errors::PrintError;

// ESC/POS commands
const ESC_INIT: &[u8] = b"\x1B@";
const ALIGN_CENTER: &[u8] = b"\x1Ba\x01";
const ALIGN_LEFT: &[u8] = b"\x1Ba\x00";
const BOLD_ON: &[u8] = b"\x1BE\x01";
const BOLD_OFF: &[u8] = b"\x1BE\x00";
const FEED: &[u8] = b"\n\n\n";
const CUT: &[u8] = b"\x1DV\x41\x03";

/// One rendered slip: header metadata plus the poem body.
#[derive(Debug, Clone)]
pub struct PrintJob {
    pub serial: i64,
    pub image_name: String,
    pub poem_name: String,
    pub body: String,
}

/// Printer collaborator. Printing is at-least-once on retry: a
/// duplicate slip on an ambiguous failure beats a lost poem.
#[async_trait]
pub trait Printer: Send + Sync {
    async fn print_poem(&self, job: &PrintJob) -> Result<(), PrintError>;
    /// Short out-of-band message (e.g. the apology slip). Best effort.
    async fn print_notice(&self, text: &str) -> Result<(), PrintError>;
    async fn is_ready(&self) -> bool;
    fn type_name(&self) -> &'static str;
}

/// Static layout shared by every slip.
#[derive(Debug, Clone)]
pub struct SlipLayout {
    pub columns: usize,
    pub attribution_lines: Vec<String>,
    pub footer_tag: String,
}

impl SlipLayout {
    fn from_config(config: &PrinterConfig) -> Self {
        Self {
            columns: config.columns,
            attribution_lines: config.attribution_lines.clone(),
            footer_tag: config.footer_tag.clone(),
        }
    }
}

pub struct EscposPrinter {
    device_path: PathBuf,
    layout: SlipLayout,
}

impl EscposPrinter {
    pub fn new(config: &PrinterConfig) -> Self {
        Self {
            device_path: config.device_path.clone(),
            layout: SlipLayout::from_config(config),
        }
    }

    async fn write_raw(&self, payload: &[u8]) -> Result<(), PrintError> {
        let mut device = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.device_path)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                    PrintError::DeviceUnavailable(self.device_path.display().to_string())
                }
                _ => PrintError::IoError(e),
            })?;
        device.write_all(payload).await?;
        device.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl Printer for EscposPrinter {
    async fn print_poem(&self, job: &PrintJob) -> Result<(), PrintError> {
        info!(serial = job.serial, "printing poem slip");
        let payload = render_poem_slip(job, &self.layout, Local::now());
        self.write_raw(&payload).await
    }

    async fn print_notice(&self, text: &str) -> Result<(), PrintError> {
        let payload = render_notice(text, &self.layout);
        self.write_raw(&payload).await
    }

    async fn is_ready(&self) -> bool {
        self.device_path.exists()
    }

    fn type_name(&self) -> &'static str {
        "ESC/POS thermal printer"
    }
}

/// Mock printer for operation without printer hardware.
pub struct MockPrinter;

#[async_trait]
impl Printer for MockPrinter {
    async fn print_poem(&self, job: &PrintJob) -> Result<(), PrintError> {
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;
        info!(serial = job.serial, body = %job.body, "mock printer rendered slip");
        Ok(())
    }

    async fn print_notice(&self, text: &str) -> Result<(), PrintError> {
        info!(%text, "mock printer rendered notice");
        Ok(())
    }

    async fn is_ready(&self) -> bool {
        true
    }

    fn type_name(&self) -> &'static str {
        "Mock printer"
    }
}

/// Build the configured printer, falling back to the mock when allowed.
pub async fn new_printer(config: &PrinterConfig) -> Result<Arc<dyn Printer>, PrintError> {
    if config.use_mock {
        info!("Using mock printer");
        return Ok(Arc::new(MockPrinter));
    }

    let printer = EscposPrinter::new(config);
    if printer.is_ready().await {
        info!(device = %config.device_path.display(), "Printer initialized successfully");
        return Ok(Arc::new(printer));
    }

    if config.fallback_to_mock {
        warn!(
            device = %config.device_path.display(),
            "Printer device not found, using mock printer"
        );
        return Ok(Arc::new(MockPrinter));
    }

    Err(PrintError::DeviceUnavailable(
        config.device_path.display().to_string(),
    ))
}

fn render_poem_slip(job: &PrintJob, layout: &SlipLayout, now: DateTime<Local>) -> Vec<u8> {
    let date_str = now.format("%b %d, %Y").to_string();
    let time_str = now.format("%I:%M %p").to_string();
    let divider = format!("{}\n", "-".repeat(layout.columns));

    let mut out = Vec::new();
    out.extend_from_slice(ESC_INIT);

    // Header: bold centered serial line, then attribution
    out.extend_from_slice(ALIGN_CENTER);
    out.extend_from_slice(BOLD_ON);
    out.extend_from_slice(format!("* POEM #{} *\n", job.serial).as_bytes());
    out.extend_from_slice(BOLD_OFF);
    for line in &layout.attribution_lines {
        out.extend_from_slice(format!("{line}\n").as_bytes());
    }

    // File names against date and time, then the body
    out.extend_from_slice(ALIGN_LEFT);
    out.extend_from_slice(column_line(&job.image_name, &date_str, layout.columns).as_bytes());
    out.extend_from_slice(column_line(&job.poem_name, &time_str, layout.columns).as_bytes());
    out.extend_from_slice(divider.as_bytes());
    out.extend_from_slice(wrap_columns(&job.body, layout.columns).as_bytes());
    out.extend_from_slice(divider.as_bytes());

    // Footer
    out.extend_from_slice(ALIGN_CENTER);
    out.extend_from_slice(BOLD_ON);
    out.extend_from_slice(b"Thank you for creating with us!\n");
    out.extend_from_slice(BOLD_OFF);
    out.extend_from_slice(format!("{}\n", layout.footer_tag).as_bytes());
    out.extend_from_slice(FEED);
    out.extend_from_slice(CUT);
    out
}

fn render_notice(text: &str, layout: &SlipLayout) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(ESC_INIT);
    out.extend_from_slice(ALIGN_CENTER);
    out.extend_from_slice(wrap_columns(text, layout.columns).as_bytes());
    out.extend_from_slice(FEED);
    out.extend_from_slice(CUT);
    out
}

/// Word-wrap to the printer's column width. Continuation lines get a
/// three-space indent so wrapped verse reads as one line.
fn wrap_columns(input: &str, max: usize) -> String {
    let mut out = String::new();
    for line in input.split('\n') {
        let mut current = String::new();
        for word in line.split_whitespace() {
            if current.len() + word.len() <= max {
                current.push_str(word);
                current.push(' ');
            } else {
                out.push_str(current.trim_end());
                out.push_str("\n   ");
                current = format!("{word} ");
            }
        }
        out.push_str(current.trim_end());
        out.push('\n');
    }
    out
}

/// Left and right text on one line, padded apart to the column width.
fn column_line(left: &str, right: &str, width: usize) -> String {
    let pad = width.saturating_sub(left.len() + right.len()).max(1);
    format!("{left}{}{right}\n", " ".repeat(pad))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_layout() -> SlipLayout {
        SlipLayout {
            columns: 32,
            attribution_lines: vec!["a poem by the camera".to_string()],
            footer_tag: "poetry-cam-v0.1.0".to_string(),
        }
    }

    #[test]
    fn test_wrap_keeps_short_lines_intact() {
        let wrapped = wrap_columns("an old silent pond", 32);
        assert_eq!(wrapped, "an old silent pond\n");
    }

    #[test]
    fn test_wrap_indents_continuation_lines() {
        let wrapped = wrap_columns("a frog leaps into the water and the silence follows it down", 32);
        let lines: Vec<&str> = wrapped.lines().collect();
        assert!(lines.len() > 1);
        assert!(lines[0].len() <= 32);
        for cont in &lines[1..] {
            assert!(cont.starts_with("   "));
        }
    }

    #[test]
    fn test_wrap_preserves_existing_line_breaks() {
        let wrapped = wrap_columns("line one\nline two", 32);
        assert_eq!(wrapped, "line one\nline two\n");
    }

    #[test]
    fn test_column_line_pads_to_width() {
        let line = column_line("abc.jpg", "Aug 06, 2026", 32);
        assert_eq!(line.len(), 33); // 32 columns + newline
        assert!(line.starts_with("abc.jpg"));
        assert!(line.ends_with("Aug 06, 2026\n"));
    }

    #[test]
    fn test_column_line_always_separates_sides() {
        let line = column_line("a-very-long-image-name.jpg", "Aug 06, 2026", 32);
        assert!(line.contains(".jpg Aug"));
    }

    #[test]
    fn test_slip_renders_header_body_and_cut() {
        let job = PrintJob {
            serial: 12,
            image_name: "ab12cd34.jpg".to_string(),
            poem_name: "ab12cd34.txt".to_string(),
            body: "an old silent pond\na frog leaps into the water\nsplash, silence again".to_string(),
        };
        let payload = render_poem_slip(&job, &test_layout(), Local::now());
        let text = String::from_utf8_lossy(&payload);

        assert!(text.contains("* POEM #12 *"));
        assert!(text.contains("a poem by the camera"));
        assert!(text.contains("an old silent pond"));
        assert!(text.contains("poetry-cam-v0.1.0"));
        assert!(payload.starts_with(ESC_INIT));
        assert!(payload.ends_with(CUT));
    }

    #[test]
    fn test_notice_is_centered_and_cut() {
        let payload = render_notice("the muse is resting", &test_layout());
        let text = String::from_utf8_lossy(&payload);
        assert!(text.contains("the muse is resting"));
        assert!(payload.ends_with(CUT));
    }
}
