use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::ConfigError;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub camera: CameraConfig,
    pub generator: GeneratorConfig,
    pub printer: PrinterConfig,
    pub trigger: TriggerConfig,
    pub database: DatabaseConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub base_path: PathBuf,
}

impl StorageConfig {
    pub fn images_path(&self) -> PathBuf {
        self.base_path.join("images")
    }

    pub fn poems_path(&self) -> PathBuf {
        self.base_path.join("poems")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// Still-capture CLI binary, e.g. `rpicam-still`.
    pub command: String,
    /// Milliseconds the sensor is given to settle before the shot.
    pub settle_ms: u64,
    pub use_mock: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneratorConfig {
    pub api_key: String,
    pub endpoint: String,
    pub model: String,
    pub max_tokens: u32,
    pub prompt_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrinterConfig {
    pub device_path: PathBuf,
    pub columns: usize,
    pub attribution_lines: Vec<String>,
    pub footer_tag: String,
    pub use_mock: bool,
    pub fallback_to_mock: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum TriggerKind {
    Gpio,
    Stdin,
}

impl FromStr for TriggerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gpio" => Ok(TriggerKind::Gpio),
            "stdin" => Ok(TriggerKind::Stdin),
            other => Err(ConfigError::UnsupportedTriggerSource {
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerConfig {
    pub source: TriggerKind,
    pub gpio_chip: String,
    pub gpio_line: u32,
    pub debounce_ms: u64,
}

impl TriggerConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl DatabaseConfig {
    pub fn connection_string(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.path.display())
    }
}

/// Stage timeouts and retry budgets for the orchestration loop.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub capture_timeout_secs: u64,
    pub generation_timeout_secs: u64,
    pub print_timeout_secs: u64,
    pub generation_attempts: u32,
    pub print_attempts: u32,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,
    pub print_retry_delay_ms: u64,
    /// Print a short apology slip when a captured photo yields no poem.
    pub apology_slip: bool,
}

impl PipelineConfig {
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_secs)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    pub fn print_timeout(&self) -> Duration {
        Duration::from_secs(self.print_timeout_secs)
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_path = PathBuf::from(env_string(
            "STORAGE_PATH",
            "/usr/local/share/poetry_cam",
        ));
        let storage = StorageConfig {
            base_path: base_path.clone(),
        };

        let camera = CameraConfig {
            command: env_string("CAMERA_COMMAND", "rpicam-still"),
            settle_ms: env_parse("CAMERA_SETTLE_MS", 1500u64)?,
            use_mock: env_flag("CAMERA_USE_MOCK", false),
        };

        let generator = GeneratorConfig {
            api_key: std::env::var("OPENAI_API_KEY").map_err(|_| ConfigError::MissingApiKey)?,
            endpoint: env_string(
                "GENERATOR_ENDPOINT",
                "https://api.openai.com/v1/chat/completions",
            ),
            model: env_string("GENERATOR_MODEL", "gpt-4.1-mini"),
            max_tokens: env_parse("GENERATOR_MAX_TOKENS", 300u32)?,
            prompt_path: std::env::var("STYLE_PROMPT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| base_path.join("haiku_prompt.txt")),
        };

        let printer = PrinterConfig {
            device_path: PathBuf::from(env_string("PRINTER_DEVICE", "/dev/usb/lp0")),
            columns: env_parse("PRINTER_COLUMNS", 32usize)?,
            attribution_lines: env_list("PRINTER_ATTRIBUTION"),
            footer_tag: env_string(
                "PRINTER_FOOTER_TAG",
                &format!("poetry-cam-v{}", env!("CARGO_PKG_VERSION")),
            ),
            use_mock: env_flag("USE_MOCK_PRINTER", false),
            fallback_to_mock: env_flag("PRINTER_FALLBACK_TO_MOCK", true),
        };

        let trigger = TriggerConfig {
            source: env_string("TRIGGER_SOURCE", "gpio").parse()?,
            gpio_chip: env_string("GPIO_CHIP", "gpiochip0"),
            gpio_line: env_parse("GPIO_LINE", 21u32)?,
            debounce_ms: env_parse("TRIGGER_DEBOUNCE_MS", 300u64)?,
        };

        let database = DatabaseConfig {
            path: std::env::var("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| base_path.join("poetry_cam.db")),
        };

        let pipeline = PipelineConfig {
            capture_timeout_secs: env_parse("CAPTURE_TIMEOUT_SECS", 10u64)?,
            generation_timeout_secs: env_parse("GENERATION_TIMEOUT_SECS", 30u64)?,
            print_timeout_secs: env_parse("PRINT_TIMEOUT_SECS", 15u64)?,
            generation_attempts: env_parse("GENERATION_ATTEMPTS", 3u32)?,
            print_attempts: env_parse("PRINT_ATTEMPTS", 2u32)?,
            retry_backoff_base_ms: env_parse("RETRY_BACKOFF_BASE_MS", 500u64)?,
            retry_backoff_max_ms: env_parse("RETRY_BACKOFF_MAX_MS", 8000u64)?,
            print_retry_delay_ms: env_parse("PRINT_RETRY_DELAY_MS", 1000u64)?,
            apology_slip: env_flag("PRINT_APOLOGY_SLIP", true),
        };

        let config = Config {
            storage,
            camera,
            generator,
            printer,
            trigger,
            database,
            pipeline,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.capture_timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout {
                key: "CAPTURE_TIMEOUT_SECS",
            });
        }
        if self.pipeline.generation_timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout {
                key: "GENERATION_TIMEOUT_SECS",
            });
        }
        if self.pipeline.print_timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout {
                key: "PRINT_TIMEOUT_SECS",
            });
        }
        if self.pipeline.generation_attempts == 0 {
            return Err(ConfigError::InvalidRetryBudget {
                key: "GENERATION_ATTEMPTS",
            });
        }
        if self.pipeline.print_attempts == 0 {
            return Err(ConfigError::InvalidRetryBudget {
                key: "PRINT_ATTEMPTS",
            });
        }
        Ok(())
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { key }),
        Err(_) => Ok(default),
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
