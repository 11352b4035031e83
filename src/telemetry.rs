//! Shared logging bootstrap for fleetstate binaries.

use crate::{Error, Result};

use std::sync::OnceLock;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::FmtSubscriber;

static RUN_ID: OnceLock<String> = OnceLock::new();

/// Run id attached to metrics, or `"none"` before initialization.
pub fn run_id() -> String {
    RUN_ID.get().cloned().unwrap_or_else(|| "none".to_string())
}

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Text => "text",
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "text" | "pretty" => Ok(LogFormat::Text),
            other => Err(Error::Config(format!(
                "FLEETSTATE_LOG_FORMAT must be one of [json, text], got '{other}'"
            ))),
        }
    }
}

/// Parsed telemetry configuration from environment.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub format: LogFormat,
    pub run_id: Option<String>,
}

impl TelemetryConfig {
    pub fn from_env(default_service_name: &str) -> Result<Self> {
        let service_name = std::env::var("FLEETSTATE_SERVICE_NAME")
            .unwrap_or_else(|_| default_service_name.to_string());
        let service_name = service_name.trim();
        if service_name.is_empty() {
            return Err(Error::Config(
                "FLEETSTATE_SERVICE_NAME cannot be empty".to_string(),
            ));
        }

        let format = match std::env::var("FLEETSTATE_LOG_FORMAT") {
            Ok(raw) => raw.parse()?,
            Err(_) => LogFormat::Json,
        };

        let run_id = std::env::var("FLEETSTATE_RUN_ID")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Ok(Self {
            service_name: service_name.to_string(),
            format,
            run_id,
        })
    }
}

/// Handle describing the installed subscriber.
pub struct Telemetry {
    config: TelemetryConfig,
}

impl Telemetry {
    /// Install the global tracing subscriber for a binary. `RUST_LOG`
    /// directives take precedence over `log_level`.
    pub fn init_for_component(default_service_name: &str, log_level: &str) -> Result<Self> {
        let config = TelemetryConfig::from_env(default_service_name)?;
        let level = parse_log_level(log_level)?;
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));

        let builder = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true);
        let installed = match config.format {
            LogFormat::Json => builder.json().try_init(),
            LogFormat::Text => builder.try_init(),
        };
        installed.map_err(|e| {
            Error::Config(format!("failed to initialize telemetry subscriber: {e}"))
        })?;

        if let Some(run_id) = &config.run_id {
            let _ = RUN_ID.set(run_id.clone());
        }

        info!(
            service_name = %config.service_name,
            log_format = config.format.as_str(),
            run_id = %config.run_id.as_deref().unwrap_or("none"),
            "Telemetry bootstrap initialized"
        );

        Ok(Self { config })
    }

    pub fn run_id(&self) -> Option<&str> {
        self.config.run_id.as_deref()
    }

    pub fn service_name(&self) -> &str {
        &self.config.service_name
    }

    pub fn format(&self) -> LogFormat {
        self.config.format
    }
}

pub fn parse_log_level(raw: &str) -> Result<Level> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(Error::Config(format!(
            "invalid log level '{other}', expected one of [trace, debug, info, warn, error]"
        ))),
    }
}
