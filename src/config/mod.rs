use crate::service::{ReceiverSettings, SettleSettings, Timeouts};
use crate::types::AE;
use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
	pub telemetry: TelemetryConfig,
	pub local: LocalConfig,
	pub receiver: ReceiverConfig,
	pub cache: CacheConfig,
	pub timeouts: TimeoutConfig,
	pub settle: SettleConfig,
}

impl AppConfig {
	/// Loads the embedded defaults, an optional `config.toml` and `DICOM_QR_*` environment variables,
	/// in that order.
	pub fn new() -> Result<Self, ConfigError> {
		Self::builder()
			.add_source(File::with_name("config.toml").required(false))
			.add_source(
				Environment::with_prefix("DICOM_QR")
					.prefix_separator("_")
					.separator("__")
					.try_parsing(true),
			)
			.build()?
			.try_deserialize()
	}

	fn builder() -> config::ConfigBuilder<config::builder::DefaultState> {
		Config::builder().add_source(File::from_str(
			include_str!("defaults.toml"),
			FileFormat::Toml,
		))
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
	/// Default log level. Also configurable via RUST_LOG.
	pub level: LogLevel,
	pub sentry: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
	Trace,
	Debug,
	Info,
	Warn,
	Error,
}

impl From<LogLevel> for tracing::Level {
	fn from(level: LogLevel) -> Self {
		match level {
			LogLevel::Trace => Self::TRACE,
			LogLevel::Debug => Self::DEBUG,
			LogLevel::Info => Self::INFO,
			LogLevel::Warn => Self::WARN,
			LogLevel::Error => Self::ERROR,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
	/// The application entity title of this node.
	pub aet: AE,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReceiverConfig {
	pub interface: IpAddr,
	pub port: u16,
	pub uncompressed: bool,
}

impl From<&ReceiverConfig> for ReceiverSettings {
	fn from(config: &ReceiverConfig) -> Self {
		Self {
			interface: config.interface,
			port: config.port,
			uncompressed: config.uncompressed,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
	/// Default cache root if a request does not name one.
	pub root: PathBuf,
}

/// Timeouts in milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
	pub connect: u64,
	pub dimse: u64,
	pub store: u64,
	pub retrieve: Option<u64>,
}

impl From<&TimeoutConfig> for Timeouts {
	fn from(config: &TimeoutConfig) -> Self {
		Self {
			connect: Duration::from_millis(config.connect),
			dimse: Duration::from_millis(config.dimse),
			store: Duration::from_millis(config.store),
			retrieve: config.retrieve.map(Duration::from_millis),
		}
	}
}

/// Durations in milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct SettleConfig {
	pub quiet: u64,
	pub max: u64,
}

impl From<&SettleConfig> for SettleSettings {
	fn from(config: &SettleConfig) -> Self {
		Self {
			quiet: Duration::from_millis(config.quiet),
			max: Duration::from_millis(config.max),
		}
	}
}
