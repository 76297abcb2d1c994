use dicom_qr::api::{self, Operation, USAGE};
use dicom_qr::config::AppConfig;
use dicom_qr::error::{ErrorKind, QueryRetrieveError};
use serde_json::Value;
use std::process::ExitCode;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn init_logger(level: tracing::Level) {
	tracing_subscriber::registry()
		.with(
			tracing_subscriber::fmt::layer()
				.compact()
				// stdout is reserved for the JSON result
				.with_writer(std::io::stderr)
				.with_ansi(false)
				.with_file(false)
				.with_line_number(false)
				.with_target(false),
		)
		.with(
			EnvFilter::builder()
				.with_default_directive(LevelFilter::from_level(level).into())
				.from_env_lossy(),
		)
		.with(sentry::integrations::tracing::layer())
		.init();
}

fn init_sentry(config: &AppConfig) -> sentry::ClientInitGuard {
	let guard = sentry::init((
		// An empty string will disable Sentry
		config.telemetry.sentry.as_deref().unwrap_or_default(),
		sentry::ClientOptions {
			release: sentry::release_name!(),
			traces_sample_rate: 1.0,
			..Default::default()
		},
	));

	if let Some(dsn) = &config.telemetry.sentry {
		info!(dsn, "Enabled Sentry for tracing and error tracking");
	}

	guard
}

fn print(value: &Value) {
	println!("{value}");
}

/// Malformed input exits with 1, every other failure is reported in the JSON result.
fn fail(err: &QueryRetrieveError) -> ExitCode {
	print(&api::error_json(err));
	if err.kind() == ErrorKind::MalformedInput {
		ExitCode::FAILURE
	} else {
		ExitCode::SUCCESS
	}
}

fn main() -> ExitCode {
	let config = match AppConfig::new() {
		Ok(config) => config,
		Err(err) => {
			print(&serde_json::json!({
				"success": false,
				"error": format!("Failed to load configuration: {err}"),
			}));
			return ExitCode::FAILURE;
		}
	};
	init_logger(config.telemetry.level.into());

	// Manually create the Tokio runtime because the Sentry client needs to be created *before* the
	// Tokio runtime, which prevents us from using the #[tokio::main] macro.
	// See https://docs.sentry.io/platforms/rust/#async-main-function
	let _sentry = init_sentry(&config);

	let args: Vec<String> = std::env::args().skip(1).collect();
	let [operation, input] = args.as_slice() else {
		return fail(&QueryRetrieveError::MalformedInput(String::from(USAGE)));
	};
	let operation = match operation.parse::<Operation>() {
		Ok(operation) => operation,
		Err(err) => return fail(&err),
	};

	let runtime = match tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
	{
		Ok(runtime) => runtime,
		Err(err) => {
			error!("Failed to start the Tokio runtime: {err}");
			print(&serde_json::json!({
				"success": false,
				"error": format!("Failed to start the Tokio runtime: {err}"),
			}));
			return ExitCode::FAILURE;
		}
	};

	match runtime.block_on(api::execute(&config, operation, input)) {
		Ok(result) => {
			print(&result);
			ExitCode::SUCCESS
		}
		Err(err) => {
			error!(kind = %err.kind(), "{err}");
			fail(&err)
		}
	}
}
