//! This serves as an unified logging config for the workspace binaries.
//! It outputs compact or JSON logs to stdout and, when a collector endpoint is
//! configured, also exports spans over OTLP.
//!

use opentelemetry::sdk::trace::Tracer;
use opentelemetry_otlp::WithExportConfig;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use tracing::subscriber;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format {other:?}, use compact or json")),
        }
    }
}

impl Display for LogFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Compact => write!(f, "compact"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub service_name: String,
    pub format: LogFormat,
    /// OTLP gRPC endpoint, spans are only exported when this is set.
    pub otlp_endpoint: Option<String>,
}

/// This is a guard that will shutdown the OpenTelemetry exporter on drop.
/// TLDR; Keep this around in main to make sure it is dropped after the
/// program exits, due to regular causes our panic.
#[derive(Debug)]
pub struct TraceShutdownGuard {
    tracer: Option<Tracer>,
}

impl Drop for TraceShutdownGuard {
    fn drop(&mut self) {
        let Some(tracer) = self.tracer.take() else {
            return;
        };
        if let Some(provider) = tracer.provider() {
            for export_res in provider.force_flush() {
                if let Err(err) = export_res {
                    println!(
                        "Failed to export traces during TraceShutdownGuard drop, please, look into it: {:?}",
                        err
                    );
                }
            }
        }
        println!("Tracer is shutting down because the handle was dropped, traces will no longer be exported!");
        opentelemetry::global::shutdown_tracer_provider();
    }
}

/// Uses RUST_LOG, see https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html
/// on how to configure that. If not present, defaults to plain "info".
fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("RUST_LOG").unwrap_or_else(|e| {
        println!(
            "Missing or invalid RUST_LOG, defaulting to {DEFAULT_FILTER}. {:#?}",
            e
        );
        EnvFilter::builder()
            .parse(DEFAULT_FILTER)
            .unwrap_or_else(|_| panic!("{DEFAULT_FILTER} should work as filter"))
    })
}

fn otlp_tracer(service_name: &str, endpoint: &str) -> Tracer {
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint.to_string()),
        )
        .with_trace_config(opentelemetry::sdk::trace::config().with_resource(
            opentelemetry::sdk::Resource::new(vec![opentelemetry::KeyValue::new(
                "service.name",
                service_name.to_string(),
            )]),
        ))
        .install_batch(opentelemetry::runtime::Tokio)
        .unwrap_or_else(|e| panic!("failed to install OTLP exporter for {endpoint}: {e}"))
}

/// Installs the global subscriber. Must be called once, from within a tokio runtime when
/// `otlp_endpoint` is set.
pub fn setup_tracing_or_panic(config: LoggingConfig) -> TraceShutdownGuard {
    if config.service_name.trim().is_empty() {
        panic!("Service name can't be empty.");
    }
    let filter = env_filter();
    println!(
        "Initializing logging for {} using env filter: {}, format: {}",
        config.service_name, filter, config.format
    );
    let tracer = config
        .otlp_endpoint
        .as_deref()
        .map(|endpoint| otlp_tracer(&config.service_name, endpoint));
    let otel = tracer
        .clone()
        .map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer));
    let (compact, json) = match config.format {
        LogFormat::Compact => (Some(tracing_subscriber::fmt::layer().compact()), None),
        LogFormat::Json => (None, Some(tracing_subscriber::fmt::layer().json())),
    };
    let subscriber = tracing_subscriber::Registry::default()
        .with(filter)
        .with(compact)
        .with(json)
        .with(otel);
    subscriber::set_global_default(subscriber)
        .unwrap_or_else(|_| panic!("Tried to initialize tracing again, please, don't do this"));
    TraceShutdownGuard { tracer }
}

/// Safe to call from every test, only the first call installs the subscriber.
pub fn setup_tracing_console_logging_for_test() {
    let fmt = tracing_subscriber::fmt::layer()
        // for tests ansi if nice
        .with_ansi(true)
        .with_test_writer()
        .compact();
    let subscriber = tracing_subscriber::Registry::default()
        .with(env_filter())
        .with(fmt);
    let _ = subscriber::set_global_default(subscriber);
}

#[cfg(test)]
mod test {
    use super::LogFormat;

    #[test]
    fn log_format_parses_case_insensitively() {
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!("compact".parse::<LogFormat>(), Ok(LogFormat::Compact));
        assert!("pretty".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_logging_can_be_set_up_twice() {
        super::setup_tracing_console_logging_for_test();
        super::setup_tracing_console_logging_for_test();
        tracing::info!("logging works");
    }
}
