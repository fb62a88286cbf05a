use crate::api::AppState;
use backtraced_error::error_chain_to_pretty_formatted;
use clap::Parser;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;
use trace_reader::{InfluxQueryService, QueryExecutor, Reader, ReaderConfig};
use tracing::{error, info, instrument};
use tracing_config_helper::{LogFormat, LoggingConfig};

mod api;

const SECONDS_IN_1_HOUR: u64 = 60 * 60;

#[tokio::main]
async fn main() {
    // load env vars so clap can use it when parsing a config
    println!("Loading env vars");
    dotenv::dotenv().ok();
    let config = LaunchConfig::parse();
    let trace_guard = tracing_config_helper::setup_tracing_or_panic(LoggingConfig {
        service_name: env!("CARGO_BIN_NAME").to_string(),
        format: config.log_format,
        otlp_endpoint: config.otlp_endpoint.clone(),
    });
    let api_handle = match start_api(config) {
        Ok(api_handle) => api_handle,
        Err(e) => {
            error!("Failed to start: {}", error_chain_to_pretty_formatted(&*e));
            drop(trace_guard);
            std::process::exit(1);
        }
    };
    if let Err(e) = api_handle.await {
        error!("API task stopped: {}", error_chain_to_pretty_formatted(e));
    }
}

#[instrument(level = "error", skip_all)]
fn start_api(
    config: LaunchConfig,
) -> Result<tokio::task::JoinHandle<()>, Box<dyn std::error::Error>> {
    info!("Using config: {:#?}", config);
    let query_timeout = Duration::from_secs(config.query_timeout_secs);
    let service =
        InfluxQueryService::new(&config.influx_url, &config.influx_token, query_timeout)?;
    let executor = QueryExecutor::new(Arc::new(service), config.influx_org_id.clone());
    let default_lookback = config.default_lookback()?;
    let reader = Reader::new(
        executor,
        ReaderConfig {
            bucket: config.bucket.clone(),
            span_measurement: config.span_measurement.clone(),
            log_measurement: config.log_measurement.clone(),
            default_lookback,
        },
    )?;
    let app_state = AppState {
        reader: Arc::new(reader),
        default_lookback,
        query_timeout,
    };
    api::start(app_state, config.api_listen_port)
}

#[derive(clap::Parser)]
#[command(about = "Serves traces stored in InfluxDB through a Jaeger compatible query API")]
pub struct LaunchConfig {
    #[clap(long, env)]
    pub influx_url: String,
    #[clap(long, env)]
    pub influx_token: String,
    #[clap(long, env)]
    pub influx_org_id: String,
    #[clap(long, env)]
    pub bucket: String,
    #[clap(long, env, default_value = trace_reader::schema::DEFAULT_SPAN_MEASUREMENT)]
    pub span_measurement: String,
    #[clap(long, env, default_value = trace_reader::schema::DEFAULT_LOG_MEASUREMENT)]
    pub log_measurement: String,
    #[clap(long, env, default_value_t = 48)]
    pub default_lookback_hours: u64,
    #[clap(long, env, default_value_t = 30)]
    pub query_timeout_secs: u64,
    #[clap(long, env, default_value_t = 16686)]
    pub api_listen_port: u16,
    #[clap(long, env, default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,
    /// OTLP gRPC collector, spans of this process are exported when set.
    #[clap(long, env)]
    pub otlp_endpoint: Option<String>,
}

impl LaunchConfig {
    fn default_lookback(&self) -> Result<Duration, String> {
        self.default_lookback_hours
            .checked_mul(SECONDS_IN_1_HOUR)
            .map(Duration::from_secs)
            .ok_or_else(|| {
                format!(
                    "default lookback of {} hours is out of range",
                    self.default_lookback_hours
                )
            })
    }
}

impl Debug for LaunchConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchConfig")
            .field("influx_url", &self.influx_url)
            .field(
                "influx_token",
                &self
                    .influx_token
                    .chars()
                    .rev()
                    .take(4)
                    .collect::<String>()
                    .chars()
                    .rev()
                    .collect::<String>(),
            )
            .field("influx_org_id", &self.influx_org_id)
            .field("bucket", &self.bucket)
            .field("span_measurement", &self.span_measurement)
            .field("log_measurement", &self.log_measurement)
            .field("default_lookback_hours", &self.default_lookback_hours)
            .field("query_timeout_secs", &self.query_timeout_secs)
            .field("api_listen_port", &self.api_listen_port)
            .field("log_format", &self.log_format)
            .field("otlp_endpoint", &self.otlp_endpoint)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::LaunchConfig;
    use clap::Parser;
    use std::time::Duration;
    use tracing_config_helper::LogFormat;

    #[test]
    fn defaults_fill_the_optional_settings() {
        let config = LaunchConfig::try_parse_from([
            "trace-reader",
            "--influx-url",
            "http://localhost:8086",
            "--influx-token",
            "super-secret-token",
            "--influx-org-id",
            "org",
            "--bucket",
            "traces",
        ])
        .unwrap();
        assert_eq!(config.span_measurement, "span");
        assert_eq!(config.log_measurement, "log");
        assert_eq!(config.default_lookback_hours, 48);
        assert_eq!(config.api_listen_port, 16686);
        assert_eq!(config.log_format, LogFormat::Compact);
        assert!(config.otlp_endpoint.is_none());
        let debug = format!("{config:?}");
        assert!(!debug.contains("super-secret-token"));
        assert!(debug.contains("oken"));
    }

    #[test]
    fn log_format_is_parsed() {
        let config = LaunchConfig::try_parse_from([
            "trace-reader",
            "--influx-url",
            "u",
            "--influx-token",
            "t",
            "--influx-org-id",
            "o",
            "--bucket",
            "b",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn lookback_hours_that_overflow_fail_startup() {
        let parse = |hours: &str| {
            LaunchConfig::try_parse_from([
                "trace-reader",
                "--influx-url",
                "u",
                "--influx-token",
                "t",
                "--influx-org-id",
                "o",
                "--bucket",
                "b",
                "--default-lookback-hours",
                hours,
            ])
            .unwrap()
        };
        assert_eq!(
            parse("2").default_lookback(),
            Ok(Duration::from_secs(2 * 60 * 60))
        );
        let err = parse(&u64::MAX.to_string()).default_lookback().unwrap_err();
        assert!(err.contains("out of range"));
    }
}
