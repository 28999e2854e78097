// =============================================================================
// config.rs — THE CONTROL PANEL
// =============================================================================
//
// Every knob the collector has lives here and comes from the environment
// (optionally via a .env file). Two of them are non-negotiable: without an
// API endpoint and an event date there is nothing to collect, so their
// absence stops the process before the first tick. Everything else has a
// default that works against a local broker.
//
// Nothing in here is re-read after startup. If you want a different event
// date, restart the process.
// =============================================================================

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::collector::CollectorConfig;
use crate::error::ConfigError;
use crate::models::{EventDate, WeatherVariant};
use crate::scheduler::CronSchedule;

/// Everything the process needs, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // REMOTE DATA SOURCE
    // =========================================================================
    /// Base URL of the report archive. Snapshot file names are appended
    /// to this: `{api_endpoint}/{event_date}_rpts_{code}.csv`.
    pub api_endpoint: Url,

    /// The day whose reports we collect, `YYMMDD`.
    pub event_date: EventDate,

    /// Whole-request timeout for a snapshot download.
    pub http_timeout: Duration,

    /// User-Agent sent with every download.
    pub http_user_agent: String,

    // =========================================================================
    // SCHEDULING
    // =========================================================================
    /// How often a tick fires. Standard 5-field cron, default every minute.
    pub cron_interval: CronSchedule,

    // =========================================================================
    // BROKER
    // =========================================================================
    /// Broker connection URL. Default: redis://127.0.0.1:6379
    pub broker_url: String,

    /// Topic every report message is published to.
    pub topic: String,

    /// Name this process announces to the broker.
    pub client_id: String,

    // =========================================================================
    // LOCAL FILES
    // =========================================================================
    /// Snapshot destinations. Overwritten every tick; not durable state.
    pub tornado_csv_path: PathBuf,
    pub hail_csv_path: PathBuf,
    pub wind_csv_path: PathBuf,

    /// When set, logs are also appended here.
    pub log_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from the process environment, after giving a
    /// `.env` file in the working directory the chance to fill it in.
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env file is fine; real deployments set real variables.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Resolve configuration through `lookup`. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));
        let or_default = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let api_endpoint = parse_base_url(&required("API_ENDPOINT")?)?;
        let event_date = EventDate::parse(required("EVENT_DATE")?.trim())?;
        let cron_interval = CronSchedule::parse(&or_default("CRON_INTERVAL", "* * * * *"))?;

        let http_timeout_secs: u64 = or_default("HTTP_TIMEOUT_SECS", "30")
            .trim()
            .parse()
            .map_err(|e| ConfigError::Invalid {
                key: "HTTP_TIMEOUT_SECS",
                reason: format!("{e}"),
            })?;

        Ok(Config {
            api_endpoint,
            event_date,
            http_timeout: Duration::from_secs(http_timeout_secs),
            http_user_agent: or_default(
                "HTTP_USER_AGENT",
                concat!("StormReportCollector/", env!("CARGO_PKG_VERSION")),
            ),
            cron_interval,
            broker_url: or_default("BROKER_URL", "redis://127.0.0.1:6379"),
            topic: or_default("BROKER_TOPIC", "raw-weather-reports"),
            client_id: or_default("BROKER_CLIENT_ID", "storm-collector"),
            tornado_csv_path: or_default("TORNADO_CSV_PATH", "tornado.csv").into(),
            hail_csv_path: or_default("HAIL_CSV_PATH", "hail.csv").into(),
            wind_csv_path: or_default("WIND_CSV_PATH", "wind.csv").into(),
            log_path: get("LOG_FILE_PATH").map(PathBuf::from),
        })
    }

    pub fn csv_path(&self, variant: WeatherVariant) -> &PathBuf {
        match variant {
            WeatherVariant::Tornado => &self.tornado_csv_path,
            WeatherVariant::Hail => &self.hail_csv_path,
            WeatherVariant::Wind => &self.wind_csv_path,
        }
    }

    /// One collector configuration per variant, in collection order.
    pub fn collector_configs(&self) -> Vec<CollectorConfig> {
        WeatherVariant::ALL
            .iter()
            .map(|&variant| {
                CollectorConfig::new(
                    variant,
                    self.api_endpoint.clone(),
                    self.event_date.clone(),
                    self.csv_path(variant).clone(),
                )
            })
            .collect()
    }
}

fn parse_base_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw.trim()).map_err(|e| ConfigError::Invalid {
        key: "API_ENDPOINT",
        reason: e.to_string(),
    })?;

    if url.cannot_be_a_base() || !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::Invalid {
            key: "API_ENDPOINT",
            reason: format!("{raw} is not an http(s) base URL"),
        });
    }

    Ok(url)
}
