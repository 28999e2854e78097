// =============================================================================
// collector.rs — ONE PIPELINE, THREE KINDS OF WEATHER
// =============================================================================
//
// A Collector is nothing but an immutable CollectorConfig plus one run()
// function. The variant (tornado, hail, wind) is data on the config, never a
// subtype, so there is exactly one code path to get right.
//
// Each run walks a small state machine:
//
//   Idle → Fetching → Parsing → Transforming → Publishing → Succeeded
//                 ↘          ↘              ↘             ↘
//                             Failed(stage)
//
// The first failing stage ends the run. Nothing is retried and nothing is
// resumed: the next tick starts again from Idle with a fresh download.
// Zero rows is not a failure, it just means there is nothing to publish.
// =============================================================================

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, info, info_span, Instrument};
use url::Url;

use crate::error::{CollectorError, PublishError, Stage, StageError};
use crate::fetcher::SnapshotFetcher;
use crate::models::{EventDate, TickResult, WeatherVariant};
use crate::parser::CsvParser;
use crate::publisher::ReportPublisher;
use crate::transformer::{TransformFailure, Transformer};

/// Everything one variant needs for a run. Built once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectorConfig {
    variant: WeatherVariant,
    endpoint_template: Url,
    event_date: EventDate,
    local_snapshot_path: PathBuf,
    csv_columns: Vec<String>,
}

impl CollectorConfig {
    /// Takes an already validated `EventDate`, so a bad date fails at
    /// startup instead of producing wrong timestamps later.
    pub fn new(
        variant: WeatherVariant,
        endpoint_template: Url,
        event_date: EventDate,
        local_snapshot_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            variant,
            endpoint_template,
            event_date,
            local_snapshot_path: local_snapshot_path.into(),
            csv_columns: variant.csv_columns(),
        }
    }

    pub fn variant(&self) -> WeatherVariant {
        self.variant
    }

    pub fn event_date(&self) -> &EventDate {
        &self.event_date
    }

    pub fn local_snapshot_path(&self) -> &Path {
        &self.local_snapshot_path
    }
}

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Active(Stage),
    Succeeded,
    Failed(Stage),
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => write!(f, "idle"),
            RunState::Active(stage) => write!(f, "{stage}"),
            RunState::Succeeded => write!(f, "succeeded"),
            RunState::Failed(stage) => write!(f, "failed while {stage}"),
        }
    }
}

/// Tracks the state machine of a single run and logs each transition.
struct RunTracker {
    variant: WeatherVariant,
    state: RunState,
}

impl RunTracker {
    fn new(variant: WeatherVariant) -> Self {
        Self {
            variant,
            state: RunState::Idle,
        }
    }

    fn enter(&mut self, stage: Stage) {
        debug!(from = %self.state, to = %stage, "Collector stage transition");
        self.state = RunState::Active(stage);
    }

    fn fail(&mut self, source: impl Into<StageError>) -> CollectorError {
        let stage = match self.state {
            RunState::Active(stage) => stage,
            // A failure is only ever raised from inside a stage.
            _ => Stage::Fetching,
        };
        self.state = RunState::Failed(stage);
        CollectorError::new(self.variant, stage, source)
    }

    fn succeed(&mut self) {
        self.state = RunState::Succeeded;
    }
}

/// The per-variant collector.
#[derive(Debug, Clone)]
pub struct Collector {
    config: CollectorConfig,
}

impl Collector {
    pub fn new(config: CollectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    pub fn variant(&self) -> WeatherVariant {
        self.config.variant()
    }

    /// `{base}/{eventDate}_rpts_{shortCode}.csv`
    ///
    /// A trailing slash on `base` is not doubled. Non-hierarchical bases are
    /// rejected when the configuration is loaded.
    pub fn build_endpoint(base: &Url, event_date: &str, variant: WeatherVariant) -> Url {
        let file = format!("{event_date}_rpts_{}.csv", variant.short_code());
        let mut url = base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(&file);
        }
        url
    }

    pub fn endpoint(&self) -> Url {
        Self::build_endpoint(
            &self.config.endpoint_template,
            self.config.event_date.as_str(),
            self.config.variant,
        )
    }

    /// Fetch, parse, transform and publish this variant's snapshot.
    pub async fn run(
        &self,
        fetcher: &dyn SnapshotFetcher,
        parser: &CsvParser,
        transformer: &Transformer,
        publisher: &dyn ReportPublisher,
    ) -> Result<TickResult, CollectorError> {
        let span = info_span!("collector", variant = %self.config.variant);
        self.run_stages(fetcher, parser, transformer, publisher)
            .instrument(span)
            .await
    }

    async fn run_stages(
        &self,
        fetcher: &dyn SnapshotFetcher,
        parser: &CsvParser,
        transformer: &Transformer,
        publisher: &dyn ReportPublisher,
    ) -> Result<TickResult, CollectorError> {
        let config = &self.config;
        let variant = config.variant;
        let mut run = RunTracker::new(variant);
        info!("{} data job started", variant);

        run.enter(Stage::Fetching);
        let endpoint = self.endpoint();
        fetcher
            .fetch(&endpoint, &config.local_snapshot_path)
            .await
            .map_err(|e| run.fail(e))?;

        run.enter(Stage::Parsing);
        let rows = parser
            .parse(&config.local_snapshot_path, &config.csv_columns)
            .await
            .map_err(|e| run.fail(e))?;
        debug!(rows = rows.len(), "Snapshot parsed");

        run.enter(Stage::Transforming);
        let reports = transformer
            .transform(variant, &rows, config.event_date.as_str())
            .map_err(|e| match e {
                TransformFailure::InvalidDate(e) => run.fail(e),
                TransformFailure::Field(e) => run.fail(e),
            })?;

        run.enter(Stage::Publishing);
        if reports.is_empty() {
            info!("No {} reports to send", variant);
            run.succeed();
            return Ok(TickResult::success(variant, 0));
        }

        let batch = reports
            .iter()
            .map(|report| report.to_message().map_err(PublishError::from))
            .collect::<Result<Vec<String>, _>>()
            .map_err(|e| run.fail(e))?;

        let sent = publisher.publish(batch).await.map_err(|e| run.fail(e))?;

        run.succeed();
        info!(records = sent, "{} data job completed", variant);
        Ok(TickResult::success(variant, sent))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::{ErrorKind, FetchError};
    use crate::models::{EnrichedReport, Measurement};
    use crate::publisher::PublisherSnapshot;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Serves canned CSV bodies keyed by the endpoint's file name.
    #[derive(Default)]
    pub struct FakeFetcher {
        pub bodies: HashMap<String, Result<String, u16>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl FakeFetcher {
        pub fn with(mut self, file: &str, body: Result<&str, u16>) -> Self {
            self.bodies
                .insert(file.to_string(), body.map(|b| b.to_string()));
            self
        }
    }

    #[async_trait]
    impl SnapshotFetcher for FakeFetcher {
        async fn fetch(&self, endpoint: &Url, destination: &Path) -> Result<u64, FetchError> {
            let file = endpoint
                .path_segments()
                .and_then(|mut s| s.next_back())
                .unwrap_or_default()
                .to_string();
            self.calls.lock().unwrap().push(file.clone());

            match self.bodies.get(&file) {
                Some(Ok(body)) => {
                    std::fs::write(destination, body).unwrap();
                    Ok(body.len() as u64)
                }
                Some(Err(status)) => Err(FetchError::status(*status, "Not Found")),
                None => Err(FetchError::transport("connection refused")),
            }
        }
    }

    /// Records every batch; optionally refuses them all.
    #[derive(Default)]
    pub struct RecordingPublisher {
        pub batches: Mutex<Vec<Vec<String>>>,
        pub fail: bool,
    }

    #[async_trait]
    impl ReportPublisher for RecordingPublisher {
        async fn publish(&self, batch: Vec<String>) -> Result<usize, PublishError> {
            if self.fail {
                return Err(PublishError::Unavailable("broker down".to_string()));
            }
            let count = batch.len();
            self.batches.lock().unwrap().push(batch);
            Ok(count)
        }

        fn snapshot(&self) -> PublisherSnapshot {
            let batches = self.batches.lock().unwrap();
            PublisherSnapshot {
                messages_published: batches.iter().map(|b| b.len() as u64).sum(),
                batches_sent: batches.len() as u64,
                ..PublisherSnapshot::default()
            }
        }
    }

    pub fn collector(variant: WeatherVariant, dir: &Path) -> Collector {
        let base = Url::parse("https://reports.example.test/climo/reports").unwrap();
        let path = dir.join(format!("{}.csv", variant.label()));
        let event_date = EventDate::parse("240615").unwrap();
        Collector::new(CollectorConfig::new(variant, base, event_date, path))
    }

    pub const TORNADO_CSV: &str = "Time,F_Scale,Location,County,State,Lat,Lon,Comments\n\
        12:30,EF2,Smalltown,Cook,IL,41.5,-87.6,\"minor damage\"\n";

    #[test]
    fn test_build_endpoint() {
        let base = Url::parse("https://www.spc.noaa.gov/climo/reports").unwrap();
        assert_eq!(
            Collector::build_endpoint(&base, "240615", WeatherVariant::Tornado).as_str(),
            "https://www.spc.noaa.gov/climo/reports/240615_rpts_torn.csv"
        );

        let slashed = Url::parse("https://www.spc.noaa.gov/climo/reports/").unwrap();
        assert_eq!(
            Collector::build_endpoint(&slashed, "990101", WeatherVariant::Wind).as_str(),
            "https://www.spc.noaa.gov/climo/reports/990101_rpts_wind.csv"
        );
    }

    #[test]
    fn test_config_describes_its_variant() {
        let dir = tempfile::tempdir().unwrap();
        let wind = collector(WeatherVariant::Wind, dir.path());
        assert_eq!(wind.variant(), WeatherVariant::Wind);
        assert_eq!(wind.config().event_date().as_str(), "240615");
        assert_eq!(wind.config().local_snapshot_path(), dir.path().join("wind.csv"));
        assert_eq!(
            wind.endpoint().as_str(),
            "https://reports.example.test/climo/reports/240615_rpts_wind.csv"
        );
    }

    #[tokio::test]
    async fn test_run_publishes_tornado_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher::default().with("240615_rpts_torn.csv", Ok(TORNADO_CSV));
        let publisher = RecordingPublisher::default();

        let result = collector(WeatherVariant::Tornado, dir.path())
            .run(&fetcher, &CsvParser::new(), &Transformer::new(), &publisher)
            .await
            .unwrap();

        assert_eq!(result, TickResult::success(WeatherVariant::Tornado, 1));

        let batches = publisher.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        let report: EnrichedReport = serde_json::from_str(&batches[0][0]).unwrap();
        let midnight = Utc.with_ymd_and_hms(2024, 6, 15, 0, 0, 0).unwrap();
        assert_eq!(report.event_ts, midnight.timestamp_millis());
        assert_eq!(report.measurement, Measurement::FScale("EF2".to_string()));
        assert_eq!(report.lat, 41.5);
        assert_eq!(report.lon, -87.6);
    }

    #[tokio::test]
    async fn test_header_only_snapshot_skips_publish() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher::default()
            .with("240615_rpts_hail.csv", Ok("Time,Size,Location,County,State,Lat,Lon,Comments\n"));
        let publisher = RecordingPublisher::default();

        let result = collector(WeatherVariant::Hail, dir.path())
            .run(&fetcher, &CsvParser::new(), &Transformer::new(), &publisher)
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(result.record_count, 0);
        assert!(publisher.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_404_stops_before_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("wind.csv");
        // A stale file from an earlier tick must not be parsed.
        std::fs::write(&snapshot, "h\n1800,65,T,C,OK,35.1,-98.2,g\n").unwrap();

        let fetcher = FakeFetcher::default().with("240615_rpts_wind.csv", Err(404));
        let publisher = RecordingPublisher::default();

        let err = collector(WeatherVariant::Wind, dir.path())
            .run(&fetcher, &CsvParser::new(), &Transformer::new(), &publisher)
            .await
            .unwrap_err();

        assert_eq!(err.stage, Stage::Fetching);
        assert_eq!(err.variant, WeatherVariant::Wind);
        assert_eq!(err.kind(), ErrorKind::Fetch);
        assert!(publisher.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bad_row_publishes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher::default().with(
            "240615_rpts_torn.csv",
            Ok("h\n1230,EF1,A,B,KS,38.1,-97.2,ok\n1240,EF0,A,B,KS,n/a,-97.2,bad\n"),
        );
        let publisher = RecordingPublisher::default();

        let err = collector(WeatherVariant::Tornado, dir.path())
            .run(&fetcher, &CsvParser::new(), &Transformer::new(), &publisher)
            .await
            .unwrap_err();

        assert_eq!(err.stage, Stage::Transforming);
        assert_eq!(err.kind(), ErrorKind::Transform);
        assert!(publisher.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher::default().with("240615_rpts_torn.csv", Ok(TORNADO_CSV));
        let publisher = RecordingPublisher {
            fail: true,
            ..RecordingPublisher::default()
        };

        let err = collector(WeatherVariant::Tornado, dir.path())
            .run(&fetcher, &CsvParser::new(), &Transformer::new(), &publisher)
            .await
            .unwrap_err();

        assert_eq!(err.stage, Stage::Publishing);
        assert_eq!(err.kind(), ErrorKind::Publish);
    }

    #[test]
    fn test_run_tracker_attributes_failure_to_current_stage() {
        let mut run = RunTracker::new(WeatherVariant::Hail);
        run.enter(Stage::Fetching);
        run.enter(Stage::Parsing);
        let err = run.fail(FetchError::transport("boom"));
        assert_eq!(err.stage, Stage::Parsing);
        assert_eq!(run.state, RunState::Failed(Stage::Parsing));
    }
}
