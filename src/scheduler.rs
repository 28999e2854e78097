// =============================================================================
// scheduler.rs — THE TICK
// =============================================================================
//
// On every cron trigger the scheduler walks the collectors in their
// configured order and runs each one to completion before starting the next.
// One collector at a time keeps the logs readable and the broker calm.
//
// Failure isolation is a contract, not a loop accident: every run returns a
// Result, and every Err is logged against the variant that produced it and
// folded into a Failed TickResult. A broken hail feed never stops the wind
// collector from running in the same tick.
//
// Overlap policy: SKIP. The next trigger is computed only after a tick has
// finished. Triggers that came and went while a slow tick was still running
// are counted, logged, and dropped. They are never queued up and replayed.
// =============================================================================

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{error, info, info_span, warn, Instrument};

use crate::collector::Collector;
use crate::error::ScheduleError;
use crate::fetcher::SnapshotFetcher;
use crate::models::TickResult;
use crate::parser::CsvParser;
use crate::publisher::ReportPublisher;
use crate::transformer::Transformer;

/// A parsed cron schedule.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expr: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    /// Accepts standard 5-field cron. A `0` seconds field is prepended and
    /// numeric weekdays (Sunday = 0 or 7) are rewritten as names, since the
    /// `cron` crate wants 6 or 7 fields and counts weekdays from Sunday = 1.
    pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
        let normalized = normalize_cron_expr(expr);
        let schedule =
            cron::Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCron {
                expr: expr.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            expr: expr.trim().to_string(),
            schedule,
        })
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// First trigger strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        self.schedule
            .after(&after)
            .next()
            .ok_or_else(|| ScheduleError::Exhausted(self.expr.clone()))
    }

    /// Triggers in `(start, end]`: the ones a tick spanning that window
    /// sat on top of.
    pub fn missed_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> usize {
        self.schedule
            .after(&start)
            .take_while(|t| *t <= end)
            .count()
    }
}

const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

fn normalize_cron_expr(expr: &str) -> String {
    let trimmed = expr.trim();
    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    match fields.as_slice() {
        [minute, hour, day, month, weekday] => format!(
            "0 {minute} {hour} {day} {month} {}",
            normalize_day_of_week(weekday)
        ),
        _ => trimmed.to_string(),
    }
}

/// Rewrite a standard cron day-of-week field (0-7, Sunday = 0 and 7) as a
/// list of weekday names. Items that are already names, or that are not
/// valid, pass through untouched for the `cron` crate to judge.
fn normalize_day_of_week(field: &str) -> String {
    field
        .split(',')
        .map(normalize_day_of_week_item)
        .collect::<Vec<_>>()
        .join(",")
}

fn normalize_day_of_week_item(item: &str) -> String {
    let (base, step) = match item.split_once('/') {
        Some((base, step)) => match step.parse::<usize>() {
            Ok(step) if step > 0 => (base, step),
            _ => return item.to_string(),
        },
        None => (item, 1),
    };

    let bounds: Option<(u32, u32)> = match base {
        "*" | "?" if step == 1 => return item.to_string(),
        "*" | "?" => Some((0, 6)),
        _ => match base.split_once('-') {
            Some((lo, hi)) => lo.parse().ok().zip(hi.parse().ok()),
            // `n/step` runs from n to the end of the week.
            None if step > 1 => base.parse().ok().map(|lo| (lo, 6)),
            None => base.parse().ok().map(|day| (day, day)),
        },
    };

    match bounds {
        Some((lo, hi)) if lo <= hi && hi <= 7 => (lo..=hi)
            .step_by(step)
            .map(|day| WEEKDAYS[(day % 7) as usize])
            .collect::<Vec<_>>()
            .join(","),
        _ => item.to_string(),
    }
}

/// End-of-tick roll-up.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TickSummary {
    pub tick: u64,
    pub results: Vec<TickResult>,
    pub succeeded: usize,
    pub failed: usize,
    pub records: usize,
}

impl TickSummary {
    fn new(tick: u64, results: Vec<TickResult>) -> Self {
        let succeeded = results.iter().filter(|r| r.is_success()).count();
        let records = results.iter().map(|r| r.record_count).sum();
        Self {
            tick,
            failed: results.len() - succeeded,
            succeeded,
            records,
            results,
        }
    }
}

/// Drives every collector through its lifecycle, once per tick.
pub struct TickScheduler {
    collectors: Vec<Collector>,
    fetcher: Arc<dyn SnapshotFetcher>,
    publisher: Arc<dyn ReportPublisher>,
    parser: CsvParser,
    transformer: Transformer,
    ticks: u64,
}

impl TickScheduler {
    pub fn new(
        collectors: Vec<Collector>,
        fetcher: Arc<dyn SnapshotFetcher>,
        publisher: Arc<dyn ReportPublisher>,
    ) -> Self {
        Self {
            collectors,
            fetcher,
            publisher,
            parser: CsvParser::new(),
            transformer: Transformer::new(),
            ticks: 0,
        }
    }

    pub fn collectors(&self) -> &[Collector] {
        &self.collectors
    }

    /// Run one tick: every collector, in order, one at a time.
    pub async fn on_tick(&mut self) -> TickSummary {
        self.ticks += 1;
        let tick = self.ticks;
        let span = info_span!("tick", tick);
        self.run_collectors(tick).instrument(span).await
    }

    async fn run_collectors(&self, tick: u64) -> TickSummary {
        let mut results = Vec::with_capacity(self.collectors.len());

        for collector in &self.collectors {
            let outcome = collector
                .run(
                    self.fetcher.as_ref(),
                    &self.parser,
                    &self.transformer,
                    self.publisher.as_ref(),
                )
                .await;

            let result = match outcome {
                Ok(result) => result,
                Err(e) => {
                    error!(
                        variant = %e.variant,
                        stage = %e.stage,
                        error = %e.source,
                        "Error syncing {} data",
                        e.variant
                    );
                    TickResult::failed(e.variant, e.stage, e.kind())
                }
            };
            results.push(result);
        }

        let summary = TickSummary::new(tick, results);
        let publisher = self.publisher.snapshot();
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            records = summary.records,
            messages_published = publisher.messages_published,
            publish_errors = publisher.publish_errors,
            "Tick completed"
        );
        summary
    }

    /// Run ticks on `schedule` until `shutdown` flips to true. Shutdown is
    /// only observed between ticks; a running tick is allowed to finish.
    pub async fn run(
        mut self,
        schedule: CronSchedule,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<u64, ScheduleError> {
        info!(
            cron = schedule.expr(),
            collectors = self.collectors.len(),
            "Scheduler started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let now = Utc::now();
            let next = schedule.next_after(now)?;
            let wait = (next - now).to_std().unwrap_or_default();

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {
                    info!("Shutdown requested, no further ticks will start");
                    break;
                }
            }

            let started = Utc::now();
            self.on_tick().await;
            let skipped = schedule.missed_between(started, Utc::now());
            if skipped > 0 {
                warn!(
                    skipped,
                    "Tick outlasted its interval, skipped overlapping triggers"
                );
            }
        }

        info!(ticks = self.ticks, "Scheduler stopped");
        Ok(self.ticks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::tests::{
        collector, FakeFetcher, RecordingPublisher, TORNADO_CSV,
    };
    use crate::error::{ErrorKind, Stage};
    use crate::models::{TickStatus, WeatherVariant};
    use chrono::TimeZone;
    use std::io;
    use std::sync::Mutex;
    use tracing_subscriber::fmt::MakeWriter;

    const WIND_CSV: &str = "Time,Speed,Location,County,State,Lat,Lon,Comments\n\
        1800,65,Town,County,OK,35.1,-98.2,gust\n\
        1815,UNK,Other,County,OK,35.2,-98.1,trees down\n";

    fn scheduler(dir: &std::path::Path, fetcher: FakeFetcher) -> (TickScheduler, Arc<RecordingPublisher>) {
        let publisher = Arc::new(RecordingPublisher::default());
        let collectors = WeatherVariant::ALL
            .iter()
            .map(|v| collector(*v, dir))
            .collect();
        let scheduler = TickScheduler::new(collectors, Arc::new(fetcher), publisher.clone());
        (scheduler, publisher)
    }

    #[test]
    fn test_five_field_cron_is_normalized() {
        let schedule = CronSchedule::parse("* * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 12, 30, 15).unwrap();
        assert_eq!(
            schedule.next_after(now).unwrap(),
            Utc.with_ymd_and_hms(2024, 6, 15, 12, 31, 0).unwrap()
        );
    }

    #[test]
    fn test_weekday_range_counts_from_sunday_zero() {
        // Saturday noon; Monday to Friday means the next run is Monday.
        let saturday = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        let weekdays = CronSchedule::parse("0 0 * * 1-5").unwrap();
        assert_eq!(
            weekdays.next_after(saturday).unwrap(),
            Utc.with_ymd_and_hms(2024, 6, 17, 0, 0, 0).unwrap()
        );

        let friday = Utc.with_ymd_and_hms(2024, 6, 21, 12, 0, 0).unwrap();
        assert_eq!(
            weekdays.next_after(friday).unwrap(),
            Utc.with_ymd_and_hms(2024, 6, 24, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_sunday_is_zero_or_seven() {
        let saturday = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        let sunday = Utc.with_ymd_and_hms(2024, 6, 16, 0, 0, 0).unwrap();
        for expr in ["0 0 * * 0", "0 0 * * 7", "0 0 * * 0,3"] {
            let schedule = CronSchedule::parse(expr).unwrap();
            assert_eq!(schedule.next_after(saturday).unwrap(), sunday, "{expr}");
        }
    }

    #[test]
    fn test_day_of_week_rewrite() {
        assert_eq!(normalize_day_of_week("*"), "*");
        assert_eq!(normalize_day_of_week("1-5"), "Mon,Tue,Wed,Thu,Fri");
        assert_eq!(normalize_day_of_week("5-7"), "Fri,Sat,Sun");
        assert_eq!(normalize_day_of_week("*/2"), "Sun,Tue,Thu,Sat");
        assert_eq!(normalize_day_of_week("0,6"), "Sun,Sat");
        assert_eq!(normalize_day_of_week("Mon-Fri"), "Mon-Fri");
        assert_eq!(
            normalize_cron_expr(" 30 6 * * 1 "),
            "0 30 6 * * Mon"
        );
        assert_eq!(normalize_cron_expr("0 0 6 * * *"), "0 0 6 * * *");
    }

    #[test]
    fn test_out_of_range_weekday_is_rejected() {
        assert!(matches!(
            CronSchedule::parse("0 0 * * 8"),
            Err(ScheduleError::InvalidCron { .. })
        ));
    }

    #[test]
    fn test_invalid_cron_is_rejected() {
        assert!(matches!(
            CronSchedule::parse("every minute please"),
            Err(ScheduleError::InvalidCron { .. })
        ));
    }

    #[test]
    fn test_missed_triggers_are_counted() {
        let schedule = CronSchedule::parse("* * * * *").unwrap();
        let start = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 30).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 6, 15, 12, 3, 10).unwrap();
        assert_eq!(schedule.missed_between(start, end), 3);
        assert_eq!(schedule.missed_between(start, start), 0);
    }

    #[tokio::test]
    async fn test_failed_collector_does_not_stop_the_tick() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher::default()
            .with("240615_rpts_torn.csv", Err(404))
            .with("240615_rpts_hail.csv", Ok("header only\n"))
            .with("240615_rpts_wind.csv", Ok(WIND_CSV));
        let (mut scheduler, publisher) = scheduler(dir.path(), fetcher);

        let summary = scheduler.on_tick().await;

        assert_eq!(summary.tick, 1);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.records, 2);

        let tornado = &summary.results[0];
        assert_eq!(tornado.variant, WeatherVariant::Tornado);
        assert_eq!(tornado.status, TickStatus::Failed);
        assert_eq!(tornado.failed_stage, Some(Stage::Fetching));
        assert_eq!(tornado.error, Some(ErrorKind::Fetch));

        assert_eq!(summary.results[1], TickResult::success(WeatherVariant::Hail, 0));
        assert_eq!(summary.results[2], TickResult::success(WeatherVariant::Wind, 2));

        // Only wind had anything to say.
        assert_eq!(publisher.batches.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_collectors_run_in_configured_order() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(
            FakeFetcher::default()
                .with("240615_rpts_torn.csv", Ok(TORNADO_CSV))
                .with("240615_rpts_wind.csv", Ok(WIND_CSV)),
        );
        let publisher = Arc::new(RecordingPublisher::default());
        let collectors = vec![
            collector(WeatherVariant::Wind, dir.path()),
            collector(WeatherVariant::Hail, dir.path()),
            collector(WeatherVariant::Tornado, dir.path()),
        ];
        let mut scheduler = TickScheduler::new(collectors, fetcher.clone(), publisher.clone());

        let summary = scheduler.on_tick().await;
        let order: Vec<_> = summary.results.iter().map(|r| r.variant).collect();
        assert_eq!(
            order,
            [WeatherVariant::Wind, WeatherVariant::Hail, WeatherVariant::Tornado]
        );
        assert_eq!(
            *fetcher.calls.lock().unwrap(),
            [
                "240615_rpts_wind.csv",
                "240615_rpts_hail.csv",
                "240615_rpts_torn.csv"
            ]
        );
        // Hail had no canned body so it failed, the others still published.
        assert_eq!(summary.failed, 1);
        assert_eq!(publisher.batches.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_tick_counter_advances() {
        let dir = tempfile::tempdir().unwrap();
        let (mut scheduler, _) = scheduler(dir.path(), FakeFetcher::default());

        assert_eq!(scheduler.on_tick().await.tick, 1);
        let second = scheduler.on_tick().await;
        assert_eq!(second.tick, 2);
        assert_eq!(second.failed, 3);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _) = scheduler(dir.path(), FakeFetcher::default());
        let schedule = CronSchedule::parse("0 0 1 1 *").unwrap();
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(scheduler.run(schedule, rx));
        tx.send(true).unwrap();

        let ticks = handle.await.unwrap().unwrap();
        assert_eq!(ticks, 0);
    }

    /// In-memory log sink.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_failure_is_logged_against_the_failing_variant() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher::default()
            .with("240615_rpts_torn.csv", Ok(TORNADO_CSV))
            .with("240615_rpts_hail.csv", Err(404))
            .with("240615_rpts_wind.csv", Ok(WIND_CSV));
        let (mut scheduler, _) = scheduler(dir.path(), fetcher);

        let sink = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(sink.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        scheduler.on_tick().await;

        let logs = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("Error syncing hail data"), "{logs}");
        assert!(!logs.contains("Error syncing tornado data"), "{logs}");
        assert!(logs.contains("Tick completed"), "{logs}");
    }
}
