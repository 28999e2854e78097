// =============================================================================
// models.rs — THE SHAPE OF A STORM REPORT
// =============================================================================
//
// Three kinds of severe weather, one CSV layout each, one JSON message shape
// that downstream consumers have learned to love. Every variant-specific
// detail (endpoint code, column list, the name of the measurement field)
// lives on WeatherVariant as plain data, so the collector itself never has
// to know whether it is chasing a tornado or a hailstone.
// =============================================================================

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ErrorKind, InvalidDateFormat, Stage};

/// Two-digit years above this are read as 19xx, everything else as 20xx.
/// This is the provider's convention, not a calendar-aware rule.
pub const TWO_DIGIT_YEAR_PIVOT: i32 = 24;

/// The three severe-weather report feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WeatherVariant {
    Tornado,
    Hail,
    Wind,
}

impl WeatherVariant {
    /// Collection order within a tick.
    pub const ALL: [WeatherVariant; 3] = [
        WeatherVariant::Tornado,
        WeatherVariant::Hail,
        WeatherVariant::Wind,
    ];

    /// Code used in the snapshot file name (`{date}_rpts_{code}.csv`).
    pub fn short_code(self) -> &'static str {
        match self {
            WeatherVariant::Tornado => "torn",
            WeatherVariant::Hail => "hail",
            WeatherVariant::Wind => "wind",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            WeatherVariant::Tornado => "tornado",
            WeatherVariant::Hail => "hail",
            WeatherVariant::Wind => "wind",
        }
    }

    /// The CSV column holding this variant's measurement.
    pub fn measurement_column(self) -> &'static str {
        match self {
            WeatherVariant::Tornado => "F_Scale",
            WeatherVariant::Hail => "Size",
            WeatherVariant::Wind => "Speed",
        }
    }

    /// Positional column names of the provider's CSV for this variant.
    pub fn csv_columns(self) -> Vec<String> {
        [
            "Time",
            self.measurement_column(),
            "Location",
            "County",
            "State",
            "Lat",
            "Lon",
            "Comments",
        ]
        .iter()
        .map(|c| c.to_string())
        .collect()
    }

    pub fn measurement(self, value: String) -> Measurement {
        match self {
            WeatherVariant::Tornado => Measurement::FScale(value),
            WeatherVariant::Hail => Measurement::Size(value),
            WeatherVariant::Wind => Measurement::Speed(value),
        }
    }
}

impl fmt::Display for WeatherVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A validated `YYMMDD` event date.
///
/// Parsed once; the UTC-midnight timestamp is computed up front so every
/// record of a tick carries the exact same `EventTs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDate {
    raw: String,
    date: NaiveDate,
}

impl EventDate {
    /// Parse `YYMMDD`. Anything that is not six ASCII digits naming a real
    /// calendar day is rejected; nothing rolls over into the next month.
    pub fn parse(raw: &str) -> Result<Self, InvalidDateFormat> {
        let invalid = || InvalidDateFormat(raw.to_string());

        if raw.len() != 6 || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let field = |range: std::ops::Range<usize>| -> Result<u32, InvalidDateFormat> {
            raw[range].parse::<u32>().map_err(|_| invalid())
        };
        let year = field(0..2)? as i32;
        let month = field(2..4)?;
        let day = field(4..6)?;

        let full_year = if year > TWO_DIGIT_YEAR_PIVOT {
            1900 + year
        } else {
            2000 + year
        };

        let date = NaiveDate::from_ymd_opt(full_year, month, day).ok_or_else(invalid)?;

        Ok(Self {
            raw: raw.to_string(),
            date,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// UTC midnight of the event date, in milliseconds since the epoch.
    pub fn event_ts_millis(&self) -> i64 {
        self.date.and_time(NaiveTime::MIN).and_utc().timestamp_millis()
    }
}

impl fmt::Display for EventDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Derive `EventTs` straight from a `YYMMDD` string.
pub fn derive_event_ts(event_date: &str) -> Result<i64, InvalidDateFormat> {
    EventDate::parse(event_date).map(|d| d.event_ts_millis())
}

/// One CSV data line, keyed by column name in column order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawReportRow {
    /// 1-based line number in the snapshot (the header is line 1).
    pub line: u64,
    pub fields: Vec<(String, String)>,
}

impl RawReportRow {
    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value.as_str())
    }
}

/// The variant-specific measurement. Serialized as a single field whose
/// name depends on the variant: `FScale`, `Size` or `Speed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Measurement {
    FScale(String),
    Size(String),
    Speed(String),
}

/// A typed, timestamped report ready for the broker. The JSON form of this
/// struct IS the outbound message format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EnrichedReport {
    /// Local report time as published by the provider (`HHMM`).
    pub time: String,
    pub event_ts: i64,
    pub emit_ts: i64,
    #[serde(flatten)]
    pub measurement: Measurement,
    pub location: String,
    pub county: String,
    pub state: String,
    pub lat: f64,
    pub lon: f64,
    pub comments: String,
}

impl EnrichedReport {
    pub fn to_message(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TickStatus {
    Success,
    Failed,
}

/// What one collector did during one tick. Logged, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickResult {
    pub variant: WeatherVariant,
    pub record_count: usize,
    pub status: TickStatus,
    pub failed_stage: Option<Stage>,
    pub error: Option<ErrorKind>,
}

impl TickResult {
    pub fn success(variant: WeatherVariant, record_count: usize) -> Self {
        Self {
            variant,
            record_count,
            status: TickStatus::Success,
            failed_stage: None,
            error: None,
        }
    }

    pub fn failed(variant: WeatherVariant, stage: Stage, error: ErrorKind) -> Self {
        Self {
            variant,
            record_count: 0,
            status: TickStatus::Failed,
            failed_stage: Some(stage),
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TickStatus::Success
    }
}
