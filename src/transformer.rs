// =============================================================================
// transformer.rs — RAW ROWS BECOME REPORTS
// =============================================================================
//
// Types each row and stamps it twice:
//   EventTs — UTC midnight of the event date. Computed once per call, so
//             every record in a batch carries the identical value.
//   EmitTs  — wall clock at the moment THIS record was produced. Captured
//             per record, not per batch; records in one batch may differ by
//             a millisecond or two and never go backwards.
// =============================================================================

use chrono::Utc;

use crate::error::{InvalidDateFormat, TransformError};
use crate::models::{derive_event_ts, EnrichedReport, RawReportRow, WeatherVariant};

/// Source of `EmitTs`, in UTC milliseconds.
pub type Clock = fn() -> i64;

fn wall_clock() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, thiserror::Error)]
pub enum TransformFailure {
    #[error(transparent)]
    InvalidDate(#[from] InvalidDateFormat),

    #[error(transparent)]
    Field(#[from] TransformError),
}

#[derive(Debug, Clone, Copy)]
pub struct Transformer {
    clock: Clock,
}

impl Default for Transformer {
    fn default() -> Self {
        Self::new()
    }
}

impl Transformer {
    pub fn new() -> Self {
        Self { clock: wall_clock }
    }

    /// Use a fixed clock instead of the wall clock.
    #[cfg(test)]
    pub fn with_clock(clock: Clock) -> Self {
        Self { clock }
    }

    /// Turn every row into an `EnrichedReport`. Fails as a whole: either
    /// every row is typed or nothing is returned.
    pub fn transform(
        &self,
        variant: WeatherVariant,
        rows: &[RawReportRow],
        event_date: &str,
    ) -> Result<Vec<EnrichedReport>, TransformFailure> {
        let event_ts = derive_event_ts(event_date)?;

        let mut reports = Vec::with_capacity(rows.len());
        for row in rows {
            reports.push(self.enrich(variant, row, event_ts)?);
        }
        Ok(reports)
    }

    fn enrich(
        &self,
        variant: WeatherVariant,
        row: &RawReportRow,
        event_ts: i64,
    ) -> Result<EnrichedReport, TransformError> {
        let text = |column: &str| row.get(column).unwrap_or_default().to_string();

        Ok(EnrichedReport {
            time: text("Time"),
            event_ts,
            emit_ts: (self.clock)(),
            measurement: variant.measurement(text(variant.measurement_column())),
            location: text("Location"),
            county: text("County"),
            state: text("State"),
            lat: coordinate(row, "Lat")?,
            lon: coordinate(row, "Lon")?,
            comments: text("Comments"),
        })
    }
}

fn coordinate(row: &RawReportRow, column: &str) -> Result<f64, TransformError> {
    let raw = row.get(column).unwrap_or_default();
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| TransformError {
            line: row.line,
            column: column.to_string(),
            value: raw.to_string(),
        })
}
