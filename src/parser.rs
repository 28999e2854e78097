// =============================================================================
// parser.rs — CSV IN, ROWS OUT
// =============================================================================
//
// The snapshot is a header line followed by one report per line. Columns are
// positional: we ignore whatever the header says and map field N onto the
// Nth configured column name. The provider occasionally publishes a short
// line, so rows are allowed to be ragged; missing trailing columns become
// empty strings and extra fields are dropped.
//
// A missing file or a header-only file is simply "no reports today".
// =============================================================================

use std::path::Path;

use tracing::debug;

use crate::error::ParseError;
use crate::models::RawReportRow;

#[derive(Debug, Clone, Copy, Default)]
pub struct CsvParser;

impl CsvParser {
    pub fn new() -> Self {
        Self
    }

    /// Read `path` and map every data line onto `columns`.
    pub async fn parse(
        &self,
        path: &Path,
        columns: &[String],
    ) -> Result<Vec<RawReportRow>, ParseError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Snapshot file does not exist, nothing to parse");
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(ParseError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        self.parse_bytes(&bytes, columns).map_err(|source| ParseError::Csv {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse an in-memory snapshot. The first record is always treated as
    /// the header and skipped.
    pub fn parse_bytes(
        &self,
        bytes: &[u8],
        columns: &[String],
    ) -> Result<Vec<RawReportRow>, csv::Error> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(bytes);

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            let line = record.position().map(|p| p.line()).unwrap_or_default();

            let fields = columns
                .iter()
                .enumerate()
                .map(|(idx, column)| {
                    let value = record.get(idx).unwrap_or_default().to_string();
                    (column.clone(), value)
                })
                .collect();

            rows.push(RawReportRow { line, fields });
        }

        Ok(rows)
    }
}
