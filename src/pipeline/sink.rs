//! Record sinks and the partial-record journal.
//!
//! A sink receives the final, unit-ordered record list once per run.
//! [`FileSink`] picks its format from the output extension (`.csv` → CSV,
//! anything else → JSON Lines) and writes through a temporary file, so an
//! interrupted write never leaves a truncated dataset behind.
//!
//! The journal (`<state_dir>/<input hash>.partial.jsonl`) holds the records
//! of units already checkpointed as completed. It is rewritten before every
//! session save, so whatever the session marks completed has its records on
//! disk, and a resumed run can still emit the full dataset.

use crate::checkpoint::write_atomic;
use crate::error::ExtractError;
use crate::output::ExtractedRecord;
use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Consumer of normalized, unit-ordered records.
pub trait RecordSink: Send {
    fn write(&mut self, records: &[ExtractedRecord]) -> Result<(), ExtractError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkFormat {
    JsonLines,
    Csv,
}

impl SinkFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => SinkFormat::Csv,
            _ => SinkFormat::JsonLines,
        }
    }
}

/// Writes the dataset to one file, atomically.
#[derive(Debug, Clone)]
pub struct FileSink {
    path: PathBuf,
    format: SinkFormat,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let format = SinkFormat::from_path(&path);
        Self { path, format }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordSink for FileSink {
    fn write(&mut self, records: &[ExtractedRecord]) -> Result<(), ExtractError> {
        let body = match self.format {
            SinkFormat::JsonLines => to_json_lines(records)?,
            SinkFormat::Csv => to_csv(records),
        };
        write_atomic(&self.path, body.as_bytes()).map_err(|source| {
            ExtractError::OutputWriteFailed {
                path: self.path.clone(),
                source,
            }
        })?;
        info!(
            path = %self.path.display(),
            records = records.len(),
            format = ?self.format,
            "output written"
        );
        Ok(())
    }
}

/// Keeps records in memory; for library callers and tests.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    pub records: Vec<ExtractedRecord>,
}

impl RecordSink for MemorySink {
    fn write(&mut self, records: &[ExtractedRecord]) -> Result<(), ExtractError> {
        self.records = records.to_vec();
        Ok(())
    }
}

fn to_json_lines(records: &[ExtractedRecord]) -> Result<String, ExtractError> {
    let mut out = String::new();
    for record in records {
        let line = serde_json::to_string(record)
            .map_err(|e| ExtractError::Internal(format!("record serialization: {e}")))?;
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

const CSV_HEADER: &str = "unit,record_key,text,has_visual,confidence,provenance";

fn to_csv(records: &[ExtractedRecord]) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');
    for r in records {
        let provenance = serde_json::to_string(&r.provenance).unwrap_or_default();
        let confidence = r.confidence.map(|c| c.to_string()).unwrap_or_default();
        let row = [
            (r.unit_index + 1).to_string(),
            csv_field(&r.record_key),
            csv_field(&r.text),
            r.has_visual.to_string(),
            confidence,
            csv_field(&provenance),
        ];
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

// ── Partial-record journal ───────────────────────────────────────────────

pub fn partial_journal_path(state_dir: &Path, input_hash: &str) -> PathBuf {
    state_dir.join(format!("{input_hash}.partial.jsonl"))
}

/// Replace the journal with `records`, grouped by unit.
pub fn write_partial(
    path: &Path,
    records: &BTreeMap<usize, Vec<ExtractedRecord>>,
) -> Result<(), ExtractError> {
    let flat: Vec<ExtractedRecord> = records.values().flatten().cloned().collect();
    let body = to_json_lines(&flat)?;
    write_atomic(path, body.as_bytes()).map_err(|source| ExtractError::StateWriteFailed {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), records = flat.len(), "partial journal written");
    Ok(())
}

/// Read the journal back. A missing journal is empty; unreadable lines are
/// skipped with a warning.
pub fn read_partial(path: &Path) -> Result<BTreeMap<usize, Vec<ExtractedRecord>>, ExtractError> {
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => {
            return Err(ExtractError::CorruptState {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })
        }
    };

    let mut by_unit: BTreeMap<usize, Vec<ExtractedRecord>> = BTreeMap::new();
    for (line_no, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| ExtractError::CorruptState {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ExtractedRecord>(&line) {
            Ok(record) => by_unit.entry(record.unit_index).or_default().push(record),
            Err(e) => warn!(
                path = %path.display(),
                line = line_no + 1,
                error = %e,
                "skipping unreadable journal line"
            ),
        }
    }
    Ok(by_unit)
}

pub fn remove_partial(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "could not remove partial journal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn record(unit: usize, key: &str, text: &str) -> ExtractedRecord {
        ExtractedRecord {
            unit_index: unit,
            record_key: key.into(),
            text: text.into(),
            has_visual: false,
            confidence: Some(0.5),
            provenance: BTreeMap::from([("section".to_string(), json!("A"))]),
        }
    }

    #[test]
    fn format_follows_extension() {
        assert_eq!(SinkFormat::from_path(Path::new("out.csv")), SinkFormat::Csv);
        assert_eq!(SinkFormat::from_path(Path::new("out.CSV")), SinkFormat::Csv);
        assert_eq!(
            SinkFormat::from_path(Path::new("out.jsonl")),
            SinkFormat::JsonLines
        );
        assert_eq!(SinkFormat::from_path(Path::new("out")), SinkFormat::JsonLines);
    }

    #[test]
    fn jsonl_sink_writes_one_line_per_record() {
        let dir = TempDir::new().unwrap();
        let mut sink = FileSink::new(dir.path().join("nested/out.jsonl"));
        sink.write(&[record(0, "1", "a"), record(1, "2", "b")]).unwrap();

        let body = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<_> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: ExtractedRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.record_key, "1");
    }

    #[test]
    fn csv_sink_quotes_awkward_fields() {
        let dir = TempDir::new().unwrap();
        let mut sink = FileSink::new(dir.path().join("out.csv"));
        sink.write(&[record(2, "7", "Say \"hi\", then count")]).unwrap();

        let body = std::fs::read_to_string(sink.path()).unwrap();
        let mut lines = body.lines();
        assert_eq!(lines.next(), Some(CSV_HEADER));
        assert_eq!(
            lines.next(),
            Some(r#"3,7,"Say ""hi"", then count",false,0.5,"{""section"":""A""}""#)
        );
    }

    #[test]
    fn journal_round_trip_and_removal() {
        let dir = TempDir::new().unwrap();
        let path = partial_journal_path(dir.path(), "abc");
        assert!(read_partial(&path).unwrap().is_empty());

        let records = BTreeMap::from([
            (0, vec![record(0, "1", "a"), record(0, "2", "b")]),
            (3, vec![record(3, "9", "c")]),
        ]);
        write_partial(&path, &records).unwrap();
        assert_eq!(read_partial(&path).unwrap(), records);

        remove_partial(&path);
        assert!(!path.exists());
        remove_partial(&path);
    }

    #[test]
    fn journal_skips_garbage_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("j.partial.jsonl");
        let good = serde_json::to_string(&record(1, "1", "a")).unwrap();
        std::fs::write(&path, format!("{good}\n{{truncated\n")).unwrap();
        let read = read_partial(&path).unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[&1].len(), 1);
    }
}
