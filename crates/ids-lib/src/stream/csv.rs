//! CSV-backed record source
//!
//! The stream file is a CSV with a header row naming the features (plus an
//! optional trailing `label` column). Categorical columns are kept as text,
//! every other column is parsed as a number.

use super::RecordSource;
use crate::error::{IdsError, Result};
use crate::models::{is_categorical, FeatureValue, TrafficRecord, LABEL_COLUMN};
use anyhow::Context;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Append-only CSV file tailed by the monitor
#[derive(Debug, Clone)]
pub struct CsvFileSource {
    path: PathBuf,
    id: String,
}

impl CsvFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let id = path.display().to_string();
        Self { path, id }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_text(&self) -> Result<Option<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(IdsError::stream_read(&self.id, e)),
        }
    }
}

#[async_trait]
impl RecordSource for CsvFileSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn read_from(&self, offset: u64) -> Result<Option<Vec<TrafficRecord>>> {
        let Some(text) = self.read_text().await? else {
            return Ok(None);
        };
        let records = parse_csv(&text, offset).map_err(|e| IdsError::stream_read(&self.id, e))?;
        debug!(source = %self.id, offset, new_records = records.len(), "Read record source");
        Ok(Some(records))
    }

    async fn record_count(&self) -> Result<Option<u64>> {
        Ok(self.read_text().await?.map(|text| data_lines(&text).count() as u64))
    }
}

/// Non-blank lines after the header
fn data_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .skip(1)
}

/// Split one line into cells. Double-quoted cells may hold commas and `""`
/// escapes; quoted cells spanning lines are not supported.
fn split_row(line: &str) -> std::result::Result<Vec<String>, String> {
    let mut cells = Vec::new();
    let mut cell = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    cell.push('"');
                } else {
                    quoted = false;
                }
            }
            '"' if cell.trim().is_empty() => {
                cell.clear();
                quoted = true;
            }
            ',' if !quoted => cells.push(std::mem::take(&mut cell).trim().to_string()),
            _ => cell.push(c),
        }
    }

    if quoted {
        return Err("unterminated quoted cell".to_string());
    }
    cells.push(cell.trim().to_string());
    Ok(cells)
}

fn parse_cell(column: &str, cell: &str) -> FeatureValue {
    if is_categorical(column) || column == LABEL_COLUMN {
        return FeatureValue::Text(cell.to_string());
    }
    match cell.parse::<f64>() {
        Ok(v) => FeatureValue::Number(v),
        Err(_) => FeatureValue::Text(cell.to_string()),
    }
}

/// Parse the data rows at index `offset` and beyond. Rows before the offset
/// are skipped without being parsed.
pub fn parse_csv(text: &str, offset: u64) -> std::result::Result<Vec<TrafficRecord>, String> {
    let mut lines = text.lines().filter(|line| !line.trim().is_empty());
    let Some(header_line) = lines.next() else {
        return Ok(Vec::new());
    };
    let header = split_row(header_line).map_err(|e| format!("header row: {}", e))?;
    if header.iter().any(|h| h.is_empty()) {
        return Err("header row contains an empty column name".to_string());
    }

    let mut records = Vec::new();
    for (index, line) in lines.enumerate() {
        if (index as u64) < offset {
            continue;
        }
        let cells = split_row(line).map_err(|e| format!("row {}: {}", index + 1, e))?;
        if cells.len() != header.len() {
            return Err(format!(
                "row {} has {} columns, header has {}",
                index + 1,
                cells.len(),
                header.len()
            ));
        }
        let record: TrafficRecord = header
            .iter()
            .zip(cells)
            .map(|(column, cell)| (column.to_string(), parse_cell(column, &cell)))
            .collect();
        records.push(record);
    }

    Ok(records)
}

/// Load a labeled reference dataset (e.g. the training CSV) for fitting
pub fn read_dataset(path: &Path) -> anyhow::Result<Vec<TrafficRecord>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read dataset {:?}", path))?;
    parse_csv(&text, 0)
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("Malformed dataset {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = "duration,protocol_type,service,flag,src_bytes,label
0,tcp,http,SF,181,normal
2,udp,domain_u,SF,45,attack

0,icmp,ecr_i,SF,1032,attack
";

    #[test]
    fn test_parse_all_rows() {
        let records = parse_csv(SAMPLE, 0).unwrap();
        assert_eq!(records.len(), 3);

        let first = &records[0];
        assert_eq!(first.get("protocol_type"), Some(&FeatureValue::from("tcp")));
        assert_eq!(first.get("src_bytes"), Some(&FeatureValue::Number(181.0)));
        assert_eq!(first.get("label"), Some(&FeatureValue::from("normal")));
    }

    #[test]
    fn test_parse_from_offset() {
        let records = parse_csv(SAMPLE, 2).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text("service"), "ecr_i");

        assert!(parse_csv(SAMPLE, 3).unwrap().is_empty());
        assert!(parse_csv(SAMPLE, 10).unwrap().is_empty());
    }

    #[test]
    fn test_header_only_and_empty() {
        assert!(parse_csv("duration,service\n", 0).unwrap().is_empty());
        assert!(parse_csv("", 0).unwrap().is_empty());
        assert_eq!(data_lines("duration,service\n").count(), 0);
        assert_eq!(data_lines(SAMPLE).count(), 3);
    }

    #[test]
    fn test_malformed_row() {
        let text = "duration,service\n1,http\n2\n";
        assert!(parse_csv(text, 0).is_err());
        // Rows before the offset are not inspected
        assert!(parse_csv("duration,service\n2\n1,http\n", 1).is_ok());
    }

    #[test]
    fn test_quoted_cells() {
        let text = "service,flag,count\n\"http, alt\",\"S\"\"0\",4\n";
        let records = parse_csv(text, 0).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text("service"), "http, alt");
        assert_eq!(records[0].text("flag"), "S\"0");
        assert_eq!(records[0].get("count"), Some(&FeatureValue::Number(4.0)));

        assert_eq!(split_row(" \"a\" ,b").unwrap(), vec!["a", "b"]);
        assert!(parse_csv("service,count\n\"http,4\n", 0).is_err());
    }

    #[test]
    fn test_numeric_categorical_stays_text() {
        let records = parse_csv("service,count\n80,3\n", 0).unwrap();
        assert_eq!(records[0].get("service"), Some(&FeatureValue::from("80")));
        assert_eq!(records[0].get("count"), Some(&FeatureValue::Number(3.0)));
    }

    #[tokio::test]
    async fn test_missing_file_reports_none() {
        let dir = TempDir::new().unwrap();
        let source = CsvFileSource::new(dir.path().join("stream_data.csv"));
        assert!(source.read_from(0).await.unwrap().is_none());
        assert!(source.record_count().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_source() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stream_data.csv");
        std::fs::write(&path, SAMPLE).unwrap();

        let source = CsvFileSource::new(&path);
        assert_eq!(source.id(), path.display().to_string());
        assert_eq!(source.record_count().await.unwrap(), Some(3));
        assert_eq!(source.read_from(1).await.unwrap().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_file_is_stream_read_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stream_data.csv");
        std::fs::write(&path, "duration,service\n1\n").unwrap();

        let err = CsvFileSource::new(&path).read_from(0).await.unwrap_err();
        assert!(matches!(err, IdsError::StreamRead { .. }));
    }

    #[test]
    fn test_read_dataset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("training_data.csv");
        std::fs::write(&path, SAMPLE).unwrap();

        assert_eq!(read_dataset(&path).unwrap().len(), 3);
        assert!(read_dataset(&dir.path().join("missing.csv")).is_err());
    }
}
