//! Append-only attendance record, one JSON object per line.
//!
//! Every reported detection becomes a `Name / Date / Time / Status` row.
//! The file is never rewritten; readers skip lines they cannot parse.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::AttendanceStatus;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";

#[derive(Error, Debug)]
pub enum LogError {
    #[error("attendance log io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("attendance record encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub name: String,
    pub date: String,
    pub time: String,
    pub status: AttendanceStatus,
}

impl AttendanceRecord {
    pub fn new(name: &str, status: AttendanceStatus, at: DateTime<Local>) -> Self {
        Self {
            name: name.to_string(),
            date: at.format(DATE_FORMAT).to_string(),
            time: at.format(TIME_FORMAT).to_string(),
            status,
        }
    }

    fn day(&self) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(&self.date, DATE_FORMAT).ok()
    }
}

/// Totals over the records in a date range.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AttendanceStats {
    pub total_records: usize,
    pub present: usize,
    pub unknown: usize,
    /// Present rows per name.
    pub per_person: BTreeMap<String, usize>,
    pub last_entry: Option<AttendanceRecord>,
}

pub struct AttendanceLog {
    path: PathBuf,
}

impl AttendanceLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `records` in one write. An empty slice touches nothing.
    pub fn append(&self, records: &[AttendanceRecord]) -> Result<(), LogError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut lines = Vec::new();
        for record in records {
            serde_json::to_writer(&mut lines, record)?;
            lines.push(b'\n');
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(&lines)?;

        tracing::debug!(count = records.len(), path = %self.path.display(), "attendance appended");
        Ok(())
    }

    /// Every parseable record, oldest first. A missing file is empty.
    pub fn records(&self) -> Result<Vec<AttendanceRecord>, LogError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (index, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(line = index + 1, error = %e, "skipping malformed attendance row"),
            }
        }
        Ok(records)
    }

    /// Statistics over records dated within `[from, to]`; open bounds are unbounded.
    pub fn stats(&self, from: Option<NaiveDate>, to: Option<NaiveDate>) -> Result<AttendanceStats, LogError> {
        let mut stats = AttendanceStats::default();
        for record in self.records()? {
            // Rows with an unreadable date only count when the range is open.
            let day = record.day();
            let before = from.is_some_and(|from| day.map_or(true, |d| d < from));
            let after = to.is_some_and(|to| day.map_or(true, |d| d > to));
            if before || after {
                continue;
            }

            stats.total_records += 1;
            match record.status {
                AttendanceStatus::Present => {
                    stats.present += 1;
                    *stats.per_person.entry(record.name.clone()).or_default() += 1;
                }
                AttendanceStatus::Unknown => stats.unknown += 1,
            }
            stats.last_entry = Some(record);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn at(day: u32, hour: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 3, day, hour, 15, 0).unwrap()
    }

    #[test]
    fn test_record_fields() {
        let record = AttendanceRecord::new("Ann", AttendanceStatus::Present, at(4, 9));
        assert_eq!(record.date, "2025-03-04");
        assert_eq!(record.time, "09:15:00");
        assert_eq!(
            serde_json::to_string(&record).unwrap(),
            r#"{"name":"Ann","date":"2025-03-04","time":"09:15:00","status":"Present"}"#
        );
    }

    #[test]
    fn test_append_then_read_back() {
        let dir = TempDir::new().unwrap();
        let log = AttendanceLog::new(dir.path().join("logs").join("attendance.jsonl"));
        assert!(log.records().unwrap().is_empty());

        log.append(&[
            AttendanceRecord::new("Ann", AttendanceStatus::Present, at(4, 9)),
            AttendanceRecord::new("Unknown", AttendanceStatus::Unknown, at(4, 9)),
        ])
        .unwrap();
        log.append(&[AttendanceRecord::new("Bob", AttendanceStatus::Present, at(5, 10))])
            .unwrap();

        let names: Vec<String> = log.records().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["Ann", "Unknown", "Bob"]);
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let dir = TempDir::new().unwrap();
        let log = AttendanceLog::new(dir.path().join("attendance.jsonl"));
        log.append(&[AttendanceRecord::new("Ann", AttendanceStatus::Present, at(4, 9))])
            .unwrap();
        let mut file = OpenOptions::new().append(true).open(log.path()).unwrap();
        file.write_all(b"{truncated\n\n").unwrap();
        log.append(&[AttendanceRecord::new("Bob", AttendanceStatus::Present, at(4, 9))])
            .unwrap();

        assert_eq!(log.records().unwrap().len(), 2);
    }

    #[test]
    fn test_stats_by_date_range() {
        let dir = TempDir::new().unwrap();
        let log = AttendanceLog::new(dir.path().join("attendance.jsonl"));
        log.append(&[
            AttendanceRecord::new("Ann", AttendanceStatus::Present, at(3, 9)),
            AttendanceRecord::new("Ann", AttendanceStatus::Present, at(4, 9)),
            AttendanceRecord::new("Bob", AttendanceStatus::Present, at(4, 9)),
            AttendanceRecord::new("Unknown", AttendanceStatus::Unknown, at(4, 11)),
            AttendanceRecord::new("Ann", AttendanceStatus::Present, at(6, 9)),
        ])
        .unwrap();

        let all = log.stats(None, None).unwrap();
        assert_eq!(all.total_records, 5);
        assert_eq!(all.per_person["Ann"], 3);

        let day = NaiveDate::from_ymd_opt(2025, 3, 4);
        let fourth = log.stats(day, day).unwrap();
        assert_eq!(fourth.total_records, 3);
        assert_eq!(fourth.present, 2);
        assert_eq!(fourth.unknown, 1);
        assert_eq!(fourth.per_person.get("Ann"), Some(&1));
        assert_eq!(fourth.last_entry.unwrap().time, "11:15:00");
    }
}
