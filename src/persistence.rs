//! The append-only scan log.
//!
//! Every completed optimization is shadow-recorded as one JSON object per
//! line. On startup an existing log is replayed into the task cache so a
//! restarted scan never repeats finished work. Records carry their fields by
//! name, so readers ignore fields added by later versions.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use derive_more::{Display, Error, From};
use serde::{Deserialize, Serialize};

use crate::E;
use crate::geometry::Geometry;
use crate::scan::state::{Job, JobStatus, ResultRecord};

/// Default log file name, relative to the working directory.
pub const DEFAULT_LOG_PATH: &str = "scan.log";

#[derive(Debug, Display, Error, From)]
pub enum PersistError {
    #[display("scan log i/o error: {source}")]
    Io { source: std::io::Error },
    #[display("could not encode scan log record: {source}")]
    Encode { source: serde_json::Error },
    #[display("scan log corrupt at line {line}: {source}")]
    #[from(ignore)]
    Corrupt {
        line: usize,
        source: serde_json::Error,
    },
}

/// One completed optimization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: String,
    /// Target grid point, comma-joined integers.
    pub grid: String,
    pub start: Geometry,
    #[serde(rename = "final")]
    pub final_geometry: Geometry,
    pub energy: Option<E>,
    pub status: JobStatus,
}

impl LogRecord {
    pub fn new(job: &Job, record: &ResultRecord) -> Self {
        LogRecord {
            id: job.id.clone(),
            grid: job.target.to_string(),
            start: record.start.clone(),
            final_geometry: record.final_geometry.clone(),
            energy: record.final_energy,
            status: record.status,
        }
    }

    pub fn into_result(self) -> ResultRecord {
        ResultRecord {
            start: self.start,
            final_geometry: self.final_geometry,
            final_energy: self.energy,
            status: self.status,
        }
    }
}

/// Single-writer append handle on the scan log.
pub struct ScanLog {
    writer: BufWriter<File>,
}

impl ScanLog {
    /// Opens `path` for appending, creating it if missing.
    pub fn append_to(path: &Path) -> Result<Self, PersistError> {
        let file = OpenOptions::new().append(true).create(true).open(path)?;
        Ok(ScanLog {
            writer: BufWriter::new(file),
        })
    }

    /// Appends one record and flushes, so a killed scan loses at most the
    /// optimization in flight.
    pub fn append(&mut self, record: &LogRecord) -> Result<(), PersistError> {
        let line = serde_json::to_string(record)?;
        writeln!(self.writer, "{line}")?;
        self.writer.flush()?;
        Ok(())
    }

    /// Reads every record from an existing log. Blank lines are skipped; a
    /// malformed line is an error (the log is append-only and machine
    /// written).
    pub fn replay(path: &Path) -> Result<Vec<LogRecord>, PersistError> {
        let reader = BufReader::new(File::open(path)?);
        let mut records = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(|source| PersistError::Corrupt {
                line: lineno + 1,
                source,
            })?;
            records.push(record);
        }
        Ok(records)
    }
}
