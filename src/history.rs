use crate::error::{FerryError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    List,
    Get,
    Put,
    Ping,
}

impl Operation {
    pub fn name(self) -> &'static str {
        match self {
            Operation::List => "LIST",
            Operation::Get => "GET",
            Operation::Put => "PUT",
            Operation::Ping => "PING",
        }
    }
}

/// One client request, successful or not.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RequestRecord {
    pub timestamp: String,
    pub operation: Operation,
    pub filename: String,
    pub success: bool,
    pub bytes: u64,
    pub duration_ms: f64,
    pub error: Option<String>,
}

impl RequestRecord {
    pub fn new<T>(
        operation: Operation,
        filename: &str,
        elapsed: Duration,
        bytes: u64,
        outcome: &Result<T>,
    ) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            operation,
            filename: filename.to_string(),
            success: outcome.is_ok(),
            bytes,
            duration_ms: elapsed.as_secs_f64() * 1000.0,
            error: outcome.as_ref().err().map(|e| e.to_string()),
        }
    }
}

/// Append-only JSON-lines file of request records.
pub struct HistoryLog {
    log_file_path: PathBuf,
}

impl HistoryLog {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        HistoryLog {
            log_file_path: path.as_ref().to_path_buf(),
        }
    }

    pub fn append(&self, records: &[RequestRecord]) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .map_err(|e| FerryError::fs(&self.log_file_path, e))?;
        let mut writer = BufWriter::new(file);
        for record in records {
            serde_json::to_writer(&mut writer, record)?;
            writer
                .write_all(b"\n")
                .map_err(|e| FerryError::fs(&self.log_file_path, e))?;
        }
        writer
            .flush()
            .map_err(|e| FerryError::fs(&self.log_file_path, e))?;
        Ok(())
    }

    pub fn read_log(&self) -> Result<Vec<RequestRecord>> {
        if !self.log_file_path.exists() {
            return Ok(Vec::new());
        }
        let file =
            File::open(&self.log_file_path).map_err(|e| FerryError::fs(&self.log_file_path, e))?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(|e| FerryError::fs(&self.log_file_path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }
}
