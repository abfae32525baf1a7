//! Execution log
//!
//! Append-only, line-delimited JSON persistence of `PartialExecution`
//! records. The driver holds the only append handle per job and flushes on
//! clean completion; the profiler opens the log read-only.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rheem_common::{Configuration, Result};

use crate::platform::state::PartialExecution;

pub struct ExecutionLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl ExecutionLog {
    /// Open the log configured under `rheem.core.log.executions` with an
    /// exclusive append handle.
    pub fn open(configuration: &Configuration) -> Result<Self> {
        let path = configuration.get_string("rheem.core.log.executions", "rheem-executions.json");
        Self::open_at(path)
    }

    pub fn open_at(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Buffer one record; not durable until `flush`.
    pub fn append(&self, partial_execution: &PartialExecution) -> Result<()> {
        let line = serde_json::to_string(partial_execution)?;
        let mut writer = self.writer.lock();
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.writer.lock().flush()?;
        Ok(())
    }

    /// Read a complete log; each line is one self-contained record.
    pub fn read(path: impl AsRef<Path>) -> Result<Vec<PartialExecution>> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }
}

impl Drop for ExecutionLog {
    fn drop(&mut self) {
        let _ = self.writer.lock().flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::state::OperatorExecution;
    use rheem_common::CardinalityEstimate;

    fn record(millis: u64) -> PartialExecution {
        PartialExecution {
            measured_execution_millis: millis,
            operator_executions: vec![OperatorExecution {
                operator_name: "BasicFilterOperator".to_string(),
                configuration_key: Some("rheem.basic.filter.load".to_string()),
                input_cardinalities: vec![Some(CardinalityEstimate::exact(100))],
                output_cardinalities: vec![Some(CardinalityEstimate::new(5, 15, 0.9))],
                num_executions: 1,
            }],
            initialized_platforms: vec!["basic".to_string()],
        }
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("executions.json");

        let log = ExecutionLog::open_at(&path).unwrap();
        log.append(&record(100)).unwrap();
        log.append(&record(250)).unwrap();
        log.flush().unwrap();
        drop(log);

        let records = ExecutionLog::read(&path).unwrap();
        assert_eq!(records, vec![record(100), record(250)]);
    }

    #[test]
    fn test_append_is_cumulative() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("executions.json");

        {
            let log = ExecutionLog::open_at(&path).unwrap();
            log.append(&record(1)).unwrap();
        }
        {
            let log = ExecutionLog::open_at(&path).unwrap();
            log.append(&record(2)).unwrap();
        }
        let records = ExecutionLog::read(&path).unwrap();
        assert_eq!(records.len(), 2);
    }
}
