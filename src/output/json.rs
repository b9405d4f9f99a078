//! JSON report of a finished job

use super::{OutputError, OutputResult};
use crate::jobs::{JobId, JobState};
use crate::validator::RejectionSummary;
use crate::ScrapedRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

/// Records of one job together with its rejection report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonReport {
    /// Job the records belong to
    pub job_id: JobId,
    /// Search keyword
    pub keyword: String,
    /// State the job ended in
    pub state: JobState,
    /// When the report was written
    pub generated_at: DateTime<Utc>,
    /// Number of records
    pub record_count: usize,
    /// Validator tally, when validation ran
    pub rejection_summary: Option<RejectionSummary>,
    /// Records in page order
    pub records: Vec<ScrapedRecord>,
}

impl JsonReport {
    /// Report stamped with the current time.
    pub fn new(
        job_id: JobId,
        keyword: impl Into<String>,
        state: JobState,
        records: Vec<ScrapedRecord>,
        rejection_summary: Option<RejectionSummary>,
    ) -> Self {
        Self {
            job_id,
            keyword: keyword.into(),
            state,
            generated_at: Utc::now(),
            record_count: records.len(),
            rejection_summary,
            records,
        }
    }
}

/// Write `report` as pretty JSON, creating parent directories.
pub fn write_json_report<P: AsRef<Path>>(path: P, report: &JsonReport) -> OutputResult<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| OutputError::IoError(format!("Failed to create directory: {}", e)))?;
    }

    let file = File::create(path)
        .map_err(|e| OutputError::IoError(format!("Failed to create file: {}", e)))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, report)
        .map_err(|e| OutputError::SerializationError(e.to_string()))?;
    writer
        .flush()
        .map_err(|e| OutputError::FlushError(format!("Failed to flush: {}", e)))?;

    info!(
        path = %path.display(),
        records = report.record_count,
        "JSON report written"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_json_report() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lamp_PRODUCTS.json");
        let summary = RejectionSummary {
            total_input: 3,
            accepted: 0,
            missing_field: 2,
            duplicate: 1,
            ..RejectionSummary::default()
        };
        let report = JsonReport::new(
            JobId::new(),
            "lamp",
            JobState::Completed,
            Vec::new(),
            Some(summary),
        );

        write_json_report(&path, &report).unwrap();

        let loaded: JsonReport =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.record_count, 0);
        assert_eq!(loaded.state, JobState::Completed);
        assert_eq!(loaded.rejection_summary.unwrap().missing_field, 2);
    }
}
