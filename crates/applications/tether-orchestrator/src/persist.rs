//! Workload record persistence
//!
//! One JSON file per workload under the state directory. Writes go to a
//! temporary file first and are renamed into place, so a crash never leaves
//! a half-written record behind.

use crate::error::Result;
use crate::registry::WorkloadRecord;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tether_core::WorkloadId;
use tracing::{debug, warn};

/// JSON-file store for workload records
#[derive(Debug, Clone)]
pub struct JsonStateStore {
    dir: PathBuf,
}

impl JsonStateStore {
    /// Open (and create if needed) a state directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// State directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, workload_id: &WorkloadId) -> PathBuf {
        self.dir.join(format!("{}.json", workload_id))
    }

    /// Write a workload record
    pub fn save(&self, record: &WorkloadRecord) -> Result<()> {
        let path = self.record_path(&record.workload_id);
        let tmp = path.with_extension("json.tmp");

        let bytes = serde_json::to_vec_pretty(record)?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        debug!(workload_id = %record.workload_id, path = %path.display(), "Workload record saved");
        Ok(())
    }

    /// Load every record in the directory. Unreadable files are skipped with a warning.
    pub fn load_all(&self) -> Result<Vec<WorkloadRecord>> {
        let mut records = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            match fs::read(&path)
                .map_err(crate::error::OrchestratorError::from)
                .and_then(|bytes| Ok(serde_json::from_slice::<WorkloadRecord>(&bytes)?))
            {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable workload record"),
            }
        }

        records.sort_by(|a, b| a.workload_id.cmp(&b.workload_id));
        Ok(records)
    }
}
