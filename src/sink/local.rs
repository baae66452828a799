//! One JSON file per run under the station's log directory.

use std::path::{Path, PathBuf};

use tracing::info;

use super::SinkError;
use crate::model::TestResult;

pub struct LocalStore {
    dir: PathBuf,
}

impl LocalStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `{station}_{serial}_{YYYYmmddTHHMMSS.mmmZ}.json`; names sort by time per DUT.
    pub fn file_name(result: &TestResult) -> String {
        let stamp = result.end_time().unwrap_or_else(|| result.start_time());
        format!(
            "{}_{}_{}.json",
            sanitize(result.station_id()),
            sanitize(result.serial_number()),
            stamp.format("%Y%m%dT%H%M%S%.3fZ")
        )
    }

    /// Write the record and return its path. The file appears complete or
    /// not at all.
    pub async fn save(&self, result: &TestResult) -> Result<PathBuf, SinkError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| SinkError::Io { path, source }
        };

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(io_err(&self.dir))?;

        let json = serde_json::to_vec_pretty(result)?;
        let path = self.dir.join(Self::file_name(result));
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await.map_err(io_err(&tmp))?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err(&path))?;

        info!(path = %path.display(), bytes = json.len(), "result saved");
        Ok(path)
    }
}

/// Keep file names portable whatever the DUT reports as its serial.
fn sanitize(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}
