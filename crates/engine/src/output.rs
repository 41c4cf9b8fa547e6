//! Access to the stdout/stderr logs leaf processors write per job.

use std::path::{Path, PathBuf};

use pipewright_core::types::ServiceId;
use pipewright_db::store::ServiceStore;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn file_name(self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout.log",
            OutputStream::Stderr => "stderr.log",
        }
    }
}

/// `<root>/<service id>/`, the directory a job's logs are written to.
pub fn output_dir(root: &Path, id: ServiceId) -> PathBuf {
    root.join(id.to_string())
}

/// Open the recorded output file of `id` for reading.
///
/// Fails with `NotFound` when the service does not exist and with a
/// validation error when it never produced that stream.
pub async fn open_output(
    store: &dyn ServiceStore,
    id: ServiceId,
    stream: OutputStream,
) -> EngineResult<tokio::fs::File> {
    let record = store
        .find_by_id(id)
        .await?
        .ok_or_else(|| EngineError::not_found("Service", id))?;
    let path = match stream {
        OutputStream::Stdout => record.output_path,
        OutputStream::Stderr => record.error_path,
    };
    let path = path.ok_or_else(|| {
        EngineError::validation(format!("Service {id} has no {} output", stream.file_name()))
    })?;
    Ok(tokio::fs::File::open(path).await?)
}
