use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::data::types::Snapshot;

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("read timed out after {0:?}")]
    Timeout(Duration),

    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("failed to read source: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse source: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Live provider of current values for every tracked instrument.
///
/// Reads are serialized by the scheduler; implementations never see two
/// concurrent calls. The scheduler enforces the timeout.
#[async_trait]
pub trait SnapshotSource: Send {
    async fn read(&mut self) -> Result<Snapshot, ReadError>;
}

/// Reads a JSON object of `instrument -> number` exported from the live sheet.
///
/// Non-numeric cells (`null`, `"#N/A"`, ...) become missing readings so the
/// tracker can reject them per instrument instead of failing the whole read.
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn parse(contents: &str) -> Result<Snapshot, ReadError> {
        let raw: BTreeMap<String, Value> = serde_json::from_str(contents)?;
        Ok(raw.into_iter().map(|(k, v)| (k, v.as_f64())).collect())
    }
}

#[async_trait]
impl SnapshotSource for JsonFileSource {
    async fn read(&mut self) -> Result<Snapshot, ReadError> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        if contents.trim().is_empty() {
            // Sheet mid-save
            return Err(ReadError::Unavailable(format!(
                "{} is empty",
                self.path.display()
            )));
        }
        Self::parse(&contents)
    }
}
