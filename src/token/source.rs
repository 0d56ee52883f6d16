// Authoritative credential source

use async_trait::async_trait;
use std::path::PathBuf;

use super::types::non_empty;
use crate::error::RelayError;

/// Returns the current value of the watched credential on demand
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Fails with `RelayError::Acquisition` when the value is absent or
    /// the source cannot be reached
    async fn current(&self) -> Result<String, RelayError>;
}

/// Reads the credential from a file kept up to date by the host
///
/// The file holds the raw value; surrounding whitespace is ignored.
#[derive(Debug, Clone)]
pub struct FileCredentialSource {
    path: PathBuf,
}

impl FileCredentialSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl CredentialSource for FileCredentialSource {
    async fn current(&self) -> Result<String, RelayError> {
        let contents = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            RelayError::Acquisition(format!("failed to read {}: {}", self.path.display(), e))
        })?;

        non_empty(Some(contents)).ok_or_else(|| {
            RelayError::Acquisition(format!("{} is empty", self.path.display()))
        })
    }
}
