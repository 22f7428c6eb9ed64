use async_trait::async_trait;

use crate::credential::CredentialRecord;
use crate::errors::SourceError;

/// External capability that produces credential records for a source label
/// (a browser name, a file, a secret store).
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Label used when a connector auto-discovers credentials.
    fn default_label(&self) -> Option<&str> {
        None
    }

    /// Extracts the current records for `label`. An empty list means the
    /// source had nothing for that label.
    async fn extract(&self, label: &str) -> Result<Vec<CredentialRecord>, SourceError>;
}
