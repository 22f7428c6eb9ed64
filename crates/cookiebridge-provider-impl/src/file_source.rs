use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use cookiebridge_provider_core::{CredentialRecord, CredentialSource, SourceError};

pub const DEFAULT_LABEL: &str = "default";

/// Reads exported cookie jars from `<dir>/<label>.json`.
///
/// A file holds either a bare array of records or a profile document with a
/// `credentials` array.
#[derive(Debug, Clone)]
pub struct FileCredentialSource {
    dir: PathBuf,
    default_label: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CredentialFile {
    Records(Vec<CredentialRecord>),
    Document { credentials: Vec<CredentialRecord> },
}

impl FileCredentialSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            default_label: Some(DEFAULT_LABEL.to_string()),
        }
    }

    pub fn with_default_label(mut self, label: Option<String>) -> Self {
        self.default_label = label;
        self
    }

    fn path_for(&self, label: &str) -> Result<PathBuf, SourceError> {
        let valid = !label.is_empty()
            && label != "."
            && label != ".."
            && !label.contains(['/', '\\']);
        if !valid {
            return Err(SourceError::Invalid(format!("bad source label: {label:?}")));
        }
        Ok(self.dir.join(format!("{label}.json")))
    }
}

#[async_trait]
impl CredentialSource for FileCredentialSource {
    fn default_label(&self) -> Option<&str> {
        self.default_label.as_deref()
    }

    async fn extract(&self, label: &str) -> Result<Vec<CredentialRecord>, SourceError> {
        let path = self.path_for(label)?;
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(SourceError::UnknownSource(label.to_string()));
            }
            Err(err) => {
                return Err(SourceError::Unavailable(format!(
                    "{}: {err}",
                    path.display()
                )));
            }
        };
        let file: CredentialFile = serde_json::from_str(&raw)
            .map_err(|err| SourceError::Invalid(format!("{}: {err}", path.display())))?;
        let records = match file {
            CredentialFile::Records(records) => records,
            CredentialFile::Document { credentials } => credentials,
        };
        debug!(source = %label, credentials = records.len(), "read credential file");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_both_file_shapes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("chrome.json"),
            r#"[{"name":"__Secure-1PSID","value":"a","domain":".google.com"}]"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("default.json"),
            r#"{"name":"x","source":"firefox","credentials":[{"name":"k","value":"v"}]}"#,
        )
        .unwrap();
        let source = FileCredentialSource::new(dir.path());

        let records = source.extract("chrome").await.unwrap();
        assert_eq!(records[0].value, "a");
        assert_eq!(records[0].path, "/");

        let label = source.default_label().unwrap();
        assert_eq!(source.extract(label).await.unwrap()[0].name, "k");
    }

    #[tokio::test]
    async fn browser_exports_with_fractional_expiry_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("edge.json"),
            r#"[{"name":"__Secure-1PSID","value":"a","expires":1767225600.25}]"#,
        )
        .unwrap();
        let source = FileCredentialSource::new(dir.path());

        let records = source.extract("edge").await.unwrap();
        assert_eq!(
            records[0].expires.map(|at| at.unix_timestamp()),
            Some(1_767_225_600)
        );
    }

    #[tokio::test]
    async fn reports_unknown_and_invalid_sources() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), "{").unwrap();
        let source = FileCredentialSource::new(dir.path()).with_default_label(None);

        assert!(source.default_label().is_none());
        assert!(matches!(
            source.extract("nope").await,
            Err(SourceError::UnknownSource(_))
        ));
        assert!(matches!(
            source.extract("broken").await,
            Err(SourceError::Invalid(_))
        ));
        assert!(matches!(
            source.extract("../etc").await,
            Err(SourceError::Invalid(_))
        ));
    }
}
