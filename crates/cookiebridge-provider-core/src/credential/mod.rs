use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use time::OffsetDateTime;

/// Credential name → value, as handed to a connector.
pub type CredentialMap = BTreeMap<String, String>;

/// A cookie-like credential record.
///
/// `expires == None` never expires. Expired and absent records are equally
/// unusable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(
        default,
        serialize_with = "time::serde::timestamp::option::serialize",
        deserialize_with = "deserialize_expiry"
    )]
    pub expires: Option<OffsetDateTime>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
}

fn default_path() -> String {
    "/".to_string()
}

/// Browser exports carry fractional Unix seconds; whole seconds are
/// accepted too.
fn deserialize_expiry<'de, D>(deserializer: D) -> Result<Option<OffsetDateTime>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum UnixSeconds {
        Whole(i64),
        Fractional(f64),
    }

    let nanos = match Option::<UnixSeconds>::deserialize(deserializer)? {
        None => return Ok(None),
        Some(UnixSeconds::Whole(secs)) => i128::from(secs) * 1_000_000_000,
        Some(UnixSeconds::Fractional(secs)) if secs.is_finite() => {
            (secs * 1_000_000_000.0).round() as i128
        }
        Some(UnixSeconds::Fractional(secs)) => {
            return Err(D::Error::custom(format!("invalid expiry timestamp {secs}")));
        }
    };
    OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .map(Some)
        .map_err(D::Error::custom)
}

impl CredentialRecord {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: String::new(),
            path: default_path(),
            expires: None,
            secure: false,
            http_only: false,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn with_expiry(mut self, expires: OffsetDateTime) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc())
    }
}

/// Names from `required` that are not present in `records`.
pub fn missing_required<'a>(records: &[CredentialRecord], required: &'a [String]) -> Vec<&'a str> {
    required
        .iter()
        .filter(|name| !records.iter().any(|record| &record.name == *name))
        .map(String::as_str)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[test]
    fn expiry_is_optional() {
        let now = OffsetDateTime::now_utc();
        let session = CredentialRecord::new("sid", "v");
        assert!(!session.is_expired_at(now));

        let stale = CredentialRecord::new("sid", "v").with_expiry(now - Duration::seconds(1));
        assert!(stale.is_expired_at(now));
    }

    #[test]
    fn json_uses_unix_timestamps() {
        let json = r#"{"name":"a","value":"b","expires":1700000000,"secure":true}"#;
        let record: CredentialRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.path, "/");
        assert!(record.secure);
        assert_eq!(record.expires.map(|at| at.unix_timestamp()), Some(1_700_000_000));

        let without: CredentialRecord = serde_json::from_str(r#"{"name":"a","value":"b"}"#).unwrap();
        assert_eq!(without.expires, None);
    }

    #[test]
    fn fractional_expiry_is_accepted() {
        let json = r#"{"name":"a","value":"b","expires":1767225600.5,"http_only":true}"#;
        let record: CredentialRecord = serde_json::from_str(json).unwrap();
        let expires = record.expires.unwrap();
        assert_eq!(expires.unix_timestamp(), 1_767_225_600);
        assert_eq!(expires.millisecond(), 500);

        let written = serde_json::to_value(&record).unwrap();
        assert_eq!(written["expires"], 1_767_225_600);

        let null: CredentialRecord =
            serde_json::from_str(r#"{"name":"a","value":"b","expires":null}"#).unwrap();
        assert_eq!(null.expires, None);
    }

    #[test]
    fn missing_required_lists_absent_names() {
        let records = vec![CredentialRecord::new("a", "1")];
        let required = vec!["a".to_string(), "b".to_string()];
        assert_eq!(missing_required(&records, &required), vec!["b"]);
    }
}
