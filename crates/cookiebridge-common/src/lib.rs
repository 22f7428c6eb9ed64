use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8787;
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_EXTRACT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_CREDENTIAL_DIR: &str = "./credentials";

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// Which upstream conversational service the gateway talks to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpstreamKind {
    /// Cookie-session emulation of the Gemini web app.
    #[default]
    GeminiWeb,
    /// Any OpenAI-compatible gateway authenticated by a bearer key.
    OpenaiCompat,
}

impl UpstreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GeminiWeb => "gemini-web",
            Self::OpenaiCompat => "openai-compat",
        }
    }
}

impl fmt::Display for UpstreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpstreamKind {
    type Err = GlobalConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gemini-web" | "gemini" => Ok(Self::GeminiWeb),
            "openai-compat" | "openai" | "bifrost" => Ok(Self::OpenaiCompat),
            _ => Err(GlobalConfigError::InvalidValue {
                field: "upstream",
                value: value.to_string(),
            }),
        }
    }
}

pub fn default_model_aliases() -> BTreeMap<String, String> {
    [
        ("gpt-4o-mini", "gemini-2.5-flash"),
        ("gpt-4o", "gemini-2.5-pro"),
        ("gpt-4.1-mini", "gemini-3.0-pro"),
        ("gemini-flash", "gemini-2.5-flash"),
        ("gemini-pro", "gemini-2.5-pro"),
        ("gemini-3-pro", "gemini-3.0-pro"),
        ("claude-3-5-sonnet", "claude-3-5-sonnet-20241022"),
    ]
    .into_iter()
    .map(|(alias, model)| (alias.to_string(), model.to_string()))
    .collect()
}

/// Final, merged global configuration used by the running process.
///
/// Merge order (after DB connection): CLI > ENV > DB, then persist back to DB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Database DSN used for this process.
    pub dsn: String,
    /// Optional outbound proxy (for upstream egress).
    pub proxy: Option<String>,
    pub upstream: UpstreamKind,
    pub upstream_base_url: Option<String>,
    pub upstream_api_key: Option<String>,
    /// Profile to initialise at startup; auto-discovery when unset.
    pub default_profile: Option<String>,
    pub default_model: String,
    pub request_timeout_secs: u64,
    pub extract_timeout_secs: u64,
    /// Directory read by the file credential source.
    pub credential_dir: String,
    pub model_aliases: BTreeMap<String, String>,
}

impl GlobalConfig {
    /// Maps an OpenAI-style model name to an upstream model. Unknown names
    /// pass through; an absent or empty name yields the default model.
    pub fn resolve_model(&self, requested: Option<&str>) -> String {
        match requested.map(str::trim).filter(|name| !name.is_empty()) {
            None => self.default_model.clone(),
            Some(name) => self
                .model_aliases
                .get(name)
                .cloned()
                .unwrap_or_else(|| name.to_string()),
        }
    }

    /// Distinct upstream model names advertised by `/v1/models`.
    pub fn advertised_models(&self) -> Vec<String> {
        let targets: BTreeSet<&String> = self
            .model_aliases
            .values()
            .filter(|model| model.starts_with("gemini") && **model != self.default_model)
            .collect();
        std::iter::once(self.default_model.clone())
            .chain(targets.into_iter().cloned())
            .collect()
    }
}

/// Optional layer used for merging global config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dsn: Option<String>,
    pub proxy: Option<String>,
    pub upstream: Option<UpstreamKind>,
    pub upstream_base_url: Option<String>,
    pub upstream_api_key: Option<String>,
    pub default_profile: Option<String>,
    pub default_model: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub extract_timeout_secs: Option<u64>,
    pub credential_dir: Option<String>,
    pub model_aliases: Option<BTreeMap<String, String>>,
}

macro_rules! overlay_fields {
    ($target:ident, $other:ident, $($field:ident),+ $(,)?) => {
        $(
            if $other.$field.is_some() {
                $target.$field = $other.$field;
            }
        )+
    };
}

impl GlobalConfigPatch {
    /// Fields set in `other` win.
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        overlay_fields!(
            self,
            other,
            host,
            port,
            dsn,
            proxy,
            upstream,
            upstream_base_url,
            upstream_api_key,
            default_profile,
            default_model,
            request_timeout_secs,
            extract_timeout_secs,
            credential_dir,
            model_aliases,
        );
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        let request_timeout_secs = self
            .request_timeout_secs
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);
        if request_timeout_secs == 0 {
            return Err(GlobalConfigError::InvalidValue {
                field: "request_timeout_secs",
                value: "0".to_string(),
            });
        }
        let extract_timeout_secs = self
            .extract_timeout_secs
            .unwrap_or(DEFAULT_EXTRACT_TIMEOUT_SECS);
        if extract_timeout_secs == 0 {
            return Err(GlobalConfigError::InvalidValue {
                field: "extract_timeout_secs",
                value: "0".to_string(),
            });
        }
        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: self.port.unwrap_or(DEFAULT_PORT),
            dsn: self.dsn.ok_or(GlobalConfigError::MissingField("dsn"))?,
            proxy: self.proxy,
            upstream: self.upstream.unwrap_or_default(),
            upstream_base_url: self.upstream_base_url,
            upstream_api_key: self.upstream_api_key,
            default_profile: self.default_profile,
            default_model: self
                .default_model
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            request_timeout_secs,
            extract_timeout_secs,
            credential_dir: self
                .credential_dir
                .unwrap_or_else(|| DEFAULT_CREDENTIAL_DIR.to_string()),
            model_aliases: self.model_aliases.unwrap_or_else(default_model_aliases),
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            dsn: Some(value.dsn),
            proxy: value.proxy,
            upstream: Some(value.upstream),
            upstream_base_url: value.upstream_base_url,
            upstream_api_key: value.upstream_api_key,
            default_profile: value.default_profile,
            default_model: Some(value.default_model),
            request_timeout_secs: Some(value.request_timeout_secs),
            extract_timeout_secs: Some(value.extract_timeout_secs),
            credential_dir: Some(value.credential_dir),
            model_aliases: Some(value.model_aliases),
        }
    }
}
