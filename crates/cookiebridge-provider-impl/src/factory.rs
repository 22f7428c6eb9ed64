use std::sync::Arc;
use std::time::Duration;

use cookiebridge_common::{GlobalConfig, UpstreamKind};
use cookiebridge_provider_core::{CredentialSource, UpstreamConnector};

use crate::client::HttpClientConfig;
use crate::gemini_web::GeminiWebConnector;
use crate::openai_compat::OpenAiCompatConnector;

/// Everything needed to build the configured connector.
#[derive(Debug, Clone)]
pub struct ConnectorSettings {
    pub kind: UpstreamKind,
    pub http: HttpClientConfig,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub default_model: String,
}

impl ConnectorSettings {
    pub fn from_global(config: &GlobalConfig) -> Self {
        Self {
            kind: config.upstream,
            http: HttpClientConfig {
                proxy: config.proxy.clone(),
                stream_idle_timeout: Duration::from_secs(config.request_timeout_secs),
                ..HttpClientConfig::default()
            },
            base_url: config.upstream_base_url.clone(),
            api_key: config.upstream_api_key.clone(),
            default_model: config.default_model.clone(),
        }
    }
}

pub fn build_connector(
    settings: ConnectorSettings,
    source: Option<Arc<dyn CredentialSource>>,
) -> Arc<dyn UpstreamConnector> {
    match settings.kind {
        UpstreamKind::GeminiWeb => Arc::new(GeminiWebConnector::new(
            settings.http,
            settings.base_url,
            source,
        )),
        UpstreamKind::OpenaiCompat => Arc::new(OpenAiCompatConnector::new(
            settings.http,
            settings.base_url,
            settings.api_key,
            settings.default_model,
        )),
    }
}
