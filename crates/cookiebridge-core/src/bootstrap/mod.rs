use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use cookiebridge_common::{GlobalConfig, GlobalConfigPatch, UpstreamKind};
use cookiebridge_provider_core::CredentialSource;
use cookiebridge_provider_impl::{ConnectorSettings, FileCredentialSource, build_connector};
use cookiebridge_storage::{SeaOrmStorage, Storage};

use crate::session::UpstreamSession;
use crate::state::AppState;

#[derive(Debug, Clone, Default, Parser)]
#[command(
    name = "cookiebridge",
    version,
    about = "OpenAI-compatible gateway for cookie-session chat upstreams"
)]
pub struct CliArgs {
    /// Database DSN (required to bootstrap the rest of config).
    #[arg(long, env = "COOKIEBRIDGE_DSN")]
    pub dsn: Option<String>,

    /// Bind host.
    #[arg(long, env = "COOKIEBRIDGE_HOST")]
    pub host: Option<String>,

    /// Bind port.
    #[arg(long, env = "COOKIEBRIDGE_PORT")]
    pub port: Option<String>,

    /// Optional outbound proxy for upstream requests.
    #[arg(long, env = "COOKIEBRIDGE_PROXY")]
    pub proxy: Option<String>,

    /// Upstream kind: gemini-web or openai-compat.
    #[arg(long, env = "COOKIEBRIDGE_UPSTREAM")]
    pub upstream: Option<String>,

    #[arg(long, env = "COOKIEBRIDGE_UPSTREAM_BASE_URL")]
    pub upstream_base_url: Option<String>,

    /// Bearer key used by openai-compat when no profile is active.
    #[arg(long, env = "COOKIEBRIDGE_UPSTREAM_API_KEY")]
    pub upstream_api_key: Option<String>,

    /// Profile to initialise at startup. Auto-discovery when unset.
    #[arg(long, env = "COOKIEBRIDGE_DEFAULT_PROFILE")]
    pub default_profile: Option<String>,

    #[arg(long, env = "COOKIEBRIDGE_DEFAULT_MODEL")]
    pub default_model: Option<String>,

    #[arg(long, env = "COOKIEBRIDGE_REQUEST_TIMEOUT_SECS")]
    pub request_timeout_secs: Option<String>,

    #[arg(long, env = "COOKIEBRIDGE_EXTRACT_TIMEOUT_SECS")]
    pub extract_timeout_secs: Option<String>,

    /// Directory of exported cookie jars read by the file credential source.
    #[arg(long, env = "COOKIEBRIDGE_CREDENTIAL_DIR")]
    pub credential_dir: Option<String>,
}

pub struct Bootstrap {
    pub storage: Arc<SeaOrmStorage>,
    pub state: Arc<AppState>,
}

pub async fn bootstrap_from_env() -> anyhow::Result<Bootstrap> {
    let args = CliArgs::parse();
    bootstrap(args).await
}

pub async fn bootstrap(args: CliArgs) -> anyhow::Result<Bootstrap> {
    let dsn = sanitize_dsn_value(args.dsn.clone());
    let cli_patch = GlobalConfigPatch {
        host: sanitize_optional_env_value(args.host),
        port: parse_u16_env_value(args.port, "COOKIEBRIDGE_PORT")?,
        dsn: Some(dsn.clone()),
        proxy: sanitize_optional_env_value(args.proxy),
        upstream: parse_upstream_value(args.upstream)?,
        upstream_base_url: sanitize_optional_env_value(args.upstream_base_url),
        upstream_api_key: sanitize_optional_env_value(args.upstream_api_key),
        default_profile: sanitize_optional_env_value(args.default_profile),
        default_model: sanitize_optional_env_value(args.default_model),
        request_timeout_secs: parse_u64_env_value(
            args.request_timeout_secs,
            "COOKIEBRIDGE_REQUEST_TIMEOUT_SECS",
        )?,
        extract_timeout_secs: parse_u64_env_value(
            args.extract_timeout_secs,
            "COOKIEBRIDGE_EXTRACT_TIMEOUT_SECS",
        )?,
        credential_dir: sanitize_optional_env_value(args.credential_dir),
        model_aliases: None,
    };

    ensure_sqlite_parent_dir(&dsn)?;

    // 1) connect DB from CLI/ENV DSN (required).
    let storage = Arc::new(
        SeaOrmStorage::connect(&dsn)
            .await
            .context("connect storage")?,
    );
    storage.sync().await.context("schema sync")?;

    // 2) merge once: CLI > ENV > DB. clap already resolves CLI > ENV per field.
    let mut merged = storage
        .load_global_config()
        .await
        .context("load db global_config")?
        .map(GlobalConfigPatch::from)
        .unwrap_or_default();
    merged.overlay(cli_patch);
    let global: GlobalConfig = merged
        .into_config()
        .context("finalize merged global config")?;

    // 3) persist merged global config back to DB.
    storage
        .upsert_global_config(&global)
        .await
        .context("upsert global_config")?;

    // 4) wire the upstream session.
    let source: Arc<dyn CredentialSource> =
        Arc::new(FileCredentialSource::new(&global.credential_dir));
    let connector = build_connector(
        ConnectorSettings::from_global(&global),
        Some(source.clone()),
    );
    let store = storage
        .credential_store(connector.required_credentials())
        .with_extract_timeout(Duration::from_secs(global.extract_timeout_secs));
    let session = Arc::new(UpstreamSession::new(
        connector,
        store,
        Some(source),
        Duration::from_secs(global.request_timeout_secs),
    ));

    // 5) best-effort initial connection; requests report 503 until one exists.
    let initialised = match global.default_profile.as_deref() {
        Some(profile) => session.init_with_profile(profile).await,
        None => session.ensure_initialized().await,
    };
    match initialised {
        Ok(()) => info!(
            upstream = %global.upstream,
            profile = global.default_profile.as_deref().unwrap_or("<auto>"),
            "upstream session initialised"
        ),
        Err(err) => warn!(
            upstream = %global.upstream,
            error = %err,
            "upstream session not initialised at startup"
        ),
    }

    let state = AppState::new(global, storage.clone(), session);
    Ok(Bootstrap {
        storage,
        state: Arc::new(state),
    })
}

fn sanitize_optional_env_value(value: Option<String>) -> Option<String> {
    let trimmed = value?.trim().to_string();
    if trimmed.is_empty() {
        return None;
    }
    // Unresolved `${VAR}` placeholders injected by some platforms count as unset.
    if trimmed.starts_with("${") && trimmed.ends_with('}') {
        return None;
    }
    Some(trimmed)
}

fn sanitize_dsn_value(value: Option<String>) -> String {
    sanitize_optional_env_value(value).unwrap_or_else(default_dsn)
}

fn default_dsn() -> String {
    data_dir_dsn(std::env::var("COOKIEBRIDGE_DATA_DIR").ok())
}

fn data_dir_dsn(data_dir: Option<String>) -> String {
    if let Some(data_dir) = sanitize_optional_env_value(data_dir) {
        let dir = data_dir.trim_end_matches('/');
        return format!("sqlite://{dir}/cookiebridge.db?mode=rwc");
    }
    "sqlite://cookiebridge.db?mode=rwc".to_string()
}

fn ensure_sqlite_parent_dir(dsn: &str) -> anyhow::Result<()> {
    let Some(db_path) = sqlite_file_path_from_dsn(dsn) else {
        return Ok(());
    };
    let Some(parent) = db_path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    std::fs::create_dir_all(parent)
        .with_context(|| format!("create sqlite parent dir {}", parent.display()))?;
    Ok(())
}

fn sqlite_file_path_from_dsn(dsn: &str) -> Option<PathBuf> {
    let rest = dsn.strip_prefix("sqlite:")?;
    let path_part = rest.split(['?', '#']).next()?.trim();
    let normalized = path_part.strip_prefix("//").unwrap_or(path_part);
    if normalized.is_empty() || normalized.eq_ignore_ascii_case(":memory:") {
        return None;
    }
    Some(PathBuf::from(normalized))
}

fn parse_u16_env_value(value: Option<String>, env_name: &str) -> anyhow::Result<Option<u16>> {
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    let parsed = raw
        .parse::<u16>()
        .with_context(|| format!("invalid {env_name} value: {raw}"))?;
    Ok(Some(parsed))
}

fn parse_u64_env_value(value: Option<String>, env_name: &str) -> anyhow::Result<Option<u64>> {
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    let parsed = raw
        .parse::<u64>()
        .with_context(|| format!("invalid {env_name} value: {raw}"))?;
    Ok(Some(parsed))
}

fn parse_upstream_value(value: Option<String>) -> anyhow::Result<Option<UpstreamKind>> {
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    let kind = raw
        .parse::<UpstreamKind>()
        .context("invalid COOKIEBRIDGE_UPSTREAM value")?;
    Ok(Some(kind))
}
