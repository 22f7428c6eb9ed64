use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use cookiebridge_core::AppState;
use cookiebridge_provider_core::CredentialSource;
use cookiebridge_storage::ProfileDocument;

use crate::error::ApiError;

type AdminState = Arc<AppState>;

pub fn admin_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/profiles", get(list_profiles).post(create_profile))
        .route("/profiles/switch", post(switch_profile))
        .route("/profiles/{name}", axum::routing::delete(delete_profile))
        .route("/profiles/{name}/refresh", post(refresh_profile))
        .route("/profiles/{name}/export", get(export_profile))
        .route("/profiles/{name}/import", post(import_profile))
        .with_state(state)
}

async fn health(State(state): State<AdminState>) -> impl IntoResponse {
    let storage_ok = state.storage.health().await.is_ok();
    let config = state.config();
    let (status, storage) = if storage_ok {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
    };
    let phase = state.session.phase().await;
    let current_profile = state.session.current_profile().await;
    (
        status,
        Json(json!({
            "ok": storage_ok,
            "storage": storage,
            "phase": phase,
            "current_profile": current_profile,
            "upstream": config.upstream.as_str(),
        })),
    )
}

async fn list_profiles(State(state): State<AdminState>) -> Result<Response, ApiError> {
    let profiles = state.store().list_profiles().await?;
    let current_profile = state.session.current_profile().await;
    Ok(Json(json!({
        "count": profiles.len(),
        "profiles": profiles,
        "current_profile": current_profile,
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
struct CreateProfileRequest {
    name: String,
    #[serde(default)]
    source: Option<String>,
}

async fn create_profile(
    State(state): State<AdminState>,
    Json(req): Json<CreateProfileRequest>,
) -> Result<Response, ApiError> {
    let name = required_name(&req.name)?;
    let source = credential_source(&state)?;
    let label = req
        .source
        .as_deref()
        .map(str::trim)
        .filter(|label| !label.is_empty())
        .or(source.default_label())
        .ok_or_else(|| ApiError::bad_request("source must not be empty"))?
        .to_string();

    let count = state
        .store()
        .create_profile_from_source(name, &label, source.as_ref())
        .await?;
    info!(profile = %name, source = %label, credentials = count, "profile created");
    Ok((
        StatusCode::OK,
        Json(json!({
            "status": "success",
            "message": format!("Profile '{name}' created from {label}"),
            "credentials": count,
        })),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct SwitchProfileRequest {
    name: String,
}

async fn switch_profile(
    State(state): State<AdminState>,
    Json(req): Json<SwitchProfileRequest>,
) -> Result<Response, ApiError> {
    let name = required_name(&req.name)?;
    state.session.switch_profile(name).await?;
    Ok(success(format!("Switched to profile '{name}'")))
}

async fn refresh_profile(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let source = credential_source(&state)?;
    if !state.store().refresh_profile(&name, source.as_ref()).await? {
        return Err(ApiError::bad_request(format!(
            "Failed to refresh profile '{name}'"
        )));
    }
    Ok(success(format!("Profile '{name}' refreshed")))
}

async fn export_profile(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    match state.store().export_profile(&name).await? {
        Some(document) => Ok(Json(document).into_response()),
        None => Err(ApiError::not_found(format!("Profile '{name}' not found"))),
    }
}

async fn import_profile(
    State(state): State<AdminState>,
    Path(name): Path<String>,
    Json(document): Json<ProfileDocument>,
) -> Result<Response, ApiError> {
    let count = document.credentials.len();
    state.store().import_profile(&name, document).await?;
    info!(profile = %name, credentials = count, "profile imported");
    Ok(success(format!("Profile '{name}' imported")))
}

async fn delete_profile(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    if !state.store().delete_profile(&name).await? {
        return Err(ApiError::not_found(format!("Profile '{name}' not found")));
    }
    Ok(success(format!("Profile '{name}' deleted")))
}

fn success(message: String) -> Response {
    (
        StatusCode::OK,
        Json(json!({ "status": "success", "message": message })),
    )
        .into_response()
}

fn required_name(name: &str) -> Result<&str, ApiError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ApiError::bad_request("name must not be empty"));
    }
    Ok(name)
}

fn credential_source(state: &AppState) -> Result<Arc<dyn CredentialSource>, ApiError> {
    state.session.source().cloned().ok_or_else(|| {
        ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "source_unavailable",
            "no credential source is configured",
        )
    })
}
