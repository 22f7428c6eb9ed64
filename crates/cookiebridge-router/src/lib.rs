//! HTTP surface of cookiebridge: the OpenAI-compatible `/v1` routes and the
//! profile administration routes, both over one shared [`AppState`].

use std::sync::Arc;

use axum::Router;

use cookiebridge_core::AppState;

pub mod admin;
pub mod error;
pub mod proxy;

pub use admin::admin_router;
pub use error::ApiError;
pub use proxy::proxy_router;

pub fn app_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(proxy_router(state.clone()))
        .merge(admin_router(state))
}
