//! Upstream and credential abstractions for cookiebridge.
//!
//! This crate does **not** depend on axum, a database or any concrete HTTP
//! client. Connectors live in `cookiebridge-provider-impl`; the session state
//! machine that drives them lives in `cookiebridge-core`.

pub mod credential;
pub mod errors;
pub mod provider;
pub mod session;
pub mod source;

pub use cookiebridge_common::UpstreamKind;
pub use credential::{CredentialMap, CredentialRecord, missing_required};
pub use errors::{SourceError, UpstreamError, UpstreamResult, UpstreamTransportErrorKind};
pub use provider::{
    ChatStream, DeltaStream, SessionAuth, UpstreamConnection, UpstreamConnector, drain_into,
};
pub use session::{ChatSession, ChatTurn, TurnRole};
pub use source::CredentialSource;
