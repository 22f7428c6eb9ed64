//! Concrete upstream connectors and credential sources.
//!
//! Each connector owns its wreq client; nothing here touches storage or the
//! HTTP surface of the gateway.

mod client;
mod factory;
mod file_source;
pub mod gemini_web;
pub mod openai_compat;

pub use client::HttpClientConfig;
pub use factory::{ConnectorSettings, build_connector};
pub use file_source::FileCredentialSource;
pub use gemini_web::GeminiWebConnector;
pub use openai_compat::OpenAiCompatConnector;
