//! Persistence for cookiebridge: credential profiles and the merged process
//! configuration, over SeaORM.

pub mod credential_store;
pub mod entities;
pub mod seaorm;
pub mod storage;

pub use credential_store::{CredentialStore, DEFAULT_EXTRACT_TIMEOUT};
pub use seaorm::SeaOrmStorage;
pub use storage::{
    Profile, ProfileDocument, ProfileSummary, RequiredCredentials, Storage, StorageError,
    StorageResult,
};
