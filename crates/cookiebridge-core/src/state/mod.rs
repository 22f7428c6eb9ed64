use std::sync::Arc;

use arc_swap::ArcSwap;

use cookiebridge_common::GlobalConfig;
use cookiebridge_storage::{CredentialStore, SeaOrmStorage};

use crate::session::UpstreamSession;

/// Everything a request handler needs. All runtime reads of the config go
/// through `global`, which can be swapped without restarting.
pub struct AppState {
    pub global: ArcSwap<GlobalConfig>,
    pub storage: Arc<SeaOrmStorage>,
    pub session: Arc<UpstreamSession>,
}

impl AppState {
    pub fn new(
        global: GlobalConfig,
        storage: Arc<SeaOrmStorage>,
        session: Arc<UpstreamSession>,
    ) -> Self {
        Self {
            global: ArcSwap::from_pointee(global),
            storage,
            session,
        }
    }

    pub fn config(&self) -> Arc<GlobalConfig> {
        self.global.load_full()
    }

    pub fn store(&self) -> &CredentialStore {
        self.session.store()
    }
}
