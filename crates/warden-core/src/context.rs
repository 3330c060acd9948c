//! Shared session storage and the contexts attached to it
//!
//! One `Warden` per profile. Every `SessionContext` it opens has its own
//! session store, refresh coordinator and request client, and follows the
//! changes the other contexts make to the shared storage.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use warden_auth::{AuthBackend, AuthClient, HttpAuthBackend};
use warden_session::{CrossContextSync, PersistenceAdapter, SessionStore, SyncHandle};
use warden_storage::{ContextId, Database, KeyValueStore, MemoryStore};

use crate::config::Config;
use crate::error::CoreError;
use crate::Result;

pub struct Warden {
    config: Config,
    storage: Arc<dyn KeyValueStore>,
    /// False when the database could not be opened and sessions live in memory only
    durable: bool,
    http: reqwest::Client,
    backend: Arc<dyn AuthBackend>,
}

impl Warden {
    /// Open the configured storage and talk to the configured admin API.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let http = http_client(&config)?;
        let backend: Arc<dyn AuthBackend> = Arc::new(HttpAuthBackend::new(http.clone(), &config.api_base_url)?);

        Ok(Self::assemble(config, http, backend))
    }

    /// Like [`Warden::new`], with a custom credential backend.
    pub fn with_backend(config: Config, backend: Arc<dyn AuthBackend>) -> Result<Self> {
        let http = http_client(&config)?;
        Ok(Self::assemble(config, http, backend))
    }

    fn assemble(config: Config, http: reqwest::Client, backend: Arc<dyn AuthBackend>) -> Self {
        let (storage, durable) = open_storage(&config.database_path);

        tracing::info!(
            database = %config.database_path.display(),
            durable,
            api_base_url = %config.api_base_url,
            "Warden initialized"
        );

        Self {
            config,
            storage,
            durable,
            http,
            backend,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn KeyValueStore> {
        &self.storage
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Attach a new context to the shared storage and hydrate its session.
    ///
    /// Must be called from within a tokio runtime; the context follows storage
    /// changes on a spawned task.
    pub fn open_context(&self) -> Result<SessionContext> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(CoreError::NoRuntime);
        }

        let context_id = ContextId::new();
        let persistence =
            PersistenceAdapter::with_key(Arc::clone(&self.storage), context_id, self.config.storage_key.clone());
        let store = SessionStore::new(persistence);

        // Follow storage first so nothing written while hydrating is missed.
        let sync = CrossContextSync::new(store.clone()).map(CrossContextSync::spawn);
        let session = store.initialize();

        let client = AuthClient::new(self.http.clone(), store.clone(), Arc::clone(&self.backend));

        tracing::info!(
            context_id = %context_id,
            state = %session.state(),
            "Opened session context"
        );

        Ok(SessionContext {
            context_id,
            store,
            client,
            sync,
        })
    }
}

fn http_client(config: &Config) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .build()?)
}

fn open_storage(path: &Path) -> (Arc<dyn KeyValueStore>, bool) {
    let opened = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map_or(Ok(()), std::fs::create_dir_all)
        .map_err(CoreError::from)
        .and_then(|_| Database::open(path).map_err(CoreError::from));

    match opened {
        Ok(db) => (Arc::new(db), true),
        Err(e) => {
            tracing::warn!(
                database = %path.display(),
                error = %e,
                "Session storage unavailable, keeping sessions in memory"
            );
            (Arc::new(MemoryStore::new()), false)
        }
    }
}

/// One open window or view of the application.
pub struct SessionContext {
    context_id: ContextId,
    store: SessionStore,
    client: AuthClient,
    sync: Option<SyncHandle>,
}

impl SessionContext {
    pub fn id(&self) -> ContextId {
        self.context_id
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn client(&self) -> &AuthClient {
        &self.client
    }

    pub fn is_syncing(&self) -> bool {
        self.sync.as_ref().is_some_and(SyncHandle::is_running)
    }

    /// Detach from storage and drop every subscriber. The persisted session is kept.
    pub fn dispose(&self) {
        if let Some(sync) = &self.sync {
            sync.stop();
        }
        self.client.dispose();
        self.store.dispose();
        tracing::debug!(context_id = %self.context_id, "Disposed session context");
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        if let Some(sync) = self.sync.take() {
            sync.stop();
        }
    }
}
