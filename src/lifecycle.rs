//! Client lifecycle.
//!
//! [`ClientLifecycle`] decides per execution context whether a caller gets a
//! fresh [`GraphqlClient`] or the shared one:
//!
//! - **rendering**: a new client on every call, never shared, discarded by the
//!   caller after the pass;
//! - **interactive**: the first resolved client becomes the singleton and every
//!   later call reuses it.
//!
//! A supplied [`CacheSnapshot`] is merged into the base client's cache (see
//! [`hydration`](crate::hydration)) before it is handed out. Applications keep
//! one `ClientLifecycle` for the life of the process.

use crate::cache::CacheSnapshot;
use crate::client::GraphqlClient;
use crate::config::ClientConfig;
use crate::types::ExecutionContext;
use crate::{Error, ErrorContext, Result};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

type ClientFactory = Box<dyn Fn(ExecutionContext) -> Result<GraphqlClient> + Send + Sync>;

pub struct ClientLifecycle {
    factory: ClientFactory,
    singleton: Mutex<Option<Arc<GraphqlClient>>>,
}

impl ClientLifecycle {
    /// Clients are built from `config` with default collaborators.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_factory(move |context| GraphqlClient::builder(config.clone(), context).build())
    }

    /// Clients are built by `factory`.
    pub fn with_factory<F>(factory: F) -> Self
    where
        F: Fn(ExecutionContext) -> Result<GraphqlClient> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            singleton: Mutex::new(None),
        }
    }

    /// The interactive singleton, if one has been resolved.
    pub fn singleton(&self) -> Option<Arc<GraphqlClient>> {
        self.singleton.lock().ok().and_then(|slot| slot.clone())
    }

    /// Client for `context`, hydrated with `snapshot` when one is given.
    pub fn resolve_client(
        &self,
        context: ExecutionContext,
        snapshot: Option<&CacheSnapshot>,
    ) -> Result<Arc<GraphqlClient>> {
        match context {
            ExecutionContext::Rendering => {
                let client = Arc::new((self.factory)(context)?);
                if let Some(snapshot) = snapshot {
                    hydrate(&client, snapshot)?;
                }
                debug!(client_id = client.id(), "rendering client created");
                Ok(client)
            }
            ExecutionContext::Interactive => {
                let mut slot = self.singleton.lock().map_err(|_| {
                    Error::runtime_with_context(
                        "client singleton lock poisoned",
                        ErrorContext::new().with_source("client_lifecycle"),
                    )
                })?;
                let client = match slot.as_ref() {
                    Some(existing) => Arc::clone(existing),
                    None => Arc::new((self.factory)(context)?),
                };
                if let Some(snapshot) = snapshot {
                    hydrate(&client, snapshot)?;
                }
                if slot.is_none() {
                    info!(client_id = client.id(), "interactive client promoted to singleton");
                    *slot = Some(Arc::clone(&client));
                }
                Ok(client)
            }
        }
    }
}

fn hydrate(client: &GraphqlClient, server: &CacheSnapshot) -> Result<()> {
    let entries = client.hydrate(server)?;
    debug!(
        client_id = client.id(),
        server_entries = server.len(),
        entries,
        "cache hydrated"
    );
    Ok(())
}
