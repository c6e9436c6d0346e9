//! Resource-type catalogue: read-mostly, refreshed lazily, refreshes
//! serialized behind a single lock.

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use tokio::sync::Mutex;
use tracing::info;

use crate::{ClientResult, ResourceClient, ResourceType};

#[derive(Default)]
pub struct Catalogue {
    types: ArcSwap<Vec<ResourceType>>,
    refresh_lock: Mutex<()>,
}

impl Catalogue {
    pub fn new() -> Self { Self::default() }

    pub fn from_types(types: Vec<ResourceType>) -> Self {
        Self { types: ArcSwap::from_pointee(types), refresh_lock: Mutex::new(()) }
    }

    pub fn snapshot(&self) -> Arc<Vec<ResourceType>> { self.types.load_full() }
    pub fn is_empty(&self) -> bool { self.types.load().is_empty() }

    pub async fn refresh(&self, client: &dyn ResourceClient) -> ClientResult<()> {
        let _guard = self.refresh_lock.lock().await;
        let t0 = Instant::now();
        let mut types = client.resource_types().await?;
        types.sort_by(|a, b| a.group.cmp(&b.group).then(a.kind.cmp(&b.kind)).then(a.version.cmp(&b.version)));
        let count = types.len();
        self.types.store(Arc::new(types));
        info!(count, took_ms = %t0.elapsed().as_millis(), "catalogue: refreshed");
        Ok(())
    }

    /// Refresh only when nothing has been loaded yet.
    pub async fn ensure(&self, client: &dyn ResourceClient) -> ClientResult<()> {
        if self.is_empty() {
            self.refresh(client).await?;
        }
        Ok(())
    }

    pub fn lookup(&self, group: &str, kind: &str) -> Option<ResourceType> {
        self.types.load().iter().find(|t| t.group == group && t.kind == kind).cloned()
    }

    /// `Some(true)` for namespaced kinds, `None` when the kind is unknown.
    pub fn is_namespaced(&self, group: &str, kind: &str) -> Option<bool> { self.lookup(group, kind).map(|t| t.namespaced) }
}
