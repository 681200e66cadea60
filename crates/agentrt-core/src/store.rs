//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Asset store seam, in-memory store, gateway filter and driver asset service."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use agentrt_model::{Asset, AssetQuery, Attribute, AttributeEvent, AttributeRef};
use agentrt_protocol::{ProtocolAssetService, ProtocolError};

use crate::persistence::PersistenceEvent;
use crate::processor::{AttributeProcessor, ProcessOutcome};
use crate::{Result, RuntimeError};

/// Platform asset storage as seen by the runtime.
pub trait AssetStore: Send + Sync + std::fmt::Debug {
    fn find(&self, asset_id: &str) -> Option<Asset>;

    fn find_all(&self, query: &AssetQuery) -> Vec<Asset>;

    /// Insert or replace `asset`; returns the stored version.
    fn merge(&self, asset: Asset) -> Result<Asset>;

    /// Delete the listed assets; returns how many existed.
    fn delete(&self, asset_ids: &[String]) -> Result<usize>;

    /// Write an attribute value; `false` when the asset or attribute is unknown.
    fn apply_attribute_event(&self, event: &AttributeEvent) -> Result<bool>;
}

type Listener = Arc<dyn Fn(PersistenceEvent) + Send + Sync>;

/// Map-backed store that reports merges and deletions as persistence events.
///
/// Attribute value writes are recorded but raise no persistence event.
#[derive(Default)]
pub struct InMemoryAssetStore {
    assets: Mutex<IndexMap<String, Asset>>,
    listener: Mutex<Option<Listener>>,
    writes: Mutex<Vec<AttributeEvent>>,
}

impl InMemoryAssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route persistence events to `listener`, replacing any previous one.
    pub fn set_listener<F>(&self, listener: F)
    where
        F: Fn(PersistenceEvent) + Send + Sync + 'static,
    {
        *self.listener.lock() = Some(Arc::new(listener));
    }

    /// Attribute events applied so far, oldest first.
    pub fn attribute_writes(&self) -> Vec<AttributeEvent> {
        self.writes.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.assets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.lock().is_empty()
    }

    fn emit(&self, event: PersistenceEvent) {
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            listener(event);
        }
    }

    fn resolve_path(&self, asset: &mut Asset) {
        let parent_path = asset
            .parent_id
            .as_ref()
            .and_then(|parent| self.assets.lock().get(parent).map(|p| p.path.clone()));
        match parent_path {
            Some(path) => {
                asset.path = std::iter::once(asset.id.clone()).chain(path).collect();
            }
            None if asset.path.first() != Some(&asset.id) => {
                asset.path.insert(0, asset.id.clone());
            }
            None => {}
        }
    }
}

impl AssetStore for InMemoryAssetStore {
    fn find(&self, asset_id: &str) -> Option<Asset> {
        self.assets.lock().get(asset_id).cloned()
    }

    fn find_all(&self, query: &AssetQuery) -> Vec<Asset> {
        self.assets
            .lock()
            .values()
            .filter(|asset| query.matches(asset))
            .cloned()
            .collect()
    }

    fn merge(&self, mut asset: Asset) -> Result<Asset> {
        if asset.id.is_empty() {
            return Err(RuntimeError::Store("asset id must not be empty".into()));
        }
        self.resolve_path(&mut asset);
        let previous = self.assets.lock().insert(asset.id.clone(), asset.clone());
        let event = match previous {
            None => Some(PersistenceEvent::create(asset.clone())),
            Some(previous) if previous != asset => Some(PersistenceEvent::update(previous, asset.clone())),
            Some(_) => None,
        };
        match event {
            Some(event) => {
                debug!(asset = %asset.id, cause = %event.cause, "asset merged");
                self.emit(event);
            }
            None => trace!(asset = %asset.id, "asset merge without changes"),
        }
        Ok(asset)
    }

    fn delete(&self, asset_ids: &[String]) -> Result<usize> {
        let mut deleted = 0;
        for asset_id in asset_ids {
            let removed = self.assets.lock().shift_remove(asset_id);
            if let Some(asset) = removed {
                deleted += 1;
                debug!(asset = %asset_id, "asset deleted");
                self.emit(PersistenceEvent::delete(asset));
            }
        }
        Ok(deleted)
    }

    fn apply_attribute_event(&self, event: &AttributeEvent) -> Result<bool> {
        let mut assets = self.assets.lock();
        let Some(attribute) = assets
            .get_mut(&event.attribute_ref.asset_id)
            .and_then(|asset| asset.attribute_mut(&event.attribute_ref.attribute_name))
        else {
            warn!(attribute = %event.attribute_ref, "attribute event for unknown attribute");
            return Ok(false);
        };
        attribute.value = event.value.clone();
        attribute.value_timestamp = Some(event.timestamp);
        drop(assets);
        self.writes.lock().push(event.clone());
        Ok(true)
    }
}

impl std::fmt::Debug for InMemoryAssetStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryAssetStore")
            .field("assets", &self.len())
            .field("writes", &self.writes.lock().len())
            .finish()
    }
}

/// Decides which assets are owned by a remote gateway.
pub trait GatewayResolver: Send + Sync + std::fmt::Debug {
    fn is_gateway_asset(&self, asset: &Asset) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoGateways;

impl GatewayResolver for NoGateways {
    fn is_gateway_asset(&self, _asset: &Asset) -> bool {
        false
    }
}

/// Gateways known by id; the gateways themselves and all their descendants are excluded.
#[derive(Debug, Default, Clone)]
pub struct GatewaySet {
    ids: HashSet<String>,
}

impl GatewaySet {
    pub fn new(ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
        }
    }
}

impl GatewayResolver for GatewaySet {
    fn is_gateway_asset(&self, asset: &Asset) -> bool {
        self.ids.contains(&asset.id)
            || asset.path.iter().any(|id| self.ids.contains(id))
            || asset
                .parent_id
                .as_ref()
                .is_some_and(|parent| self.ids.contains(parent))
    }
}

/// Asset operations offered to drivers, backed by the store and the update processor.
#[derive(Debug, Clone)]
pub struct RuntimeAssetService {
    store: Arc<dyn AssetStore>,
    processor: Arc<AttributeProcessor>,
}

impl RuntimeAssetService {
    pub fn new(store: Arc<dyn AssetStore>, processor: Arc<AttributeProcessor>) -> Self {
        Self { store, processor }
    }
}

fn asset_error(err: RuntimeError) -> ProtocolError {
    ProtocolError::AssetService(err.to_string())
}

impl ProtocolAssetService for RuntimeAssetService {
    fn merge_asset(&self, asset: Asset) -> agentrt_protocol::Result<Asset> {
        self.store.merge(asset).map_err(asset_error)
    }

    fn delete_asset(&self, asset_id: &str) -> agentrt_protocol::Result<bool> {
        self.store
            .delete(&[asset_id.to_owned()])
            .map(|deleted| deleted > 0)
            .map_err(asset_error)
    }

    fn find_asset(&self, asset_id: &str) -> Option<Asset> {
        self.store.find(asset_id)
    }

    fn find_assets(&self, agent_id: &str, query: &AssetQuery) -> Vec<Asset> {
        if agent_id.is_empty() {
            return Vec::new();
        }
        self.store
            .find_all(&query.clone().descendants_of(agent_id))
    }

    fn send_attribute_event(&self, event: AttributeEvent) -> agentrt_protocol::Result<()> {
        match self.processor.process(&event).map_err(asset_error)? {
            ProcessOutcome::Consumed => Ok(()),
            ProcessOutcome::PassThrough => {
                self.store.apply_attribute_event(&event).map_err(asset_error)?;
                Ok(())
            }
        }
    }

    fn update_protocol_configuration(
        &self,
        configuration: &AttributeRef,
        attribute: Attribute,
    ) -> agentrt_protocol::Result<()> {
        let Some(mut agent) = self.store.find(&configuration.asset_id) else {
            return Err(ProtocolError::AssetService(format!(
                "agent {} not found",
                configuration.asset_id
            )));
        };
        let unchanged = agent
            .attribute(&configuration.attribute_name)
            .is_some_and(|existing| existing.same_ignoring_timestamp(&attribute));
        if unchanged {
            trace!(configuration = %configuration, "protocol configuration unchanged");
            return Ok(());
        }
        let mut attribute = attribute;
        attribute.name = configuration.attribute_name.clone();
        agent.set_attribute(attribute);
        self.store.merge(agent).map_err(asset_error)?;
        Ok(())
    }
}
