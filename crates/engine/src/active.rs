//! Set of resources currently held by at least one consumer
//!
//! Entries are non-owning: they name a slot in the resource arena and are
//! checked against it on every lookup. Stale entries are dropped lazily and by
//! [`ActiveResources::prune`], which the engine runs when its queue drains.

use crate::arena::Arena;
use crate::key::RequestKey;
use crate::resource::{EngineResource, ResourceId};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub(crate) struct ActiveResources {
    entries: HashMap<RequestKey, ResourceId>,
}

impl ActiveResources {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn activate(&mut self, key: RequestKey, id: ResourceId) {
        if let Some(previous) = self.entries.insert(key, id)
            && previous != id
        {
            tracing::trace!(target: "pictor::engine", "Replaced active resource");
        }
    }

    /// Live, acquired resource for `key`; a stale entry is removed instead
    pub(crate) fn get(
        &mut self,
        key: &RequestKey,
        resources: &Arena<EngineResource>,
    ) -> Option<ResourceId> {
        let id = *self.entries.get(key)?;
        if is_live(resources, id) {
            return Some(id);
        }
        self.entries.remove(key);
        None
    }

    /// Remove the entry for `key` if it still names `id`
    pub(crate) fn deactivate(&mut self, key: &RequestKey, id: ResourceId) {
        if self.entries.get(key) == Some(&id) {
            self.entries.remove(key);
        }
    }

    /// Drop every entry whose resource is gone or idle
    pub(crate) fn prune(&mut self, resources: &Arena<EngineResource>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, id| is_live(resources, *id));
        before - self.entries.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

fn is_live(resources: &Arena<EngineResource>, id: ResourceId) -> bool {
    resources
        .get(id.0)
        .is_some_and(|resource| resource.acquired() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Model;
    use crate::resource::BytesResource;

    fn key(name: &str) -> RequestKey {
        RequestKey::builder(Model::Asset(name.to_string())).build()
    }

    fn insert(resources: &mut Arena<EngineResource>, name: &str, acquired: usize) -> ResourceId {
        let mut resource =
            EngineResource::new(key(name), Box::new(BytesResource::new(vec![0; 4])), true);
        for _ in 0..acquired {
            resource.acquire();
        }
        ResourceId(resources.insert(resource))
    }

    #[test]
    fn test_get_returns_acquired_resource() {
        let mut resources = Arena::new();
        let mut active = ActiveResources::new();
        let id = insert(&mut resources, "a", 1);
        active.activate(key("a"), id);
        assert_eq!(active.get(&key("a"), &resources), Some(id));
        assert_eq!(active.get(&key("b"), &resources), None);
    }

    #[test]
    fn test_stale_entry_is_dropped_on_lookup() {
        let mut resources = Arena::new();
        let mut active = ActiveResources::new();
        let id = insert(&mut resources, "a", 1);
        active.activate(key("a"), id);
        if let Some(mut resource) = resources.remove(id.0) {
            let _ = resource.release();
            resource.recycle();
        }
        // A new resource reusing the slot must not be mistaken for the old one.
        let _other = insert(&mut resources, "b", 1);
        assert_eq!(active.get(&key("a"), &resources), None);
        assert_eq!(active.len(), 0);
    }

    #[test]
    fn test_prune_drops_idle_and_gone() {
        let mut resources = Arena::new();
        let mut active = ActiveResources::new();
        let live = insert(&mut resources, "live", 2);
        let idle = insert(&mut resources, "idle", 0);
        let gone = insert(&mut resources, "gone", 0);
        active.activate(key("live"), live);
        active.activate(key("idle"), idle);
        active.activate(key("gone"), gone);
        if let Some(resource) = resources.remove(gone.0) {
            resource.recycle();
        }

        assert_eq!(active.prune(&resources), 2);
        assert_eq!(active.len(), 1);
        assert_eq!(active.get(&key("live"), &resources), Some(live));
    }

    #[test]
    fn test_deactivate_ignores_newer_entry() {
        let mut resources = Arena::new();
        let mut active = ActiveResources::new();
        let old = insert(&mut resources, "a", 1);
        let new = insert(&mut resources, "a", 1);
        active.activate(key("a"), old);
        active.activate(key("a"), new);
        active.deactivate(&key("a"), old);
        assert_eq!(active.get(&key("a"), &resources), Some(new));
        active.deactivate(&key("a"), new);
        assert_eq!(active.len(), 0);
    }
}
