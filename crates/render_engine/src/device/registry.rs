//! Resource registration table and deferred-destroy queue
//!
//! The registry exists for ID assignment and leak reporting; it is not
//! load-bearing for lookup. The dispose queue delays native-handle
//! destruction until every frame that might reference a resource has
//! retired.

use parking_lot::{Mutex, RwLock};

use crate::resource::{ResourceId, ResourceType};

/// One live entry in the registration table
#[derive(Debug, Clone)]
pub(crate) struct RegistrySlot {
    pub name: String,
    pub resource_type: ResourceType,
}

/// Slot table mapping resource IDs to liveness info.
///
/// IDs are recycled from a free-list. Slot 0 is never handed out; it backs
/// the reserved invalid ID.
pub(crate) struct ResourceRegistry {
    slots: Vec<Option<RegistrySlot>>,
    free_ids: Vec<u32>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self {
            // Slot 0 is the permanently-dead invalid entry.
            slots: vec![None],
            free_ids: Vec::new(),
        }
    }

    pub fn register(&mut self, name: &str, resource_type: ResourceType) -> ResourceId {
        let slot = RegistrySlot {
            name: name.to_string(),
            resource_type,
        };

        if let Some(id) = self.free_ids.pop() {
            debug_assert!(self.slots[id as usize].is_none());
            self.slots[id as usize] = Some(slot);
            ResourceId(id)
        } else {
            let id = self.slots.len() as u32;
            self.slots.push(Some(slot));
            ResourceId(id)
        }
    }

    /// Invalidate a slot. The ID is not reusable until [`Self::release_id`]
    /// runs, which happens only after the slot's disposer has executed.
    pub fn unregister(&mut self, id: ResourceId) {
        assert!(id.is_valid(), "attempted to unregister the invalid resource ID");
        let slot = self
            .slots
            .get_mut(id.0 as usize)
            .expect("resource ID out of range");
        assert!(slot.is_some(), "double unregister of resource ID {}", id.0);
        *slot = None;
    }

    /// Return an ID to the free-list after its disposer has run
    pub fn release_id(&mut self, id: ResourceId) {
        debug_assert!(self.slots[id.0 as usize].is_none());
        self.free_ids.push(id.0);
    }

    /// Names of every still-registered resource (leaks at shutdown)
    pub fn live_resources(&self) -> Vec<String> {
        self.slots
            .iter()
            .filter_map(|slot| slot.as_ref().map(|s| s.name.clone()))
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

/// Thread-safe wrapper used by the device. Lookups take the shared lock,
/// registration the exclusive one.
pub(crate) struct SharedRegistry {
    inner: RwLock<ResourceRegistry>,
}

impl SharedRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(ResourceRegistry::new()),
        }
    }

    pub fn register(&self, name: &str, resource_type: ResourceType) -> ResourceId {
        self.inner.write().register(name, resource_type)
    }

    pub fn unregister(&self, id: ResourceId) {
        self.inner.write().unregister(id);
    }

    pub fn release_id(&self, id: ResourceId) {
        self.inner.write().release_id(id);
    }

    pub fn live_resources(&self) -> Vec<String> {
        self.inner.read().live_resources()
    }

    pub fn live_count(&self) -> usize {
        self.inner.read().live_count()
    }
}

type DisposeFn<C> = Box<dyn FnOnce(&C) + Send>;

struct DisposeEntry<C> {
    frames_left: u32,
    id: ResourceId,
    dispose: DisposeFn<C>,
}

/// Deferred-destroy queue, generic over the context handed to disposers.
///
/// Resources may be unregistered from any thread; the queue is ticked from
/// the main thread on `end_frame`.
pub(crate) struct DisposeQueue<C> {
    entries: Mutex<Vec<DisposeEntry<C>>>,
}

impl<C> DisposeQueue<C> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Schedule a disposer to run after `frames` calls to [`Self::tick`]
    pub fn enqueue(&self, id: ResourceId, frames: u32, dispose: DisposeFn<C>) {
        self.entries.lock().push(DisposeEntry {
            frames_left: frames,
            id,
            dispose,
        });
    }

    pub fn pending_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Advance one frame: decrement counters and run every disposer that
    /// reached zero. Returns the IDs whose slots may now be recycled.
    pub fn tick(&self, context: &C) -> Vec<ResourceId> {
        let ready: Vec<DisposeEntry<C>> = {
            let mut entries = self.entries.lock();
            for entry in entries.iter_mut() {
                entry.frames_left = entry.frames_left.saturating_sub(1);
            }
            let (ready, remaining) = entries
                .drain(..)
                .partition(|entry| entry.frames_left == 0);
            *entries = remaining;
            ready
        };

        // Disposers run outside the lock; they may touch the device freely.
        let mut released = Vec::with_capacity(ready.len());
        for entry in ready {
            (entry.dispose)(context);
            released.push(entry.id);
        }
        released
    }

    /// Run every queued disposer regardless of its counter (shutdown path)
    pub fn flush_all(&self, context: &C) -> Vec<ResourceId> {
        let drained: Vec<DisposeEntry<C>> = {
            let mut entries = self.entries.lock();
            entries.drain(..).collect()
        };

        let mut released = Vec::with_capacity(drained.len());
        for entry in drained {
            (entry.dispose)(context);
            released.push(entry.id);
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_registry_ids_start_at_one() {
        let mut registry = ResourceRegistry::new();
        let id = registry.register("first", ResourceType::Buffer);
        assert_eq!(id, ResourceId(1));
    }

    #[test]
    fn test_id_not_recycled_before_release() {
        let mut registry = ResourceRegistry::new();
        let a = registry.register("a", ResourceType::Buffer);
        registry.unregister(a);

        // The slot is dead but the ID must not be handed out again yet.
        let b = registry.register("b", ResourceType::Texture);
        assert_ne!(a, b);

        registry.release_id(a);
        let c = registry.register("c", ResourceType::Texture);
        assert_eq!(a, c);
    }

    #[test]
    fn test_leak_reporting_lists_live_names() {
        let mut registry = ResourceRegistry::new();
        let a = registry.register("leaked_buffer", ResourceType::Buffer);
        let b = registry.register("released_texture", ResourceType::Texture);
        registry.unregister(b);
        registry.release_id(b);

        let leaks = registry.live_resources();
        assert_eq!(leaks, vec!["leaked_buffer".to_string()]);
        assert_eq!(registry.live_count(), 1);
        registry.unregister(a);
    }

    #[test]
    fn test_dispose_runs_after_exact_frame_count() {
        let queue: DisposeQueue<()> = DisposeQueue::new();
        let fired = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&fired);
        queue.enqueue(
            ResourceId(1),
            3,
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(queue.tick(&()).is_empty());
        assert!(queue.tick(&()).is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        let released = queue.tick(&());
        assert_eq!(released, vec![ResourceId(1)]);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn test_flush_ignores_counters() {
        let queue: DisposeQueue<()> = DisposeQueue::new();
        let fired = Arc::new(AtomicU32::new(0));

        for id in 1..=4 {
            let counter = Arc::clone(&fired);
            queue.enqueue(
                ResourceId(id),
                100,
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        let released = queue.flush_all(&());
        assert_eq!(released.len(), 4);
        assert_eq!(fired.load(Ordering::SeqCst), 4);
    }
}
