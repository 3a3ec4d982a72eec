use crate::RegistryId;
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

struct Slot<T> {
    generation: u32,
    value: Option<Arc<T>>,
}

struct Inner<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    by_handle: HashMap<u64, RegistryId<T>>,
}

/// Maps opaque native handle values to wrapper instances.
///
/// Wrappers live in a slot arena indexed by a generation-checked
/// [`RegistryId`]; a handle index on top of it resolves the native handle
/// value a driver call carries. Removal returns the slot to a free list and
/// bumps its generation, so ids held past destruction go stale instead of
/// aliasing the slot's next occupant.
///
/// The lock is held only for the map operation itself. A lookup miss is not
/// an error; callers fall through to the raw driver path.
pub struct Registry<T> {
    inner: RwLock<Inner<T>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Inner {
                slots: Vec::new(),
                free: Vec::new(),
                by_handle: HashMap::new(),
            }),
        }
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Default::default()
    }

    /// Registers a wrapper for a newly created native object. Must be called
    /// exactly once per creation call; a second insert for a live handle
    /// returns the value back to the caller untouched.
    pub fn insert(&self, handle: u64, value: T) -> Result<RegistryId<T>, T> {
        let mut inner = self.inner.write().unwrap();

        if inner.by_handle.contains_key(&handle) {
            return Err(value);
        }

        let id = match inner.free.pop() {
            Some(index) => {
                let slot = &mut inner.slots[index];
                slot.value = Some(Arc::new(value));
                RegistryId::new(index, slot.generation)
            }
            None => {
                let index = inner.slots.len();
                inner.slots.push(Slot {
                    generation: 0,
                    value: Some(Arc::new(value)),
                });
                RegistryId::new(index, 0)
            }
        };

        inner.by_handle.insert(handle, id);
        Ok(id)
    }

    /// Resolves a native handle to its wrapper, if one is registered.
    pub fn get(&self, handle: u64) -> Option<Arc<T>> {
        let inner = self.inner.read().unwrap();
        let id = inner.by_handle.get(&handle)?;
        inner.resolve(*id)
    }

    /// Resolves a generation-checked id directly. Stale ids miss.
    pub fn get_by_id(&self, id: RegistryId<T>) -> Option<Arc<T>> {
        self.inner.read().unwrap().resolve(id)
    }

    /// Removes the wrapper for `handle`, returning it if it was registered.
    /// The slot goes back on the free list with a bumped generation.
    pub fn remove(&self, handle: u64) -> Option<Arc<T>> {
        let mut inner = self.inner.write().unwrap();
        let id = inner.by_handle.remove(&handle)?;
        let slot = &mut inner.slots[id.index()];
        debug_assert_eq!(slot.generation, id.generation());
        let value = slot.value.take();
        slot.generation = slot.generation.wrapping_add(1);
        inner.free.push(id.index());
        value
    }

    /// Drains every registered wrapper. Used at layer shutdown, after all
    /// outstanding workers have been joined.
    pub fn clear(&self) -> Vec<Arc<T>> {
        let mut guard = self.inner.write().unwrap();
        let inner = &mut *guard;
        inner.by_handle.clear();
        let mut out = Vec::new();
        for (index, slot) in inner.slots.iter_mut().enumerate() {
            if let Some(value) = slot.value.take() {
                slot.generation = slot.generation.wrapping_add(1);
                inner.free.push(index);
                out.push(value);
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Inner<T> {
    fn resolve(&self, id: RegistryId<T>) -> Option<Arc<T>> {
        let slot = self.slots.get(id.index())?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.value.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_after_insert_returns_same_instance() {
        let registry = Registry::new();
        registry.insert(0xab, "queue-0").unwrap();

        let first = registry.get(0xab).unwrap();
        let second = registry.get(0xab).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn lookup_after_remove_misses() {
        let registry = Registry::new();
        registry.insert(0xab, "queue-0").unwrap();
        assert!(registry.remove(0xab).is_some());
        assert!(registry.get(0xab).is_none());
        assert!(registry.remove(0xab).is_none());
    }

    #[test]
    fn double_insert_is_rejected() {
        let registry = Registry::new();
        registry.insert(1, "a").unwrap();
        assert_eq!(registry.insert(1, "b"), Err("b"));
        assert_eq!(*registry.get(1).unwrap(), "a");
    }

    #[test]
    fn stale_id_misses_after_slot_reuse() {
        let registry = Registry::new();
        let stale = registry.insert(1, "a").unwrap();
        registry.remove(1);

        // Slot is reused for the next insert with a new generation.
        let fresh = registry.insert(2, "b").unwrap();
        assert_eq!(stale.index(), fresh.index());

        assert!(registry.get_by_id(stale).is_none());
        assert_eq!(*registry.get_by_id(fresh).unwrap(), "b");
    }

    #[test]
    fn clear_drains_everything() {
        let registry = Registry::new();
        registry.insert(1, "a").unwrap();
        registry.insert(2, "b").unwrap();
        let drained = registry.clear();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
        assert!(registry.get(1).is_none());
    }

    #[test]
    fn concurrent_lookups_while_inserting() {
        use std::thread;

        let registry = Arc::new(Registry::new());
        for handle in 0..64u64 {
            registry.insert(handle, handle).unwrap();
        }

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        for handle in 0..64u64 {
                            assert_eq!(*registry.get(handle).unwrap(), handle);
                        }
                    }
                })
            })
            .collect();

        let writer = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for handle in 64..1064u64 {
                    registry.insert(handle, handle).unwrap();
                    registry.remove(handle);
                }
            })
        };

        for reader in readers {
            reader.join().unwrap();
        }
        writer.join().unwrap();
    }
}
