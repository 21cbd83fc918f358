//! Opaque 64-bit handles and the pool that resolves them.
//!
//! A handle is `context_id << 32 | object_id`. Handle `0` (context 0, object 0) is reserved and
//! never allocated, so it doubles as the "null handle" sentinel used by e.g. a trivial `iacc`.

use std::sync::{Arc, Weak};

#[cfg(feature = "parking_lot")]
use parking_lot::Mutex;
#[cfg(not(feature = "parking_lot"))]
use std::sync::Mutex;

pub const NULL_HANDLE: u64 = 0;

/// Packs a context id and an object id into an opaque handle.
pub const fn encode(context_id: u32, object_id: u32) -> u64 {
    ((context_id as u64) << 32) | object_id as u64
}

/// Splits a handle back into its context id and object id.
pub const fn decode(handle: u64) -> (u32, u32) {
    ((handle >> 32) as u32, handle as u32)
}

struct Slots<T> {
    entries: Vec<Option<Arc<T>>>,
    free_list: Vec<u32>,
}

/// Maps object ids to reference-counted objects for one context.
///
/// Insertion and removal take a short-lived lock; the returned `Arc<T>` is usable without holding
/// it, so `type_free` recursing into children never does so under this lock.
pub struct HandlePool<T> {
    slots: Mutex<Slots<T>>,
}

impl<T> Default for HandlePool<T> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(Slots {
                entries: Vec::new(),
                free_list: Vec::new(),
            }),
        }
    }
}

impl<T> HandlePool<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a new object id and stores `value`, returning the id and a strong reference.
    pub fn alloc(&self, value: T) -> (u32, Arc<T>) {
        self.alloc_existing(Arc::new(value))
    }

    /// Stores an already-constructed `Arc<T>` under a new id. Used when a node already reachable
    /// through a parent's payload needs its own handle minted (e.g. flattening a child in place).
    pub fn alloc_existing(&self, value: Arc<T>) -> (u32, Arc<T>) {
        #[cfg_attr(not(feature = "parking_lot"), allow(unused_mut))]
        let mut slots = lock(&self.slots);

        let id = if let Some(id) = slots.free_list.pop() {
            slots.entries[id as usize] = Some(Arc::clone(&value));
            id
        } else {
            let id = slots.entries.len() as u32;
            slots.entries.push(Some(Arc::clone(&value)));
            id
        };

        (id, value)
    }

    /// Looks up an object by id. Returns `None` if the id was never allocated or was freed.
    pub fn get(&self, object_id: u32) -> Option<Arc<T>> {
        let slots = lock(&self.slots);
        slots
            .entries
            .get(object_id as usize)
            .and_then(|slot| slot.clone())
    }

    /// Removes an object from the pool, returning it so the caller can finish tearing it down.
    pub fn remove(&self, object_id: u32) -> Option<Arc<T>> {
        #[cfg_attr(not(feature = "parking_lot"), allow(unused_mut))]
        let mut slots = lock(&self.slots);

        let slot = slots.entries.get_mut(object_id as usize)?;
        let value = slot.take()?;
        slots.free_list.push(object_id);

        Some(value)
    }

    pub fn weak(&self, object_id: u32) -> Option<Weak<T>> {
        self.get(object_id).map(|arc| Arc::downgrade(&arc))
    }
}

#[cfg(feature = "parking_lot")]
fn lock<T>(mutex: &Mutex<T>) -> parking_lot::MutexGuard<'_, T> {
    mutex.lock()
}

#[cfg(not(feature = "parking_lot"))]
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips() {
        let handle = encode(7, 42);
        assert_eq!(decode(handle), (7, 42));
    }

    #[test]
    fn null_handle_is_zero() {
        assert_eq!(NULL_HANDLE, encode(0, 0));
    }

    #[test]
    fn alloc_get_remove() {
        let pool: HandlePool<i32> = HandlePool::new();
        let (id, value) = pool.alloc(10);
        assert_eq!(*value, 10);
        assert_eq!(*pool.get(id).unwrap(), 10);
        assert_eq!(*pool.remove(id).unwrap(), 10);
        assert!(pool.get(id).is_none());
    }

    #[test]
    fn freed_slots_are_reused() {
        let pool: HandlePool<i32> = HandlePool::new();
        let (id_a, _) = pool.alloc(1);
        pool.remove(id_a);
        let (id_b, _) = pool.alloc(2);
        assert_eq!(id_a, id_b);
    }
}
