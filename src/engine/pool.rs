//! Fixed-capacity arena of connection records addressed by generational
//! handles.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Resource;
use crate::{Error, Result};

/// Handle to a connection owned by an [Engine](super::Engine).
///
/// A handle stays valid until its slot is released; the slot's generation
/// then changes, so a stale handle never reaches the slot's next occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    index: u32,
    generation: u32,
}

impl ConnectionId {
    /// Returns the slot index.
    pub fn index(&self) -> usize {
        self.index as usize
    }

    /// Returns the slot generation the handle was issued for.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<Arc<T>>,
}

#[derive(Debug)]
struct Slots<T> {
    entries: Vec<Slot<T>>,
    /// Indices of vacant slots; the lowest index is handed out first.
    free: Vec<u32>,
    len: usize,
}

/// Connection pool.
///
/// Lookups take the lock shared. Allocation and release take it exclusively
/// and are the only operations that do.
#[derive(Debug)]
pub(crate) struct Pool<T> {
    slots: RwLock<Slots<T>>,
}

impl<T> Pool<T> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let entries = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                value: None,
            })
            .collect();

        Self {
            slots: RwLock::new(Slots {
                entries,
                free: (0..capacity as u32).rev().collect(),
                len: 0,
            }),
        }
    }

    /// Stores `value` in a vacant slot.
    ///
    /// # Errors
    ///
    /// Returns [Error::Exhausted] if every slot is occupied.
    pub(crate) fn insert(&self, value: T) -> Result<(ConnectionId, Arc<T>)> {
        let mut slots = self.slots.write();

        let Some(index) = slots.free.pop() else {
            return Err(Error::Exhausted(Resource::ConnectionSlots));
        };

        let value = Arc::new(value);
        let slot = &mut slots.entries[index as usize];
        slot.value = Some(Arc::clone(&value));

        let id = ConnectionId {
            index,
            generation: slot.generation,
        };

        slots.len += 1;

        Ok((id, value))
    }

    pub(crate) fn get(&self, id: ConnectionId) -> Option<Arc<T>> {
        let slots = self.slots.read();

        slots
            .entries
            .get(id.index())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.clone())
    }

    /// Vacates the slot of `id`, invalidating every copy of the handle.
    pub(crate) fn remove(&self, id: ConnectionId) -> Option<Arc<T>> {
        let mut slots = self.slots.write();

        let slot = slots
            .entries
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation)?;

        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);

        slots.free.push(id.index);
        slots.len -= 1;

        Some(value)
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.read().len
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.read().entries.len()
    }

    /// Returns the handles of every occupied slot.
    pub(crate) fn ids(&self) -> Vec<ConnectionId> {
        let slots = self.slots.read();

        slots
            .entries
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.value.is_some())
            .map(|(index, slot)| ConnectionId {
                index: index as u32,
                generation: slot.generation,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;

    #[test]
    fn pool_fills_and_reports_exhaustion() {
        let pool = Pool::with_capacity(2);

        let (a, _) = pool.insert("a").unwrap();
        let (b, _) = pool.insert("b").unwrap();

        assert_eq!((a.index(), b.index()), (0, 1));
        assert_eq!(pool.len(), 2);
        assert_matches!(
            pool.insert("c"),
            Err(Error::Exhausted(Resource::ConnectionSlots))
        );
    }

    #[test]
    fn pool_stale_handle_misses_reused_slot() {
        let pool = Pool::with_capacity(1);

        let (old, _) = pool.insert(1).unwrap();
        assert_eq!(pool.remove(old).as_deref(), Some(&1));
        assert!(pool.remove(old).is_none());

        let (new, _) = pool.insert(2).unwrap();
        assert_eq!(new.index(), old.index());
        assert_ne!(new.generation(), old.generation());

        assert!(pool.get(old).is_none());
        assert_eq!(pool.get(new).as_deref(), Some(&2));
        assert_eq!(pool.ids(), vec![new]);
        assert_eq!(pool.capacity(), 1);
    }
}
