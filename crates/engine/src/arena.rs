//! Generational arena with a free list
//!
//! Indices carry the generation of the slot they were issued for, so an index
//! kept after its value was removed never resolves to a later occupant.

/// Handle to a value stored in an [`Arena`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Index {
    slot: usize,
    generation: u64,
}

#[derive(Debug)]
enum Slot<T> {
    Occupied { generation: u64, value: T },
    Vacant { generation: u64 },
}

impl<T> Slot<T> {
    const fn generation(&self) -> u64 {
        match self {
            Self::Occupied { generation, .. } | Self::Vacant { generation } => *generation,
        }
    }
}

/// Slab storage whose removed slots are reused with a bumped generation
#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    /// Create an empty arena
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Store `value`, reusing a free slot when one exists
    pub fn insert(&mut self, value: T) -> Index {
        self.len += 1;
        if let Some(slot) = self.free.pop() {
            let entry = &mut self.slots[slot];
            let generation = entry.generation();
            *entry = Slot::Occupied { generation, value };
            return Index { slot, generation };
        }
        let slot = self.slots.len();
        self.slots.push(Slot::Occupied {
            generation: 0,
            value,
        });
        Index {
            slot,
            generation: 0,
        }
    }

    /// Borrow the value at `index` if it is still live
    #[must_use]
    pub fn get(&self, index: Index) -> Option<&T> {
        match self.slots.get(index.slot)? {
            Slot::Occupied { generation, value } if *generation == index.generation => Some(value),
            _ => None,
        }
    }

    /// Mutably borrow the value at `index` if it is still live
    pub fn get_mut(&mut self, index: Index) -> Option<&mut T> {
        match self.slots.get_mut(index.slot)? {
            Slot::Occupied { generation, value } if *generation == index.generation => Some(value),
            _ => None,
        }
    }

    /// Returns true if `index` still refers to a live value
    #[cfg(test)]
    #[must_use]
    pub fn contains(&self, index: Index) -> bool {
        self.get(index).is_some()
    }

    /// Take the value at `index` out, invalidating every copy of the index
    pub fn remove(&mut self, index: Index) -> Option<T> {
        let entry = self.slots.get_mut(index.slot)?;
        if entry.generation() != index.generation || matches!(entry, Slot::Vacant { .. }) {
            return None;
        }
        let vacant = Slot::Vacant {
            generation: index.generation + 1,
        };
        match std::mem::replace(entry, vacant) {
            Slot::Occupied { value, .. } => {
                self.free.push(index.slot);
                self.len -= 1;
                Some(value)
            }
            Slot::Vacant { .. } => None,
        }
    }

    /// Remove and return every live value
    pub fn drain(&mut self) -> Vec<T> {
        let mut values = Vec::with_capacity(self.len);
        for (slot, entry) in self.slots.iter_mut().enumerate() {
            if let Slot::Occupied { generation, .. } = entry {
                let vacant = Slot::Vacant {
                    generation: *generation + 1,
                };
                if let Slot::Occupied { value, .. } = std::mem::replace(entry, vacant) {
                    values.push(value);
                    self.free.push(slot);
                }
            }
        }
        self.len = 0;
        values
    }

    /// Number of live values
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let mut arena = Arena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");
        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.remove(a), Some("a"));
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.remove(a), None);
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_reused_slot_rejects_stale_index() {
        let mut arena = Arena::new();
        let old = arena.insert(1);
        arena.remove(old);
        let new = arena.insert(2);
        assert_ne!(old, new);
        assert!(!arena.contains(old));
        assert_eq!(arena.get(new), Some(&2));
        assert!(arena.get_mut(old).is_none());
    }

    #[test]
    fn test_drain_empties_and_invalidates() {
        let mut arena = Arena::new();
        let indices: Vec<_> = (0..5).map(|i| arena.insert(i)).collect();
        arena.remove(indices[2]);
        let mut drained = arena.drain();
        drained.sort_unstable();
        assert_eq!(drained, vec![0, 1, 3, 4]);
        assert_eq!(arena.len(), 0);
        assert!(indices.iter().all(|i| !arena.contains(*i)));
        let reused = arena.insert(9);
        assert_eq!(arena.get(reused), Some(&9));
    }
}
