//! Generational slab
//!
//! Index-plus-generation arena with an explicit free list. Freeing a slot
//! bumps its generation so a stale key never aliases a newer occupant.

use alloc::vec::Vec;

/// Key into a [`Slab`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlabKey {
    index: u32,
    generation: u32,
}

impl SlabKey {
    #[inline]
    pub const fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

#[derive(Debug)]
enum Slot<T> {
    Vacant { next_free: Option<u32>, generation: u32 },
    Occupied { generation: u32, value: T },
}

/// Bounded arena with stable, generation-checked keys
#[derive(Debug)]
pub struct Slab<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
    capacity: usize,
}

impl<T> Slab<T> {
    /// Create an empty slab that holds at most `capacity` values
    pub const fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            len: 0,
            capacity,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len >= self.capacity
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert a value, handing it back if the slab is full
    pub fn insert(&mut self, value: T) -> Result<SlabKey, T> {
        if let Some(index) = self.free_head {
            let slot = &mut self.slots[index as usize];
            let (next_free, generation) = match slot {
                Slot::Vacant {
                    next_free,
                    generation,
                } => (*next_free, *generation),
                Slot::Occupied { .. } => return Err(value),
            };
            *slot = Slot::Occupied { generation, value };
            self.free_head = next_free;
            self.len += 1;
            return Ok(SlabKey { index, generation });
        }

        if self.slots.len() >= self.capacity {
            return Err(value);
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot::Occupied {
            generation: 0,
            value,
        });
        self.len += 1;
        Ok(SlabKey {
            index,
            generation: 0,
        })
    }

    pub fn get(&self, key: SlabKey) -> Option<&T> {
        match self.slots.get(key.index as usize)? {
            Slot::Occupied { generation, value } if *generation == key.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, key: SlabKey) -> Option<&mut T> {
        match self.slots.get_mut(key.index as usize)? {
            Slot::Occupied { generation, value } if *generation == key.generation => Some(value),
            _ => None,
        }
    }

    #[inline]
    pub fn contains(&self, key: SlabKey) -> bool {
        self.get(key).is_some()
    }

    /// Remove a value; the slot's generation advances
    pub fn remove(&mut self, key: SlabKey) -> Option<T> {
        let slot = self.slots.get_mut(key.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == key.generation => {}
            _ => return None,
        }

        let vacant = Slot::Vacant {
            next_free: self.free_head,
            generation: key.generation.wrapping_add(1),
        };
        let old = core::mem::replace(slot, vacant);
        self.free_head = Some(key.index);
        self.len -= 1;

        match old {
            Slot::Occupied { value, .. } => Some(value),
            Slot::Vacant { .. } => None,
        }
    }

    /// Iterate over occupied slots in index order
    pub fn iter(&self) -> impl Iterator<Item = (SlabKey, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, value } => Some((
                    SlabKey {
                        index: index as u32,
                        generation: *generation,
                    },
                    value,
                )),
                Slot::Vacant { .. } => None,
            })
    }

    /// Keys of every occupied slot
    pub fn keys(&self) -> Vec<SlabKey> {
        self.iter().map(|(key, _)| key).collect()
    }

    /// Remove every value
    pub fn clear(&mut self) -> Vec<T> {
        let keys = self.keys();
        keys.into_iter().filter_map(|key| self.remove(key)).collect()
    }
}
