// ext.rs — per-player extension slots
//
// Modules that need to hang data off a player register a typed slot key at
// startup. The slot table is sized once, before any player exists; there is
// no registration after freeze and no per-lookup string hashing.

use std::any::Any;
use std::marker::PhantomData;

pub struct SlotKey<T> {
    index: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for SlotKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SlotKey<T> {}

/// Registry of slots. `register` is only legal before the first
/// `make_data`; the table is frozen from then on.
pub struct ExtRegistry {
    count: usize,
    frozen: bool,
}

impl ExtRegistry {
    pub fn new() -> Self {
        Self {
            count: 0,
            frozen: false,
        }
    }

    pub fn register<T: Any + Send>(&mut self) -> SlotKey<T> {
        assert!(!self.frozen, "slot registered after startup");
        let index = self.count;
        self.count += 1;
        SlotKey {
            index,
            _marker: PhantomData,
        }
    }

    pub fn make_data(&mut self) -> ExtData {
        self.frozen = true;
        ExtData {
            slots: (0..self.count).map(|_| None).collect(),
        }
    }
}

impl Default for ExtRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// One holder's slot values, indexed by `SlotKey`.
#[derive(Default)]
pub struct ExtData {
    slots: Vec<Option<Box<dyn Any + Send>>>,
}

impl ExtData {
    pub fn set<T: Any + Send>(&mut self, key: SlotKey<T>, value: T) {
        self.slots[key.index] = Some(Box::new(value));
    }

    pub fn get<T: Any + Send>(&self, key: SlotKey<T>) -> Option<&T> {
        self.slots[key.index]
            .as_ref()
            .and_then(|b| b.downcast_ref::<T>())
    }

    pub fn get_mut<T: Any + Send>(&mut self, key: SlotKey<T>) -> Option<&mut T> {
        self.slots[key.index]
            .as_mut()
            .and_then(|b| b.downcast_mut::<T>())
    }

    pub fn take<T: Any + Send>(&mut self, key: SlotKey<T>) -> Option<T> {
        self.slots[key.index]
            .take()
            .and_then(|b| b.downcast::<T>().ok())
            .map(|b| *b)
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }
}
