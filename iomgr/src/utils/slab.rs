/// A fixed-capacity slab.
///
/// A `Slab` stores values of type `T` in slots addressed by small
/// integer indices. Freed slots are reused, but the slab never grows
/// past the capacity given at construction, which bounds the memory
/// footprint of the registry built on top of it.
///
/// Slot bookkeeping is explicit: a slot is either occupied (`Some`) or
/// sitting in the free list.
pub(crate) struct Slab<T> {
    /// Storage for items; `None` marks a free slot.
    items: Vec<Option<T>>,
    /// Stack of free indices that can be reused.
    free: Vec<usize>,
    /// Maximum number of slots.
    capacity: usize,
}

impl<T> Slab<T> {
    /// Creates an empty slab that will hold at most `capacity` items.
    ///
    /// Slots are materialized lazily, so a large capacity costs nothing
    /// until it is used.
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::new(),
            free: Vec::new(),
            capacity,
        }
    }

    /// Inserts the value produced by `make`, which receives the index the
    /// value will live at.
    ///
    /// Freed slots are reused first; otherwise a new slot is appended.
    /// When the slab is full `make` is handed back uncalled.
    pub(crate) fn insert_with<F>(&mut self, make: F) -> Result<(usize, &T), F>
    where
        F: FnOnce(usize) -> T,
    {
        let index = if let Some(i) = self.free.pop() {
            i
        } else if self.items.len() < self.capacity {
            self.items.push(None);
            self.items.len() - 1
        } else {
            return Err(make);
        };

        let item = self.items[index].insert(make(index));
        Ok((index, &*item))
    }

    /// Removes and returns the value stored at `index`.
    ///
    /// Returns `None` if the slot is not in use.
    pub(crate) fn remove(&mut self, index: usize) -> Option<T> {
        let item = self.items.get_mut(index)?.take()?;
        self.free.push(index);
        Some(item)
    }

    pub(crate) fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)?.as_ref()
    }

    /// Iterates over occupied slots in index order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.items
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|item| (i, item)))
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len() - self.free.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}
