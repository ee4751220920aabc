use indexmap::IndexMap;

/// An id-indexed arena for one kind of GC object.
///
/// Grounded on the teacher's `GcPool` (`gc/gc_object.rs`): an `IndexMap`
/// keyed by a recycled `u32` id gives O(1) lookup, O(live) iteration for
/// sweep, and id reuse without ever moving a live id (unlike a packed
/// `Vec<T>`, which would have to shuffle indices on removal).
pub struct ObjectPool<T> {
    slots: IndexMap<u32, (super::GcHeader, T), ahash::RandomState>,
    free_list: Vec<u32>,
    next_id: u32,
}

impl<T> ObjectPool<T> {
    pub fn new() -> Self {
        ObjectPool {
            slots: IndexMap::with_hasher(ahash::RandomState::new()),
            free_list: Vec::new(),
            next_id: 0,
        }
    }

    pub fn insert(&mut self, value: T) -> u32 {
        let id = self.free_list.pop().unwrap_or_else(|| {
            let id = self.next_id;
            self.next_id += 1;
            id
        });
        self.slots.insert(id, (super::GcHeader::new_white(), value));
        id
    }

    pub fn get(&self, id: u32) -> Option<&T> {
        self.slots.get(&id).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.slots.get_mut(&id).map(|(_, v)| v)
    }

    pub fn header(&self, id: u32) -> Option<&super::GcHeader> {
        self.slots.get(&id).map(|(h, _)| h)
    }

    pub fn header_mut(&mut self, id: u32) -> Option<&mut super::GcHeader> {
        self.slots.get_mut(&id).map(|(h, _)| h)
    }

    pub fn remove(&mut self, id: u32) -> Option<T> {
        let removed = self.slots.swap_remove(&id).map(|(_, v)| v);
        if removed.is_some() {
            self.free_list.push(id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.slots.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.slots.iter().map(|(id, (_, v))| (*id, v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u32, &mut T)> {
        self.slots.iter_mut().map(|(id, (_, v))| (*id, v))
    }

    /// Sweep: drop every object whose header is still white, repaint
    /// survivors white for the next cycle. Returns the number freed.
    pub fn sweep(&mut self) -> usize {
        let dead: Vec<u32> = self
            .slots
            .iter()
            .filter(|(_, (h, _))| h.is_white())
            .map(|(id, _)| *id)
            .collect();
        for id in &dead {
            self.slots.swap_remove(id);
            self.free_list.push(*id);
        }
        for (h, _) in self.slots.values_mut() {
            h.whiten();
        }
        dead.len()
    }
}

impl<T> Default for ObjectPool<T> {
    fn default() -> Self {
        Self::new()
    }
}
