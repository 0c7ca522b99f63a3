//! Generational slab used as the timer arena.
//!
//! Keys carry the generation of the slot they were issued for, so a key
//! kept by a stale handle never reaches a record that reused the slot.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct Key {
    index: usize,
    generation: u32,
}

struct Slot<T> {
    generation: u32,
    item: Option<T>,
}

pub(crate) struct Slab<T> {
    items: Vec<Slot<T>>,
    free: Vec<usize>,
    len: usize,
}

impl<T> Slab<T> {
    pub(crate) fn new(size: usize) -> Self {
        let items = (0..size)
            .map(|_| Slot {
                generation: 0,
                item: None,
            })
            .collect();
        // Reverse so that low indices are handed out first.
        let free = (0..size).rev().collect();

        Self {
            items,
            free,
            len: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn insert(&mut self, item: T) -> Key {
        let index = if let Some(i) = self.free.pop() {
            i
        } else {
            let len = self.items.len();
            let new_len = if len == 0 { 1 } else { 2 * len };

            self.items.extend((len..new_len).map(|_| Slot {
                generation: 0,
                item: None,
            }));
            self.free.extend(((len + 1)..new_len).rev());

            len
        };

        let slot = &mut self.items[index];
        slot.item = Some(item);
        self.len += 1;

        Key {
            index,
            generation: slot.generation,
        }
    }

    pub(crate) fn get(&self, key: Key) -> Option<&T> {
        self.items
            .get(key.index)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.item.as_ref())
    }

    pub(crate) fn get_mut(&mut self, key: Key) -> Option<&mut T> {
        self.items
            .get_mut(key.index)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.item.as_mut())
    }

    pub(crate) fn remove(&mut self, key: Key) -> Option<T> {
        let slot = self.items.get_mut(key.index)?;
        if slot.generation != key.generation {
            return None;
        }

        let item = slot.item.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);
        self.len -= 1;

        Some(item)
    }

    /// Removes every item, returning them in slot order.
    pub(crate) fn drain(&mut self) -> Vec<T> {
        let mut drained = Vec::with_capacity(self.len);

        for (index, slot) in self.items.iter_mut().enumerate() {
            if let Some(item) = slot.item.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index);
                drained.push(item);
            }
        }
        self.len = 0;

        drained
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (Key, &T)> {
        self.items.iter().enumerate().filter_map(|(index, slot)| {
            slot.item.as_ref().map(|item| {
                (
                    Key {
                        index,
                        generation: slot.generation,
                    },
                    item,
                )
            })
        })
    }
}
