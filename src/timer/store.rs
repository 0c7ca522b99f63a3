//! Heap of pending timers with lazy cancellation.
//!
//! New timers go to a staging list and only enter the heap at
//! [`TimerStore::merge`], so a timer scheduled while callbacks are being
//! fired cannot fire in that same pass. Cancelling only flags the record;
//! canceled records are skipped when popped and swept by compaction.

use crate::fiber::FiberCore;
use crate::timer::{TimerInfo, TimerKind};
use crate::utils::slab::{Key, Slab};

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::rc::Weak;
use std::time::Instant;

pub(crate) type TimerCallback = Box<dyn FnOnce()>;

struct TimerEntry {
    due: Instant,
    kind: TimerKind,
    owner: Option<Weak<FiberCore>>,
    callback: Option<TimerCallback>,
    canceled: bool,
    staged: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct HeapEntry {
    due: Instant,
    seq: u64,
    key: Key,
}

/// A timer popped from the heap, ready to run.
pub(crate) struct DueTimer {
    pub(crate) callback: TimerCallback,
    kind: TimerKind,
    owner: Option<Weak<FiberCore>>,
}

impl DueTimer {
    /// Local timers are void once their owning fiber has finished.
    pub(crate) fn is_live(&self) -> bool {
        match (self.kind, &self.owner) {
            (TimerKind::Global, _) | (TimerKind::Local, None) => true,
            (TimerKind::Local, Some(owner)) => owner
                .upgrade()
                .map(|fiber| !fiber.is_finished())
                .unwrap_or(false),
        }
    }
}

pub(crate) struct TimerStore {
    arena: Slab<TimerEntry>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    staged: Vec<HeapEntry>,
    next_seq: u64,
    canceled: usize,
    compaction_threshold: usize,
}

impl TimerStore {
    pub(crate) fn new(compaction_threshold: usize) -> Self {
        Self {
            arena: Slab::new(64),
            heap: BinaryHeap::new(),
            staged: Vec::new(),
            next_seq: 0,
            canceled: 0,
            compaction_threshold,
        }
    }

    pub(crate) fn schedule(
        &mut self,
        due: Instant,
        kind: TimerKind,
        owner: Option<Weak<FiberCore>>,
        callback: TimerCallback,
    ) -> Key {
        let key = self.arena.insert(TimerEntry {
            due,
            kind,
            owner,
            callback: Some(callback),
            canceled: false,
            staged: true,
        });

        let seq = self.next_seq;
        self.next_seq += 1;
        self.staged.push(HeapEntry { due, seq, key });

        key
    }

    /// Flags the timer as canceled and hands back its callback so the
    /// caller can drop it outside any borrow of the store.
    pub(crate) fn cancel(&mut self, key: Key) -> Option<TimerCallback> {
        let entry = self.arena.get_mut(key)?;
        if entry.canceled {
            return None;
        }

        entry.canceled = true;
        if !entry.staged {
            self.canceled += 1;
        }

        entry.callback.take()
    }

    pub(crate) fn is_pending(&self, key: Key) -> bool {
        self.arena.get(key).map(|e| !e.canceled).unwrap_or(false)
    }

    pub(crate) fn due(&self, key: Key) -> Option<Instant> {
        self.arena.get(key).map(|e| e.due)
    }

    /// Folds staged timers into the heap, then compacts if canceled
    /// records dominate.
    pub(crate) fn merge(&mut self) {
        for staged in std::mem::take(&mut self.staged) {
            let canceled = match self.arena.get_mut(staged.key) {
                Some(entry) => {
                    entry.staged = false;
                    entry.canceled
                }
                None => continue,
            };

            if canceled {
                self.arena.remove(staged.key);
            } else {
                self.heap.push(Reverse(staged));
            }
        }

        if self.canceled > self.heap.len() / 2 && self.heap.len() > self.compaction_threshold {
            self.compact();
        }
    }

    fn compact(&mut self) {
        let before = self.heap.len();
        let arena = &mut self.arena;

        let live: Vec<_> = self
            .heap
            .drain()
            .filter(|Reverse(entry)| {
                let canceled = arena.get(entry.key).map(|e| e.canceled).unwrap_or(true);
                if canceled {
                    arena.remove(entry.key);
                }
                !canceled
            })
            .collect();

        self.heap = BinaryHeap::from(live);
        self.canceled = 0;

        log::debug!("compacted timer heap from {} to {} entries", before, self.heap.len());
    }

    /// Pops the next non-canceled timer with `due <= now`.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<DueTimer> {
        loop {
            let Reverse(top) = *self.heap.peek()?;
            if top.due > now {
                return None;
            }
            self.heap.pop();

            let Some(entry) = self.arena.remove(top.key) else {
                continue;
            };

            if entry.canceled {
                self.canceled = self.canceled.saturating_sub(1);
                continue;
            }

            if let Some(callback) = entry.callback {
                return Some(DueTimer {
                    callback,
                    kind: entry.kind,
                    owner: entry.owner,
                });
            }
        }
    }

    /// Earliest due time among non-canceled timers in the heap.
    pub(crate) fn next_due(&mut self) -> Option<Instant> {
        loop {
            let Reverse(top) = *self.heap.peek()?;
            let canceled = self.arena.get(top.key).map(|e| e.canceled).unwrap_or(true);
            if !canceled {
                return Some(top.due);
            }

            self.heap.pop();
            self.arena.remove(top.key);
            self.canceled = self.canceled.saturating_sub(1);
        }
    }

    /// Drops every timer. Callbacks are returned to be dropped by the caller.
    pub(crate) fn clear(&mut self) -> Vec<TimerCallback> {
        self.heap.clear();
        self.staged.clear();
        self.canceled = 0;

        self.arena
            .drain()
            .into_iter()
            .filter_map(|entry| entry.callback)
            .collect()
    }

    /// Number of timers that have not been canceled, staged ones included.
    pub(crate) fn len(&self) -> usize {
        self.arena.iter().filter(|(_, e)| !e.canceled).count()
    }

    #[cfg(test)]
    pub(crate) fn heap_len(&self) -> usize {
        self.heap.len()
    }

    #[cfg(test)]
    pub(crate) fn canceled_count(&self) -> usize {
        self.canceled
    }

    pub(crate) fn pending(&self) -> Vec<TimerInfo> {
        let mut pending: Vec<_> = self
            .arena
            .iter()
            .filter(|(_, e)| !e.canceled)
            .map(|(_, e)| TimerInfo {
                due: e.due,
                kind: e.kind,
            })
            .collect();
        pending.sort_by_key(|info| info.due);

        pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    fn push(store: &mut TimerStore, due: Instant, log: &Rc<RefCell<Vec<u32>>>, id: u32) -> Key {
        let log = log.clone();
        store.schedule(
            due,
            TimerKind::Global,
            None,
            Box::new(move || log.borrow_mut().push(id)),
        )
    }

    fn fire_all(store: &mut TimerStore, now: Instant) {
        while let Some(timer) = store.pop_due(now) {
            (timer.callback)();
        }
    }

    #[test]
    fn staged_timers_are_invisible_until_merged() {
        let mut store = TimerStore::new(1000);
        let log = Rc::new(RefCell::new(Vec::new()));
        let now = Instant::now();

        push(&mut store, now, &log, 1);
        assert!(store.pop_due(now).is_none());

        store.merge();
        fire_all(&mut store, now);
        assert_eq!(*log.borrow(), vec![1]);
    }

    #[test]
    fn ties_fire_in_scheduling_order() {
        let mut store = TimerStore::new(1000);
        let log = Rc::new(RefCell::new(Vec::new()));
        let now = Instant::now();

        for id in 0..5 {
            push(&mut store, now, &log, id);
        }
        push(&mut store, now - Duration::from_millis(1), &log, 99);

        store.merge();
        fire_all(&mut store, now);
        assert_eq!(*log.borrow(), vec![99, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn canceled_timers_never_fire() {
        let mut store = TimerStore::new(1000);
        let log = Rc::new(RefCell::new(Vec::new()));
        let now = Instant::now();

        let staged = push(&mut store, now, &log, 1);
        store.cancel(staged);
        store.merge();

        let merged = push(&mut store, now, &log, 2);
        store.merge();
        assert!(store.cancel(merged).is_some());
        assert!(store.cancel(merged).is_none());
        assert_eq!(store.canceled_count(), 1);

        fire_all(&mut store, now);
        assert!(log.borrow().is_empty());
        assert_eq!(store.canceled_count(), 0);
    }

    #[test]
    fn compaction_drops_canceled_records() {
        let mut store = TimerStore::new(10);
        let log = Rc::new(RefCell::new(Vec::new()));
        let later = Instant::now() + Duration::from_secs(60);

        let keys: Vec<_> = (0..30).map(|id| push(&mut store, later, &log, id)).collect();
        store.merge();
        for key in &keys[..20] {
            store.cancel(*key);
        }
        assert_eq!(store.canceled_count(), 20);

        store.merge();
        assert_eq!(store.canceled_count(), 0);
        assert_eq!(store.heap_len(), 10);
        assert_eq!(store.len(), 10);
    }

    #[test]
    fn next_due_skips_canceled_head() {
        let mut store = TimerStore::new(1000);
        let log = Rc::new(RefCell::new(Vec::new()));
        let now = Instant::now();

        let early = push(&mut store, now, &log, 1);
        push(&mut store, now + Duration::from_secs(5), &log, 2);
        store.merge();
        store.cancel(early);

        assert_eq!(store.next_due(), Some(now + Duration::from_secs(5)));
    }
}
