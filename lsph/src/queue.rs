use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex};

struct Slot<T> {
    index: usize,
    item: T,
}

impl<T> PartialEq for Slot<T> {
    fn eq(&self, other: &Self) -> bool { self.index == other.index }
}
impl<T> Eq for Slot<T> {}
impl<T> PartialOrd for Slot<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}
impl<T> Ord for Slot<T> {
    fn cmp(&self, other: &Self) -> Ordering { self.index.cmp(&other.index) }
}

struct Inner<T> {
    next: usize,
    slots: BinaryHeap<Reverse<Slot<T>>>,
    cancelled: bool,
}

/// Bounded priority queue that releases items strictly in ascending index
/// order to a single consumer.
///
/// Producers block while their index is more than `capacity` ahead of the
/// next expected one; the consumer blocks until the next expected index
/// arrives. [`cancel`](Self::cancel) wakes everyone up.
pub(crate) struct ReorderingQueue<T> {
    inner: Mutex<Inner<T>>,
    item_ready: Condvar,
    space_ready: Condvar,
    capacity: usize,
}

impl<T> ReorderingQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner { next: 0, slots: BinaryHeap::new(), cancelled: false }),
            item_ready: Condvar::new(),
            space_ready: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Inserts the item with the given index; blocks under backpressure.
    /// Returns `false` if the queue was cancelled.
    pub fn put(&self, index: usize, item: T) -> bool {
        let mut inner = self.inner.lock().expect("reordering queue poisoned");
        while !inner.cancelled && index >= inner.next + self.capacity {
            inner = self.space_ready.wait(inner).expect("reordering queue poisoned");
        }
        if inner.cancelled { return false; }
        let was_expected = index == inner.next;
        inner.slots.push(Reverse(Slot { index, item }));
        drop(inner);
        if was_expected { self.item_ready.notify_all(); }
        true
    }

    /// Removes and returns the item with the next expected index;
    /// blocks until it arrives. Returns [`None`] if the queue was cancelled.
    pub fn take(&self) -> Option<T> {
        let mut inner = self.inner.lock().expect("reordering queue poisoned");
        loop {
            if inner.cancelled { return None; }
            if inner.slots.peek().map_or(false, |s| s.0.index == inner.next) {
                let slot = inner.slots.pop().expect("peeked").0;
                inner.next += 1;
                drop(inner);
                self.space_ready.notify_all();
                return Some(slot.item);
            }
            inner = self.item_ready.wait(inner).expect("reordering queue poisoned");
        }
    }

    /// Wakes all blocked producers and the consumer; subsequent operations fail fast.
    pub fn cancel(&self) {
        self.inner.lock().expect("reordering queue poisoned").cancelled = true;
        self.item_ready.notify_all();
        self.space_ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn releases_in_order() {
        let q = ReorderingQueue::new(64);
        let taken = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for shard in 0..4usize {
                let q = &q;
                s.spawn(move || {
                    for i in (0..100).filter(|i| i % 4 == shard) {
                        assert!(q.put(i, i * 10));
                    }
                });
            }
            for i in 0..100 {
                assert_eq!(q.take(), Some(i * 10));
                taken.fetch_add(1, Ordering::Relaxed);
            }
        });
        assert_eq!(taken.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn backpressure_bounds_lead() {
        let q = ReorderingQueue::new(2);
        std::thread::scope(|s| {
            let q = &q;
            s.spawn(move || {
                // index 2 is two ahead of next=0: must wait until 0 is taken
                assert!(q.put(2, 2));
                assert!(q.put(1, 1));
            });
            std::thread::sleep(std::time::Duration::from_millis(20));
            assert!(q.put(0, 0));
            assert_eq!(q.take(), Some(0));
            assert_eq!(q.take(), Some(1));
            assert_eq!(q.take(), Some(2));
        });
    }

    #[test]
    fn cancel_unblocks() {
        let q = ReorderingQueue::<u32>::new(1);
        std::thread::scope(|s| {
            let q = &q;
            let taker = s.spawn(move || q.take());
            std::thread::sleep(std::time::Duration::from_millis(20));
            q.cancel();
            assert_eq!(taker.join().expect("no panic"), None);
            assert!(!q.put(0, 7));
        });
    }
}
