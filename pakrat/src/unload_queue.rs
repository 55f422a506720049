use std::cmp::Ordering;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// One scheduled destruction. `epoch` is a snapshot of the record's
/// generation at scheduling time; the sweep drops entries whose record has
/// moved on since (re-requested, or already destroyed another way).
pub(crate) struct QueuedUnload<K> {
    pub key: K,
    pub epoch: u64,
    pub destroy_at_ms: u64,
    seq: u64,
}

impl<K> PartialEq for QueuedUnload<K> {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        self.destroy_at_ms == other.destroy_at_ms && self.seq == other.seq
    }
}

impl<K> Eq for QueuedUnload<K> {}

impl<K> PartialOrd for QueuedUnload<K> {
    fn partial_cmp(
        &self,
        other: &Self,
    ) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for QueuedUnload<K> {
    fn cmp(
        &self,
        other: &Self,
    ) -> Ordering {
        // destroy time first, insertion order breaks ties
        self.destroy_at_ms
            .cmp(&other.destroy_at_ms)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Min-heap of scheduled destructions ordered by destroy time, FIFO within
/// one timestamp. Entries are never removed early; cancellation happens
/// lazily through the epoch check at pop time.
pub(crate) struct UnloadQueue<K> {
    heap: BinaryHeap<Reverse<QueuedUnload<K>>>,
    next_seq: u64,
}

impl<K> UnloadQueue<K> {
    pub fn new() -> Self {
        UnloadQueue {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn schedule(
        &mut self,
        key: K,
        epoch: u64,
        destroy_at_ms: u64,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(QueuedUnload {
            key,
            epoch,
            destroy_at_ms,
            seq,
        }));
    }

    /// Pops the earliest entry whose destroy time has elapsed.
    pub fn pop_due(
        &mut self,
        now_ms: u64,
    ) -> Option<QueuedUnload<K>> {
        match self.heap.peek() {
            Some(Reverse(entry)) if entry.destroy_at_ms <= now_ms => {}
            _ => return None,
        }
        self.heap.pop().map(|Reverse(entry)| entry)
    }

    /// Puts a popped entry back untouched. Used when a sweep meets a record
    /// it must not destroy yet; the entry comes due again on the next sweep.
    pub fn requeue(
        &mut self,
        entry: QueuedUnload<K>,
    ) {
        self.heap.push(Reverse(entry));
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
}
