// Frame-slot based deletion queue
//
// Released GPU objects are never destroyed immediately. A deleter
// lands in the queue slot of the frame that released it and only
// runs once the scheduler has waited on that slot's fence again,
// which happens render-ahead-count frames later.
use std::collections::VecDeque;

/// An erased destruction callback. It captures the raw handles it
/// destroys (plus a clone of the ash device) and runs exactly once.
/// Deleters must not call back into the resource caches.
pub type Deleter = Box<dyn FnOnce() + Send>;

pub struct DeletionQueue {
    /// One queue per frame in flight
    dq_slots: Vec<VecDeque<Deleter>>,
    /// The slot new deleters are recorded to
    dq_current: usize,
}

impl DeletionQueue {
    pub fn new(frames_in_flight: usize) -> Self {
        let mut slots = Vec::with_capacity(frames_in_flight);
        for _ in 0..frames_in_flight {
            slots.push(VecDeque::new());
        }
        Self {
            dq_slots: slots,
            dq_current: 0,
        }
    }

    /// Schedule a deleter on the current frame's slot
    pub fn push(&mut self, deleter: Deleter) {
        self.dq_slots[self.dq_current].push_back(deleter);
    }

    /// Make `slot` the recording target and hand back everything
    /// that was deferred the last time this slot was current.
    ///
    /// The caller runs the returned deleters in FIFO order after
    /// releasing whatever lock guards this queue.
    pub fn begin_slot(&mut self, slot: usize) -> VecDeque<Deleter> {
        self.dq_current = slot;
        std::mem::take(&mut self.dq_slots[slot])
    }

    /// Drain every slot, oldest frames first. Only valid once the
    /// device is idle, at shutdown.
    pub fn drain_all(&mut self) -> VecDeque<Deleter> {
        let mut all = VecDeque::new();
        let count = self.dq_slots.len();
        for i in 0..count {
            let slot = (self.dq_current + 1 + i) % count;
            all.append(&mut self.dq_slots[slot]);
        }
        return all;
    }

    pub fn current_slot(&self) -> usize {
        self.dq_current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn run_all(mut deleters: VecDeque<Deleter>) {
        while let Some(d) = deleters.pop_front() {
            d();
        }
    }

    #[test]
    fn deferred_by_frame_count() {
        // renderAhead = 2: a deleter pushed while slot k is current
        // must not run until slot k comes around again
        let mut queue = DeletionQueue::new(2);
        let ran = Arc::new(AtomicUsize::new(0));

        run_all(queue.begin_slot(0));
        let r = ran.clone();
        queue.push(Box::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }));

        run_all(queue.begin_slot(1));
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        // Slot 0 is reused, its fence has been waited on again
        run_all(queue.begin_slot(0));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fifo_within_a_slot() {
        let mut queue = DeletionQueue::new(1);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        run_all(queue.begin_slot(0));
        for i in 0..4 {
            let o = order.clone();
            queue.push(Box::new(move || o.lock().unwrap().push(i)));
        }
        run_all(queue.begin_slot(0));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn drain_all_empties_every_slot() {
        let mut queue = DeletionQueue::new(3);
        let ran = Arc::new(AtomicUsize::new(0));
        for slot in 0..3 {
            run_all(queue.begin_slot(slot));
            let r = ran.clone();
            queue.push(Box::new(move || {
                r.fetch_add(1, Ordering::SeqCst);
            }));
        }
        run_all(queue.drain_all());
        assert_eq!(ran.load(Ordering::SeqCst), 3);
    }
}
