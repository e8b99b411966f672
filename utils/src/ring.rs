// A resizable MPSC ring buffer
//
// Producers claim a slot by advancing the tail counter and flag it
// ready once the payload is written. The consumer walks the head
// counter. When a producer finds the buffer full, the capacity is
// doubled under the writer side of the resize lock and the live
// range [head, tail) is migrated contiguously; normal pushes and
// pops only share the reader side, so a resize can never
// interleave with an in-flight slot write.
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};
use std::sync::RwLock;

struct Slot<T> {
    ready: AtomicBool,
    value: UnsafeCell<MaybeUninit<T>>,
}

pub struct RingBuffer<T> {
    resize_lock: RwLock<()>,
    data: AtomicPtr<Slot<T>>,
    capacity: AtomicU32,
    head: AtomicU32,
    tail: AtomicU32,
}

unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

fn alloc_slots<T>(capacity: u32) -> *mut Slot<T> {
    let mut slots: Vec<Slot<T>> = Vec::with_capacity(capacity as usize);
    for _ in 0..capacity {
        slots.push(Slot {
            ready: AtomicBool::new(false),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        });
    }
    Box::into_raw(slots.into_boxed_slice()) as *mut Slot<T>
}

unsafe fn free_slots<T>(data: *mut Slot<T>, capacity: u32) {
    // Slot holds MaybeUninit so no T drops run here
    drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
        data,
        capacity as usize,
    )));
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: u32) -> Self {
        assert!(capacity > 1 && capacity.is_power_of_two());
        Self {
            resize_lock: RwLock::new(()),
            data: AtomicPtr::new(alloc_slots(capacity)),
            capacity: AtomicU32::new(capacity),
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity.load(Ordering::Acquire)
    }

    unsafe fn write_slot(&self, index: u32, elem: T) {
        let data = self.data.load(Ordering::Acquire);
        let slot = &*data.add(index as usize);
        slot.value.get().write(MaybeUninit::new(elem));
        slot.ready.store(true, Ordering::Release);
    }

    pub fn push(&self, elem: T) {
        loop {
            // Fast path: claim a ticket while the buffer has room
            {
                let _read = self.resize_lock.read().unwrap();
                let capacity = self.capacity.load(Ordering::Acquire);
                let mut tail = self.tail.load(Ordering::Acquire);
                loop {
                    let head = self.head.load(Ordering::Acquire);
                    if tail.wrapping_sub(head) >= capacity {
                        break; // full, take the resize path
                    }
                    match self.tail.compare_exchange_weak(
                        tail,
                        tail.wrapping_add(1),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            unsafe { self.write_slot(tail & (capacity - 1), elem) };
                            return;
                        }
                        Err(t) => tail = t,
                    }
                }
            }

            // Full: grow under the write lock. Holding it means no
            // claimed ticket is still being written.
            let _write = self.resize_lock.write().unwrap();
            let capacity = self.capacity.load(Ordering::Acquire);
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            if tail.wrapping_sub(head) < capacity {
                // Someone else grew it, or the consumer drained
                continue;
            }
            unsafe {
                self.grow(capacity);
                let tail = self.tail.fetch_add(1, Ordering::AcqRel);
                let mask = self.capacity.load(Ordering::Acquire) - 1;
                self.write_slot(tail & mask, elem);
            }
            return;
        }
    }

    /// Double the capacity and migrate the live range [head, tail)
    /// so it stays contiguous in counter order. Requires the write
    /// lock: every live slot has finished its write.
    unsafe fn grow(&self, capacity: u32) {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        let count = tail.wrapping_sub(head);
        let old = self.data.load(Ordering::Acquire);
        let new_capacity = capacity * 2;
        let new = alloc_slots::<T>(new_capacity);

        let head_idx = head & (capacity - 1);
        for i in 0..count {
            let src = &*old.add(((head.wrapping_add(i)) & (capacity - 1)) as usize);
            let dst = &*new.add((head_idx + i) as usize);
            std::ptr::copy_nonoverlapping(src.value.get(), dst.value.get(), 1);
            dst.ready
                .store(src.ready.load(Ordering::Acquire), Ordering::Release);
        }

        self.data.store(new, Ordering::Release);
        self.head.store(head_idx, Ordering::Release);
        self.tail.store(head_idx + count, Ordering::Release);
        self.capacity.store(new_capacity, Ordering::Release);
        free_slots(old, capacity);
    }

    /// Single consumer. Returns None when the buffer is empty or
    /// the head slot's producer has not finished writing yet.
    pub fn pop(&self) -> Option<T> {
        let _read = self.resize_lock.read().unwrap();
        let capacity = self.capacity.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let data = self.data.load(Ordering::Acquire);
        let slot = unsafe { &*data.add((head & (capacity - 1)) as usize) };
        if !slot.ready.load(Ordering::Acquire) {
            return None;
        }
        slot.ready.store(false, Ordering::Release);
        let value = unsafe { slot.value.get().read().assume_init() };
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }
}

impl<T> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
        unsafe {
            free_slots(
                self.data.load(Ordering::Acquire),
                self.capacity.load(Ordering::Acquire),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn fifo_order() {
        let ring = RingBuffer::new(8);
        for i in 0..6 {
            ring.push(i);
        }
        for i in 0..6 {
            assert_eq!(ring.pop(), Some(i));
        }
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn resize_preserves_live_range() {
        let ring = RingBuffer::new(2);
        ring.push(1);
        ring.push(2);
        ring.push(3); // full, grows to 4
        assert_eq!(ring.capacity(), 4);
        assert_eq!(ring.pop(), Some(1));
        assert_eq!(ring.pop(), Some(2));
        assert_eq!(ring.pop(), Some(3));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn resize_preserves_wrapped_range() {
        let ring = RingBuffer::new(4);
        for i in 0..4 {
            ring.push(i);
        }
        // Move the head past the start so the live range wraps
        assert_eq!(ring.pop(), Some(0));
        assert_eq!(ring.pop(), Some(1));
        for i in 4..9 {
            ring.push(i);
        }
        for i in 2..9 {
            assert_eq!(ring.pop(), Some(i));
        }
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn concurrent_push() {
        let ring = Arc::new(RingBuffer::new(2));
        let mut handles = Vec::new();
        for t in 0..3 {
            let r = ring.clone();
            handles.push(std::thread::spawn(move || r.push(t)));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(ring.capacity() >= 4);

        let mut popped = Vec::new();
        while let Some(v) = ring.pop() {
            popped.push(v);
        }
        popped.sort();
        assert_eq!(popped, vec![0, 1, 2]);
    }

    #[test]
    fn producers_and_consumer_interleaved() {
        let ring = Arc::new(RingBuffer::new(4));
        let mut producers = Vec::new();
        for t in 0..2i32 {
            let r = ring.clone();
            producers.push(std::thread::spawn(move || {
                for i in 0..512 {
                    r.push(t * 10000 + i);
                }
            }));
        }
        let mut popped = Vec::new();
        while popped.len() < 1024 {
            if let Some(v) = ring.pop() {
                popped.push(v);
            }
        }
        for p in producers {
            p.join().unwrap();
        }
        // Per-producer FIFO order survives the interleaving
        let a: Vec<i32> = popped.iter().copied().filter(|v| *v < 10000).collect();
        let b: Vec<i32> = popped.iter().copied().filter(|v| *v >= 10000).collect();
        assert!(a.windows(2).all(|w| w[0] < w[1]));
        assert!(b.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(a.len(), 512);
        assert_eq!(b.len(), 512);
    }
}
