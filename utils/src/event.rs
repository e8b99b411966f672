// Pooled wait events
//
// Events are the one blocking primitive the thread pool and the
// task system are allowed to sleep on. Creating one costs a heap
// allocation, so released events are parked in a pair of lock-free
// LIFO reservoirs and handed back out by Event::get.
use crate::list::LockFreeList;
use std::sync::{Arc, Condvar, Mutex};

lazy_static::lazy_static! {
    static ref MANUAL_RESET_LIST: LockFreeList<Arc<Event>> = LockFreeList::new();
    static ref AUTO_RESET_LIST: LockFreeList<Arc<Event>> = LockFreeList::new();
}

pub struct Event {
    signaled: Mutex<bool>,
    cond: Condvar,
    manual_reset: bool,
}

impl Event {
    /// Take an event from the pool, or create one if the pool is dry.
    ///
    /// The returned event is always in the unsignaled state.
    pub fn get(manual_reset: bool) -> Arc<Event> {
        let list = match manual_reset {
            true => &*MANUAL_RESET_LIST,
            false => &*AUTO_RESET_LIST,
        };
        if let Some(event) = list.pop() {
            event.reset();
            return event;
        }
        Arc::new(Event::new(manual_reset))
    }

    /// Return an event to the pool for reuse
    pub fn release(event: Arc<Event>) {
        let list = match event.manual_reset {
            true => &*MANUAL_RESET_LIST,
            false => &*AUTO_RESET_LIST,
        };
        list.push(event);
    }

    pub fn new(manual_reset: bool) -> Self {
        Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
            manual_reset: manual_reset,
        }
    }

    pub fn is_manual_reset(&self) -> bool {
        self.manual_reset
    }

    /// Block until the event is signaled.
    ///
    /// An auto-reset event consumes the signal on the way out,
    /// releasing exactly one waiter per set().
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        while !*signaled {
            signaled = self.cond.wait(signaled).unwrap();
        }
        if !self.manual_reset {
            *signaled = false;
        }
    }

    pub fn set(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        *signaled = true;
        if self.manual_reset {
            self.cond.notify_all();
        } else {
            self.cond.notify_one();
        }
    }

    pub fn reset(&self) {
        *self.signaled.lock().unwrap() = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_reset_stays_signaled() {
        let ev = Event::new(true);
        ev.set();
        ev.wait();
        ev.wait(); // still signaled
        ev.reset();
        assert!(!*ev.signaled.lock().unwrap());
    }

    #[test]
    fn auto_reset_consumes_signal() {
        let ev = Event::new(false);
        ev.set();
        ev.wait();
        assert!(!*ev.signaled.lock().unwrap());
    }

    #[test]
    fn wakes_waiter() {
        let ev = Arc::new(Event::new(true));
        let e = ev.clone();
        let waiter = std::thread::spawn(move || e.wait());
        ev.set();
        waiter.join().unwrap();
    }

    #[test]
    fn pool_recycles() {
        let ev = Event::get(true);
        ev.set();
        Event::release(ev);
        // The pooled event must come back unsignaled
        let ev = Event::get(true);
        assert!(!*ev.signaled.lock().unwrap());
        Event::release(ev);
    }
}
