// Futures and tasks on top of the thread pool
//
// A Future is a value slot plus a pooled manual-reset event. The
// producing side writes the value and signals; await blocks on the
// event and takes the value out.
use crate::event::Event;
use crate::pool::{QueuedWork, ThreadPool};
use std::sync::{Arc, Mutex};

pub struct Future<T> {
    event: Arc<Event>,
    value: Mutex<Option<T>>,
}

impl<T> Future<T> {
    pub fn new() -> Arc<Future<T>> {
        Arc::new(Future {
            event: Event::get(true),
            value: Mutex::new(None),
        })
    }

    pub fn set_value(&self, value: T) {
        *self.value.lock().unwrap() = Some(value);
        self.event.set();
    }

    /// Block until the value is produced and take it.
    ///
    /// The value can be taken exactly once.
    pub fn wait(&self) -> T {
        self.event.wait();
        self.value
            .lock()
            .unwrap()
            .take()
            .expect("Future value was already taken")
    }
}

impl<T> Drop for Future<T> {
    fn drop(&mut self) {
        Event::release(self.event.clone());
    }
}

/// The caller-side handle for work submitted with Async::run
pub struct Task<T> {
    future: Arc<Future<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            future: self.future.clone(),
        }
    }
}

impl<T> Task<T> {
    pub fn wait(self) -> T {
        self.future.wait()
    }
}

struct FutureWork<T, F> {
    future: Arc<Future<T>>,
    func: F,
}

impl<T, F> QueuedWork for FutureWork<T, F>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    fn do_work(self: Box<Self>) {
        let this = *self;
        this.future.set_value((this.func)());
    }
    // abort leaves the future unsignaled; a submitted task is
    // only abandoned at pool shutdown
}

lazy_static::lazy_static! {
    static ref POOL: Mutex<Option<ThreadPool>> = Mutex::new(None);
}

/// Static facade over the process-wide worker pool
pub struct Async;

impl Async {
    pub fn startup(num_threads: usize) {
        let threads = match num_threads {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            n => n,
        };
        *POOL.lock().unwrap() = Some(ThreadPool::new(threads));
    }

    pub fn shutdown() {
        *POOL.lock().unwrap() = None;
    }

    pub fn free_thread_count() -> usize {
        POOL.lock()
            .unwrap()
            .as_ref()
            .expect("Async was not started")
            .free_thread_count()
    }

    pub fn submit_work(work: Box<dyn QueuedWork>) {
        POOL.lock()
            .unwrap()
            .as_ref()
            .expect("Async was not started")
            .submit_work(work);
    }

    pub fn run<T, F>(func: F) -> Task<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let future = Future::new();
        Async::submit_work(Box::new(FutureWork {
            future: future.clone(),
            func: func,
        }));
        Task { future: future }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn future_hands_value_across_threads() {
        let future = Future::new();
        let f = future.clone();
        let producer = std::thread::spawn(move || f.set_value(7));
        assert_eq!(future.wait(), 7);
        producer.join().unwrap();
    }

    #[test]
    fn task_through_pool() {
        // A private pool so tests do not share Async state
        let pool = ThreadPool::new(2);
        let future = Future::new();
        pool.submit_work(Box::new(FutureWork {
            future: future.clone(),
            func: || 6 * 7,
        }));
        let task = Task { future: future };
        assert_eq!(task.wait(), 42);
    }
}
