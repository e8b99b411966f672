// A thread pool for short blocking tasks
//
// Each worker parks on its own pooled event. Submission hands the
// work directly to a free worker when one exists, otherwise it
// lands in a queue that busy workers drain before going back to
// sleep. Cancellation is not supported: once started, work always
// runs to completion. Shutdown aborts work that never started.
use crate::event::Event;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

pub trait QueuedWork: Send {
    fn do_work(self: Box<Self>);
    /// Called instead of do_work when the pool shuts down before
    /// this work was ever started
    fn abort(self: Box<Self>) {}
}

struct WorkerContext {
    has_work_event: Arc<Event>,
    /// The direct-handoff slot, filled by submit_work when this
    /// worker is on the free list
    work: Mutex<Option<Box<dyn QueuedWork>>>,
}

struct PoolState {
    free_list: Vec<usize>,
    work_queue: VecDeque<Box<dyn QueuedWork>>,
}

struct PoolShared {
    lock: Mutex<PoolState>,
    workers: Vec<WorkerContext>,
    shutting_down: AtomicBool,
}

pub struct ThreadPool {
    shared: Arc<PoolShared>,
    threads: Vec<JoinHandle<()>>,
}

fn worker_main(shared: Arc<PoolShared>, index: usize) {
    let context = &shared.workers[index];
    loop {
        context.has_work_event.wait();
        let mut work = context.work.lock().unwrap().take();
        if work.is_none() {
            // shutdown wakeup
            return;
        }
        loop {
            work.take().unwrap().do_work();
            let mut state = shared.lock.lock().unwrap();
            match state.work_queue.pop_front() {
                Some(next) => work = Some(next),
                None => {
                    if shared.shutting_down.load(Ordering::Acquire) {
                        return;
                    }
                    state.free_list.push(index);
                    break;
                }
            }
        }
    }
}

impl ThreadPool {
    pub fn new(num_threads: usize) -> Self {
        assert!(num_threads > 0);
        let mut workers = Vec::with_capacity(num_threads);
        for _ in 0..num_threads {
            workers.push(WorkerContext {
                has_work_event: Event::get(false),
                work: Mutex::new(None),
            });
        }
        let shared = Arc::new(PoolShared {
            lock: Mutex::new(PoolState {
                free_list: (0..num_threads).collect(),
                work_queue: VecDeque::new(),
            }),
            workers: workers,
            shutting_down: AtomicBool::new(false),
        });

        let mut threads = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let shared_clone = shared.clone();
            threads.push(std::thread::spawn(move || worker_main(shared_clone, i)));
        }

        Self {
            shared: shared,
            threads: threads,
        }
    }

    pub fn free_thread_count(&self) -> usize {
        self.shared.lock.lock().unwrap().free_list.len()
    }

    pub fn submit_work(&self, work: Box<dyn QueuedWork>) {
        let mut state = self.shared.lock.lock().unwrap();
        if let Some(index) = state.free_list.pop() {
            let context = &self.shared.workers[index];
            *context.work.lock().unwrap() = Some(work);
            context.has_work_event.set();
        } else {
            state.work_queue.push_back(work);
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shared.shutting_down.store(true, Ordering::Release);
        {
            let mut state = self.shared.lock.lock().unwrap();
            for work in state.work_queue.drain(..) {
                work.abort();
            }
        }
        for context in self.shared.workers.iter() {
            context.has_work_event.set();
        }
        for thread in self.threads.drain(..) {
            thread.join().expect("Pooled thread panicked");
        }
        for context in self.shared.workers.iter() {
            Event::release(context.has_work_event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountWork {
        counter: Arc<AtomicUsize>,
        done: Arc<Event>,
    }

    impl QueuedWork for CountWork {
        fn do_work(self: Box<Self>) {
            self.counter.fetch_add(1, Ordering::SeqCst);
            self.done.set();
        }
    }

    #[test]
    fn runs_submitted_work() {
        let pool = ThreadPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(Event::new(false));
        for _ in 0..8 {
            pool.submit_work(Box::new(CountWork {
                counter: counter.clone(),
                done: done.clone(),
            }));
        }
        for _ in 0..8 {
            done.wait();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn workers_return_to_free_list() {
        let pool = ThreadPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(Event::new(false));
        pool.submit_work(Box::new(CountWork {
            counter: counter.clone(),
            done: done.clone(),
        }));
        done.wait();
        // Give the worker a moment to park itself again
        for _ in 0..100 {
            if pool.free_thread_count() == 2 {
                break;
            }
            std::thread::yield_now();
        }
        assert_eq!(pool.free_thread_count(), 2);
    }

    struct AbortWork {
        aborted: Arc<AtomicUsize>,
    }

    impl QueuedWork for AbortWork {
        fn do_work(self: Box<Self>) {
            panic!("queued work should have been aborted");
        }
        fn abort(self: Box<Self>) {
            self.aborted.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct BlockWork {
        started: Arc<Event>,
        gate: Arc<Event>,
    }

    impl QueuedWork for BlockWork {
        fn do_work(self: Box<Self>) {
            self.started.set();
            self.gate.wait();
        }
    }

    #[test]
    fn shutdown_aborts_queued_work() {
        let pool = ThreadPool::new(1);
        let started = Arc::new(Event::new(true));
        let gate = Arc::new(Event::new(true));
        let aborted = Arc::new(AtomicUsize::new(0));
        pool.submit_work(Box::new(BlockWork {
            started: started.clone(),
            gate: gate.clone(),
        }));
        started.wait();
        // The single worker is blocked, so this lands in the queue
        pool.submit_work(Box::new(AbortWork {
            aborted: aborted.clone(),
        }));

        // Shut down from another thread. The queued work is aborted
        // before the join, while the worker is still blocked.
        let shutdown = std::thread::spawn(move || drop(pool));
        while aborted.load(Ordering::SeqCst) == 0 {
            std::thread::yield_now();
        }
        gate.set();
        shutdown.join().unwrap();
        assert_eq!(aborted.load(Ordering::SeqCst), 1);
    }
}
