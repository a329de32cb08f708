//! A fixed pool of worker loops, each pinned to its own spawned thread, and
//! the base-loop-only round-robin index that hands them out.
//!
//! Grounded on `original_source/EventLoopThread.h`/`.cc` for the
//! condvar-gated handoff of a freshly constructed `EventLoop` back to the
//! spawning thread, and `original_source/EventLoopThreadPool.h`/`.cc` for
//! `start`/`getNextLoop`/`getAllLoops` and the `N = 0` base-loop fallback.

use std::cell::{Cell, RefCell};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use log::info;

use crate::event_loop::EventLoop;

type ThreadInitCallback = Arc<dyn Fn(&Arc<EventLoop>) + Send + Sync>;

/// Owns one spawned thread running a freshly constructed `EventLoop`.
/// `start` blocks the calling thread until that loop is observable (spec.md
/// §4.6), so `WorkerPool::start` can hand back fully-formed `Arc<EventLoop>`
/// handles to its caller.
struct EventLoopThread {
    handle: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    fn start(name: String, init_cb: ThreadInitCallback) -> (EventLoopThread, Arc<EventLoop>) {
        let slot: Arc<Mutex<Option<Arc<EventLoop>>>> = Arc::new(Mutex::new(None));
        let ready = Arc::new(Condvar::new());

        let slot_thread = slot.clone();
        let ready_thread = ready.clone();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let event_loop = Arc::new(EventLoop::new());
                {
                    let mut guard = slot_thread.lock().unwrap();
                    *guard = Some(event_loop.clone());
                    ready_thread.notify_one();
                }
                init_cb(&event_loop);
                event_loop.run();
            })
            .unwrap_or_else(|err| panic!("failed to spawn worker thread {name}: {err}"));

        let event_loop = {
            let mut guard = slot.lock().unwrap();
            while guard.is_none() {
                guard = ready.wait(guard).unwrap();
            }
            guard.take().unwrap()
        };

        (
            EventLoopThread {
                handle: Some(handle),
            },
            event_loop,
        )
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Holds N worker loops, each on its own thread, and hands them out
/// round-robin. `N = 0` degrades to running everything on the base loop
/// (spec.md §4.6) — used by single-threaded servers that don't want a
/// separate I/O thread at all.
///
/// Like `Acceptor`, `WorkerPool` is confined to the base loop's thread: its
/// round-robin index and thread list are mutated only there (spec.md §4.6,
/// "All access to the round-robin index occurs on the base loop").
pub struct WorkerPool {
    base_loop: Arc<EventLoop>,
    name: String,
    started: Cell<bool>,
    num_threads: Cell<usize>,
    threads: RefCell<Vec<EventLoopThread>>,
    loops: RefCell<Vec<Arc<EventLoop>>>,
    next: Cell<usize>,
}

impl WorkerPool {
    pub fn new(base_loop: Arc<EventLoop>, name: impl Into<String>) -> WorkerPool {
        WorkerPool {
            base_loop,
            name: name.into(),
            started: Cell::new(false),
            num_threads: Cell::new(0),
            threads: RefCell::new(Vec::new()),
            loops: RefCell::new(Vec::new()),
            next: Cell::new(0),
        }
    }

    /// Selects the worker count. `0` (the default) means every connection
    /// runs on the base loop. Has no effect once [`WorkerPool::start`] has
    /// already run.
    pub fn set_thread_num(&self, n: usize) {
        self.num_threads.set(n);
    }

    pub fn thread_num(&self) -> usize {
        self.num_threads.get()
    }

    pub fn started(&self) -> bool {
        self.started.get()
    }

    /// Spawns `N` worker threads, each running `init_cb(loop)` once before
    /// entering its `EventLoop::run`. If `N == 0`, runs `init_cb` against
    /// the base loop directly instead, matching the original's behavior of
    /// treating the base loop as the sole worker in that configuration.
    pub fn start(&self, init_cb: impl Fn(&Arc<EventLoop>) + Send + Sync + 'static) {
        self.base_loop.assert_in_loop_thread();
        self.started.set(true);

        let init_cb: ThreadInitCallback = Arc::new(init_cb);
        let n = self.num_threads.get();

        for i in 0..n {
            let thread_name = format!("{}-{}", self.name, i);
            info!("WorkerPool [{}] spawning worker thread {i}", self.name);
            let (thread, loop_) = EventLoopThread::start(thread_name, init_cb.clone());
            self.threads.borrow_mut().push(thread);
            self.loops.borrow_mut().push(loop_);
        }

        if n == 0 {
            init_cb(&self.base_loop);
        }
    }

    /// Returns the next loop in round-robin order, or the base loop if no
    /// worker threads were started.
    pub fn next_loop(&self) -> Arc<EventLoop> {
        self.base_loop.assert_in_loop_thread();
        let loops = self.loops.borrow();
        if loops.is_empty() {
            return self.base_loop.clone();
        }
        let idx = self.next.get();
        let chosen = loops[idx % loops.len()].clone();
        self.next.set((idx + 1) % loops.len());
        chosen
    }

    /// All worker loops, or `[base_loop]` if `N == 0`.
    pub fn loops(&self) -> Vec<Arc<EventLoop>> {
        let loops = self.loops.borrow();
        if loops.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            loops.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn zero_threads_runs_init_cb_against_base_loop() {
        let base_loop = Arc::new(EventLoop::new());
        let pool = WorkerPool::new(base_loop.clone(), "pool");
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let expected = base_loop.clone();
        pool.start(move |loop_: &Arc<EventLoop>| {
            assert!(Arc::ptr_eq(loop_, &expected));
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&pool.next_loop(), &base_loop));
    }

    #[test]
    fn next_loop_cycles_round_robin_across_workers() {
        let base_loop = Arc::new(EventLoop::new());
        let pool = WorkerPool::new(base_loop, "pool");
        pool.set_thread_num(4);
        pool.start(|_loop_| {});

        let picks: Vec<usize> = (0..8)
            .map(|_| {
                let loop_ = pool.next_loop();
                pool.loops()
                    .iter()
                    .position(|l| Arc::ptr_eq(l, &loop_))
                    .unwrap()
            })
            .collect();

        assert_eq!(picks, vec![0, 1, 2, 3, 0, 1, 2, 3]);

        for loop_ in pool.loops() {
            loop_.quit();
        }
    }
}
