//! Drives one OS thread: poll for readiness, dispatch active channels, run
//! queued cross-thread tasks.
//!
//! Grounded on `original_source/EventLoop.cc` for the control flow
//! (`Loop`/`quit`/`runInLoop`/`queueInLoop`/`doPendingFunctors`) and on
//! `examples/tokio-rs-mio/src/sys/unix/waker/eventfd.rs` for the wakeup
//! descriptor (including its `WouldBlock` → reset-and-retry fallback,
//! which the original's plain 8-byte write undersells).

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::ThreadId;
use std::time::Duration;

use log::{error, info, warn};

use crate::acceptor::Acceptor;
use crate::connection::Connection;
use crate::current_thread;
use crate::macros::syscall;
use crate::selector::{ActiveEvent, Selector};
use crate::Timestamp;

/// Default poll timeout (spec.md §4.3); a loop otherwise sleeps for this
/// long with nothing to do.
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// A task submitted to a loop from (possibly) another thread. Must be
/// `Send` since the submitting thread and the owning thread may differ.
pub type LoopTask = Box<dyn FnOnce() + Send>;

thread_local! {
    static HAS_LOOP: Cell<bool> = const { Cell::new(false) };
}

/// Logs at `error!` and aborts the process, matching the original's
/// `LOG_FATAL` (which always calls `abort()` regardless of build mode).
macro_rules! fatal {
    ($($arg:tt)*) => {{
        error!($($arg)*);
        std::process::abort();
    }};
}

/// What a registered fd belongs to, for dispatch. A closed three-variant
/// enum rather than a trait-object registry: this core only ever has three
/// kinds of channel owner (see DESIGN.md "registry shape").
enum Registration {
    Wakeup,
    Acceptor(Arc<Acceptor>),
    Connection(Weak<Connection>),
}

/// Drives one thread's worth of readiness multiplexing and task execution.
///
/// `EventLoop` is shared across threads as `Arc<EventLoop>` so that
/// `run_in_loop`/`queue_in_loop`/`quit` can be called from outside the
/// owning thread, per spec.md §5. It is not `Sync` by auto-trait derivation
/// — most of its state (`active_channels` conceptually, the channel
/// registry, the selector, `looping`) is touched only by the owning
/// thread, which is asserted at runtime by every method that requires it.
/// The handful of fields genuinely touched cross-thread (`quit`,
/// `calling_pending`, `pending_tasks`) use atomics or a mutex. See
/// DESIGN.md for the full accounting behind the `unsafe impl` below.
pub struct EventLoop {
    thread_id: ThreadId,
    looping: Cell<bool>,
    quit: AtomicBool,
    calling_pending: AtomicBool,
    pending_tasks: Mutex<Vec<LoopTask>>,
    wakeup_fd: RawFd,
    wakeup_channel: crate::Channel,
    selector: Selector,
    registry: RefCell<HashMap<RawFd, Registration>>,
}

// SAFETY: every field is either immutable after construction (`thread_id`,
// `wakeup_fd`), synchronized (`quit`, `calling_pending` are atomics;
// `pending_tasks` is a `Mutex`), or mutated only by the owning thread with
// that requirement enforced at runtime via `assert_in_loop_thread` (the
// channel registry, the selector, `looping`, and the embedded
// `wakeup_channel`'s `Cell`/`RefCell` fields — nothing outside this module
// reaches those except through a method that asserts first).
unsafe impl Send for EventLoop {}
unsafe impl Sync for EventLoop {}

impl EventLoop {
    /// Builds a loop for the calling thread. Aborts the process (after
    /// logging) if another loop already exists on this thread, or if the
    /// selector or wakeup descriptor can't be created — all three are the
    /// "fatal configuration" errors spec.md §7 calls out as non-recoverable.
    pub fn new() -> EventLoop {
        HAS_LOOP.with(|has| {
            if has.get() {
                fatal!(
                    "another EventLoop already exists on thread {:?}",
                    current_thread::id()
                );
            }
        });

        let selector = Selector::new().unwrap_or_else(|err| {
            fatal!("poller creation failed: {err}");
        });

        let wakeup_fd = syscall!(eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC))
            .unwrap_or_else(|err| {
                fatal!("eventfd creation failed: {err}");
            });

        let wakeup_channel = crate::Channel::new(wakeup_fd);
        wakeup_channel.set_read_callback(move |_time| {
            if let Err(err) = drain_wakeup(wakeup_fd) {
                warn!("EventLoop wakeup drain failed: {err}");
            }
        });
        wakeup_channel.enable_reading();
        selector
            .update(&wakeup_channel)
            .unwrap_or_else(|err| fatal!("failed to register wakeup channel: {err}"));

        let mut registry = HashMap::new();
        registry.insert(wakeup_fd, Registration::Wakeup);

        HAS_LOOP.with(|has| has.set(true));

        let thread_id = current_thread::id();
        info!("EventLoop created on thread {:?}", thread_id);

        EventLoop {
            thread_id,
            looping: Cell::new(false),
            quit: AtomicBool::new(false),
            calling_pending: AtomicBool::new(false),
            pending_tasks: Mutex::new(Vec::new()),
            wakeup_fd,
            wakeup_channel,
            selector,
            registry: RefCell::new(registry),
        }
    }

    /// `true` iff the calling thread is this loop's owning thread.
    pub fn in_loop_thread(&self) -> bool {
        current_thread::id() == self.thread_id
    }

    /// Aborts (after logging) if the calling thread is not this loop's
    /// owning thread. Used to guard every method spec.md §5 confines to
    /// the owning thread.
    pub fn assert_in_loop_thread(&self) {
        if !self.in_loop_thread() {
            fatal!(
                "EventLoop used from thread {:?}, but it belongs to thread {:?}",
                current_thread::id(),
                self.thread_id
            );
        }
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.in_loop_thread()
    }

    /// Runs this loop's main cycle until [`EventLoop::quit`]. Blocks the
    /// calling thread for as long as the loop runs.
    pub fn run(&self) {
        self.assert_in_loop_thread();
        self.looping.set(true);
        self.quit.store(false, Ordering::Relaxed);
        info!("EventLoop on thread {:?} start looping", self.thread_id);

        let mut active: Vec<ActiveEvent> = Vec::new();
        while !self.quit.load(Ordering::Relaxed) {
            let receive_time = self.selector.select(POLL_TIMEOUT, &mut active);
            for event in &active {
                self.dispatch(event, receive_time);
            }
            self.do_pending_tasks();
        }

        info!("EventLoop on thread {:?} stop looping", self.thread_id);
        self.looping.set(false);
    }

    fn dispatch(&self, event: &ActiveEvent, receive_time: Timestamp) {
        let target = match self.registry.borrow().get(&event.fd()) {
            Some(Registration::Wakeup) => None,
            Some(Registration::Acceptor(acceptor)) => {
                acceptor.channel().set_revents(event.revents());
                acceptor.channel().handle(receive_time);
                return;
            }
            Some(Registration::Connection(weak)) => Some(weak.clone()),
            None => {
                warn!("no channel registered for fd {}", event.fd());
                return;
            }
        };

        match target {
            None => {
                self.wakeup_channel.set_revents(event.revents());
                self.wakeup_channel.handle(receive_time);
            }
            Some(weak) => {
                if let Some(conn) = weak.upgrade() {
                    conn.channel().set_revents(event.revents());
                    conn.channel().handle(receive_time);
                }
            }
        }
    }

    fn do_pending_tasks(&self) {
        self.calling_pending.store(true, Ordering::Relaxed);

        let tasks = {
            let mut guard = self.pending_tasks.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            task();
        }

        self.calling_pending.store(false, Ordering::Relaxed);
    }

    /// Sets the quit flag; wakes the loop if it's blocked in `poll` on
    /// another thread. The loop exits after finishing its current
    /// iteration (spec.md §4.3).
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Relaxed);
        if !self.in_loop_thread() {
            self.wakeup();
        }
    }

    /// Executes `task` inline if called from the owning thread; otherwise
    /// hands it to [`EventLoop::queue_in_loop`].
    pub fn run_in_loop(&self, task: LoopTask) {
        if self.in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Appends `task` to the pending-task list and wakes the loop if
    /// either the caller isn't the owning thread, or the owning thread is
    /// itself currently mid-`do_pending_tasks` (so this iteration's swap
    /// has already happened and only a wakeup forces the next one). The
    /// "wake only if not-owner" simplification is deliberately rejected —
    /// spec.md §9 calls it out as incorrect for the second case.
    pub fn queue_in_loop(&self, task: LoopTask) {
        self.pending_tasks.lock().unwrap().push(task);
        if !self.in_loop_thread() || self.calling_pending.load(Ordering::Relaxed) {
            self.wakeup();
        }
    }

    fn wakeup(&self) {
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        match write_wakeup(self.wakeup_fd, &buf) {
            Ok(_) => {}
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                if let Err(err) = drain_wakeup(self.wakeup_fd) {
                    warn!("EventLoop wakeup reset failed: {err}");
                }
                if let Err(err) = write_wakeup(self.wakeup_fd, &buf) {
                    warn!("EventLoop wakeup retry failed: {err}");
                }
            }
            Err(err) => warn!("EventLoop::wakeup write failed: {err}"),
        }
    }

    /// Registers `channel`'s interest mask with the demultiplexer. Must be
    /// called on the owning thread.
    pub fn update_channel(&self, channel: &crate::Channel) {
        self.assert_in_loop_thread();
        if let Err(err) = self.selector.update(channel) {
            warn!("update_channel failed for fd {}: {err}", channel.fd());
        }
    }

    /// Deregisters `channel` from the demultiplexer and the dispatch
    /// registry. Must be called on the owning thread.
    pub fn remove_channel(&self, channel: &crate::Channel) {
        self.assert_in_loop_thread();
        if let Err(err) = self.selector.remove(channel) {
            warn!("remove_channel failed for fd {}: {err}", channel.fd());
        }
        self.registry.borrow_mut().remove(&channel.fd());
    }

    /// `true` iff `channel` is currently registered with the demultiplexer.
    /// Must be called on the owning thread.
    pub fn has_channel(&self, channel: &crate::Channel) -> bool {
        self.assert_in_loop_thread();
        self.selector.contains(channel.fd())
    }

    /// Associates `fd` with an `Acceptor` in the dispatch registry. Called
    /// once, from the base loop, when the `Acceptor`'s listen channel is
    /// first enabled.
    pub(crate) fn register_acceptor(&self, fd: RawFd, acceptor: Arc<Acceptor>) {
        self.assert_in_loop_thread();
        self.registry.borrow_mut().insert(fd, Registration::Acceptor(acceptor));
    }

    /// Associates `fd` with a `Connection` in the dispatch registry.
    /// Called once, from the owning worker loop, when the connection is
    /// established.
    pub(crate) fn register_connection(&self, fd: RawFd, connection: Weak<Connection>) {
        self.assert_in_loop_thread();
        self.registry
            .borrow_mut()
            .insert(fd, Registration::Connection(connection));
    }
}

impl Default for EventLoop {
    fn default() -> EventLoop {
        EventLoop::new()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.wakeup_channel.disable_all();
        let _ = self.selector.remove(&self.wakeup_channel);
        unsafe {
            libc::close(self.wakeup_fd);
        }
        HAS_LOOP.with(|has| has.set(false));
    }
}

fn drain_wakeup(fd: RawFd) -> io::Result<()> {
    let mut buf = [0u8; 8];
    syscall!(read(fd, buf.as_mut_ptr() as *mut libc::c_void, 8)).map(|_| ())
}

fn write_wakeup(fd: RawFd, buf: &[u8; 8]) -> io::Result<()> {
    syscall!(write(fd, buf.as_ptr() as *const libc::c_void, buf.len())).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn new_loop_runs_and_quits_from_same_thread() {
        let event_loop = EventLoop::new();
        event_loop.quit();
        event_loop.run();
    }

    /// An `EventLoop`'s owning thread is fixed at construction (spec.md
    /// §4.3: "constructor fails fatally if another loop already exists on
    /// this thread" implies the thread that builds the loop is the thread
    /// that must later call `run()`). So a cross-thread test spawns the
    /// loop *inside* the worker thread and hands the `Arc<EventLoop>` back
    /// over a channel, the same handoff `EventLoopThread` performs for
    /// real.
    fn spawn_running_loop() -> (Arc<EventLoop>, std::thread::JoinHandle<()>) {
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = std::thread::spawn(move || {
            let event_loop = Arc::new(EventLoop::new());
            tx.send(event_loop.clone()).unwrap();
            event_loop.run();
        });
        (rx.recv().unwrap(), handle)
    }

    #[test]
    fn quit_from_another_thread_unblocks_poll() {
        let (event_loop, handle) = spawn_running_loop();
        std::thread::sleep(Duration::from_millis(20));
        event_loop.quit();
        handle.join().unwrap();
    }

    #[test]
    fn run_in_loop_executes_inline_on_owner_thread() {
        let event_loop = EventLoop::new();
        let ran = std::sync::Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        event_loop.run_in_loop(Box::new(move || {
            ran2.store(true, Ordering::SeqCst);
        }));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn cross_thread_submit_runs_in_submission_order() {
        let (event_loop, handle) = spawn_running_loop();

        let (tx, rx) = std::sync::mpsc::channel::<usize>();
        for i in 0..1000usize {
            let tx = tx.clone();
            event_loop.queue_in_loop(Box::new(move || {
                tx.send(i).unwrap();
            }));
        }
        drop(tx);

        let received: Vec<usize> = rx.iter().collect();
        assert_eq!(received, (0..1000).collect::<Vec<_>>());

        event_loop.quit();
        handle.join().unwrap();
    }
}
