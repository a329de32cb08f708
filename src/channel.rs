//! Binds a file descriptor to an interest mask and four event callbacks.
//!
//! Grounded on `original_source/Channel.h` / `Channel.cc`. A `Channel` does
//! not own its descriptor — the `Connection` or `Acceptor` that created it
//! does — and a `Channel` is itself always a field of its owner rather than
//! a separately shared object: only the owner (`Rc`/`Arc`-held elsewhere)
//! needs sharing, the binding of fd-to-callbacks underneath it doesn't.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};

use log::warn;

use crate::selector::Interest;
use crate::Timestamp;

/// Identifies a `Channel` inside a loop's active-channel set. Presently
/// just the underlying fd — see DESIGN.md "Token/key space" for why this
/// core doesn't introduce a separate generation-counted token.
pub type ChannelId = RawFd;

/// Where a `Channel` stands with respect to the demultiplexer's interest
/// set. Mirrors `original_source/EPollPoller.cc`'s `kNew`/`kAdded`/`kDeleted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    /// Never registered, or removed and not yet re-added.
    New,
    /// Registered with the kernel; the selector's index mirrors it.
    Added,
    /// Was registered, interest went empty, deregistered but kept around
    /// in case interest comes back.
    Deleted,
}

type ReadCallback = Box<dyn FnMut(Timestamp)>;
type EventCallback = Box<dyn FnMut()>;

#[derive(Default)]
struct Callbacks {
    read: RefCell<Option<ReadCallback>>,
    write: RefCell<Option<EventCallback>>,
    close: RefCell<Option<EventCallback>>,
    error: RefCell<Option<EventCallback>>,
}

/// The binding of one descriptor to interest + callbacks.
pub struct Channel {
    fd: RawFd,
    interest: Cell<Interest>,
    revents: Cell<Interest>,
    poll_state: Cell<PollState>,
    tie: RefCell<Option<Weak<dyn Any + Send + Sync>>>,
    tied: Cell<bool>,
    callbacks: Callbacks,
}

impl Channel {
    /// A channel over `fd` with no interest and no callbacks set yet.
    pub fn new(fd: RawFd) -> Channel {
        Channel {
            fd,
            interest: Cell::new(Interest::NONE),
            revents: Cell::new(Interest::NONE),
            poll_state: Cell::new(PollState::New),
            tie: RefCell::new(None),
            tied: Cell::new(false),
            callbacks: Callbacks::default(),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn id(&self) -> ChannelId {
        self.fd
    }

    pub fn interest(&self) -> Interest {
        self.interest.get()
    }

    pub fn poll_state(&self) -> PollState {
        self.poll_state.get()
    }

    pub(crate) fn set_poll_state(&self, state: PollState) {
        self.poll_state.set(state);
    }

    pub fn is_none_event(&self) -> bool {
        self.interest.get().is_empty()
    }

    pub fn is_reading(&self) -> bool {
        self.interest.get().is_readable()
    }

    pub fn is_writing(&self) -> bool {
        self.interest.get().is_writable()
    }

    /// Records the revents mask the demultiplexer observed for this fd in
    /// its last `select()` call; consumed by [`Channel::handle`].
    pub(crate) fn set_revents(&self, revents: Interest) {
        self.revents.set(revents);
    }

    pub fn set_read_callback(&self, cb: impl FnMut(Timestamp) + 'static) {
        *self.callbacks.read.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_write_callback(&self, cb: impl FnMut() + 'static) {
        *self.callbacks.write.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl FnMut() + 'static) {
        *self.callbacks.close.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_error_callback(&self, cb: impl FnMut() + 'static) {
        *self.callbacks.error.borrow_mut() = Some(Box::new(cb));
    }

    /// Ties this channel's lifetime check to `owner`. Before any handler
    /// runs, the weak reference must still upgrade, and the resulting
    /// strong reference is kept alive for the whole dispatch — so a
    /// callback that causes every *other* strong reference to `owner` to
    /// drop can't pull the rug out from under the rest of `handle()`.
    /// Used by `Connection::establish`.
    pub fn tie<T: Any + Send + Sync + 'static>(&self, owner: &Arc<T>) {
        let owner: Arc<dyn Any + Send + Sync> = owner.clone();
        *self.tie.borrow_mut() = Some(Arc::downgrade(&owner));
        self.tied.set(true);
    }

    /// Dispatches the cached revents in the fixed order spec.md §4.2
    /// mandates: hangup-without-read (terminal) -> error -> read/priority
    /// -> write. Close and error may coexist with read; every applicable
    /// callback fires.
    pub fn handle(&self, receive_time: Timestamp) {
        let _guard: Option<Arc<dyn Any + Send + Sync>> = if self.tied.get() {
            match self.tie.borrow().as_ref().and_then(Weak::upgrade) {
                Some(strong) => Some(strong),
                None => return,
            }
        } else {
            None
        };
        self.handle_with_guard(receive_time);
    }

    fn handle_with_guard(&self, receive_time: Timestamp) {
        let revents = self.revents.get();

        if revents.is_hangup() && !revents.is_readable() {
            self.fire_event(&self.callbacks.close);
            return;
        }
        if revents.is_error() {
            self.fire_event(&self.callbacks.error);
        }
        if revents.is_readable() || revents.is_priority() {
            if let Some(cb) = self.callbacks.read.borrow_mut().as_mut() {
                cb(receive_time);
            }
        }
        if revents.is_writable() {
            self.fire_event(&self.callbacks.write);
        }
    }

    fn fire_event(&self, slot: &RefCell<Option<EventCallback>>) {
        if let Some(cb) = slot.borrow_mut().as_mut() {
            cb();
        }
    }

    pub(crate) fn enable_reading(&self) {
        self.interest.set(self.interest.get().add(Interest::READABLE));
    }

    pub(crate) fn disable_reading(&self) {
        self.interest
            .set(self.interest.get().remove(Interest::READABLE));
    }

    pub(crate) fn enable_writing(&self) {
        self.interest.set(self.interest.get().add(Interest::WRITABLE));
    }

    pub(crate) fn disable_writing(&self) {
        self.interest
            .set(self.interest.get().remove(Interest::WRITABLE));
    }

    pub(crate) fn disable_all(&self) {
        self.interest.set(Interest::NONE);
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("interest", &self.interest.get())
            .field("poll_state", &self.poll_state.get())
            .finish()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.poll_state.get() == PollState::Added {
            warn!(
                "channel for fd {} dropped while still registered with a selector",
                self.fd
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc;

    #[test]
    fn dispatches_read_then_write_when_both_set() {
        let ch = Channel::new(-1);
        let order: Rc<StdRefCell<Vec<&'static str>>> = Rc::new(StdRefCell::new(Vec::new()));
        let o1 = order.clone();
        ch.set_read_callback(move |_t| o1.borrow_mut().push("read"));
        let o2 = order.clone();
        ch.set_write_callback(move || o2.borrow_mut().push("write"));
        ch.set_revents(Interest::READABLE.add(Interest::WRITABLE));
        ch.handle(Timestamp::now());
        assert_eq!(*order.borrow(), vec!["read", "write"]);
    }

    #[test]
    fn hangup_without_read_is_terminal() {
        let ch = Channel::new(-1);
        let fired: Rc<Cell<bool>> = Rc::new(Cell::new(false));
        let f1 = fired.clone();
        ch.set_close_callback(move || f1.set(true));
        let read_fired = Rc::new(Cell::new(false));
        let r1 = read_fired.clone();
        ch.set_read_callback(move |_t| r1.set(true));
        ch.set_revents(Interest::HANGUP);
        ch.handle(Timestamp::now());
        assert!(fired.get());
        assert!(!read_fired.get());
    }

    #[test]
    fn hangup_with_read_still_dispatches_read() {
        let ch = Channel::new(-1);
        let read_fired = Rc::new(Cell::new(false));
        let r1 = read_fired.clone();
        ch.set_read_callback(move |_t| r1.set(true));
        ch.set_revents(Interest::HANGUP.add(Interest::READABLE));
        ch.handle(Timestamp::now());
        assert!(read_fired.get());
    }

    #[test]
    fn empty_revents_is_a_noop() {
        let ch = Channel::new(-1);
        let fired = Rc::new(Cell::new(false));
        let f1 = fired.clone();
        ch.set_read_callback(move |_t| f1.set(true));
        ch.set_revents(Interest::NONE);
        ch.handle(Timestamp::now());
        assert!(!fired.get());
    }

    #[test]
    fn dead_tie_suppresses_dispatch() {
        let ch = Channel::new(-1);
        let fired = Rc::new(Cell::new(false));
        let f1 = fired.clone();
        ch.set_read_callback(move |_t| f1.set(true));
        {
            let owner = Arc::new(42u32);
            ch.tie(&owner);
        } // owner dropped, weak tie now dangles
        ch.set_revents(Interest::READABLE);
        ch.handle(Timestamp::now());
        assert!(!fired.get());
    }

    #[test]
    fn live_tie_allows_dispatch() {
        let ch = Channel::new(-1);
        let owner = Arc::new(42u32);
        ch.tie(&owner);
        let fired = Rc::new(Cell::new(false));
        let f1 = fired.clone();
        ch.set_read_callback(move |_t| f1.set(true));
        ch.set_revents(Interest::READABLE);
        ch.handle(Timestamp::now());
        assert!(fired.get());
    }
}
