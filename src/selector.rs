//! Wraps the OS readiness mechanism: block until one or more descriptors
//! are ready, and add/modify/remove interest sets.
//!
//! Grounded on `original_source/EPollPoller.cc`/`.h` for the NEW/ADDED/
//! DELETED state machine and on mio's `sys::unix::selector::{epoll,poll}`
//! (`examples/tokio-rs-mio/src/sys/unix/selector/epoll.rs` and
//! `poll.rs`) for how to wrap the two backends behind one Rust type. Unlike
//! mio's epoll backend this one is level-triggered (no `EPOLLET`): the
//! Connection/Channel model above it assumes a handler that doesn't fully
//! drain a ready descriptor will see the event again on the next `select`,
//! matching muduo exactly.

use std::cell::RefCell;
use std::collections::HashSet;
use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use log::{error, trace};

use crate::channel::{Channel, PollState};
use crate::macros::syscall;

const INITIAL_EVENT_CAPACITY: usize = 16;

/// A small `bitflags`-shaped macro, hand-rolled so the crate doesn't need
/// the `bitflags` dependency for five constants; the generated API
/// (`add`/`remove`/`contains`/`is_empty`) matches mio's own
/// `Interest`/`Ready` method names.
macro_rules! bitflags_like {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $repr:ty {
            $(const $variant:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name($repr);

        impl $name {
            $(pub const $variant: $name = $name($value);)*

            pub const fn add(self, other: $name) -> $name {
                $name(self.0 | other.0)
            }

            pub const fn remove(self, other: $name) -> $name {
                $name(self.0 & !other.0)
            }

            pub const fn contains(self, other: $name) -> bool {
                (self.0 & other.0) == other.0 && other.0 != 0
            }

            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }
        }
    };
}

bitflags_like! {
    /// A bitset over the readiness kinds this core cares about: the two a
    /// caller can register interest in (`READABLE`, `WRITABLE`), plus the
    /// ones only ever observed in a returned revents mask
    /// (`PRIORITY`/`ERROR`/`HANGUP`).
    pub struct Interest: u32 {
        const NONE = 0;
        const READABLE = 0b0001;
        const WRITABLE = 0b0010;
        const PRIORITY = 0b0100;
        const ERROR = 0b1000;
        const HANGUP = 0b1_0000;
    }
}

impl Interest {
    pub fn is_readable(self) -> bool {
        self.contains(Interest::READABLE)
    }
    pub fn is_writable(self) -> bool {
        self.contains(Interest::WRITABLE)
    }
    pub fn is_priority(self) -> bool {
        self.contains(Interest::PRIORITY)
    }
    pub fn is_error(self) -> bool {
        self.contains(Interest::ERROR)
    }
    pub fn is_hangup(self) -> bool {
        self.contains(Interest::HANGUP)
    }
}

/// One ready descriptor reported by a [`Selector::select`] call.
#[derive(Debug, Clone, Copy)]
pub struct ActiveEvent {
    fd: RawFd,
    revents: Interest,
}

impl ActiveEvent {
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn revents(&self) -> Interest {
        self.revents
    }
}

/// Environment variable that selects the `poll(2)`-based backend over the
/// default `epoll(2)` one, mirroring spec.md's `MUDUO_USE_POLL`.
pub const USE_POLL_ENV_VAR: &str = "MUDUO_USE_POLL";

enum Backend {
    Epoll(EpollBackend),
    Poll(PollBackend),
}

impl Backend {
    fn select(&mut self, timeout: Option<Duration>, active: &mut Vec<ActiveEvent>) -> io::Result<()> {
        match self {
            Backend::Epoll(b) => b.select(timeout, active),
            Backend::Poll(b) => b.select(timeout, active),
        }
    }

    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        match self {
            Backend::Epoll(b) => b.register(fd, interest),
            Backend::Poll(b) => b.register(fd, interest),
        }
    }

    fn reregister(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        match self {
            Backend::Epoll(b) => b.reregister(fd, interest),
            Backend::Poll(b) => b.reregister(fd, interest),
        }
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        match self {
            Backend::Epoll(b) => b.deregister(fd),
            Backend::Poll(b) => b.deregister(fd),
        }
    }
}

/// Wraps the OS readiness mechanism for one [`EventLoop`](crate::EventLoop).
///
/// Only ever touched from the owning loop's thread (spec.md §4.1); nothing
/// here is `Sync` on its own merits, it rides along inside `EventLoop`'s
/// documented cross-thread exception.
pub struct Selector {
    backend: RefCell<Backend>,
    /// Mirrors the kernel's interest set: every fd present here has
    /// `poll_state() == Added`. This is a membership mirror, not an owning
    /// map — the owner (`Connection`/`Acceptor`) holding the `Channel`
    /// lives elsewhere; `EventLoop` keeps the dispatch-time back-reference.
    channel_index: RefCell<HashSet<RawFd>>,
}

impl Selector {
    /// Picks `epoll` by default; `poll` if [`USE_POLL_ENV_VAR`] is set.
    /// Resolves spec.md §9's open question: both backends are real, no
    /// null-pointer stand-in.
    pub fn new() -> io::Result<Selector> {
        let backend = if std::env::var_os(USE_POLL_ENV_VAR).is_some() {
            Backend::Poll(PollBackend::new()?)
        } else {
            Backend::Epoll(EpollBackend::new()?)
        };
        Ok(Selector {
            backend: RefCell::new(backend),
            channel_index: RefCell::new(HashSet::new()),
        })
    }

    /// Blocks up to `timeout` or until at least one descriptor is ready or
    /// the call is interrupted. On `EINTR`, returns with `active` empty
    /// and no error. Other failures are logged and swallowed so the loop
    /// can continue, matching spec.md §7's propagation policy.
    pub fn select(&self, timeout: Duration, active: &mut Vec<ActiveEvent>) -> Instant {
        active.clear();
        match self.backend.borrow_mut().select(Some(timeout), active) {
            Ok(()) => {}
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {
                trace!("selector interrupted, retrying next cycle");
                active.clear();
            }
            Err(err) => {
                error!("selector error: {err}");
                active.clear();
            }
        }
        Instant::now()
    }

    /// Reconciles `channel`'s interest mask with the kernel, per spec.md
    /// §4.1: NEW -> register & ADDED; ADDED-with-empty-mask -> deregister
    /// & DELETED; ADDED-with-mask -> modify; DELETED-with-mask ->
    /// re-register & ADDED.
    pub fn update(&self, channel: &Channel) -> io::Result<()> {
        let fd = channel.fd();
        match channel.poll_state() {
            PollState::New => {
                self.backend.borrow_mut().register(fd, channel.interest())?;
                self.channel_index.borrow_mut().insert(fd);
                channel.set_poll_state(PollState::Added);
            }
            PollState::Added => {
                if channel.is_none_event() {
                    self.backend.borrow_mut().deregister(fd)?;
                    self.channel_index.borrow_mut().remove(&fd);
                    channel.set_poll_state(PollState::Deleted);
                } else {
                    self.backend
                        .borrow_mut()
                        .reregister(fd, channel.interest())?;
                }
            }
            PollState::Deleted => {
                if !channel.is_none_event() {
                    self.backend.borrow_mut().register(fd, channel.interest())?;
                    self.channel_index.borrow_mut().insert(fd);
                    channel.set_poll_state(PollState::Added);
                }
            }
        }
        Ok(())
    }

    /// Removes `channel` from the demultiplexer entirely.
    pub fn remove(&self, channel: &Channel) -> io::Result<()> {
        let fd = channel.fd();
        self.channel_index.borrow_mut().remove(&fd);
        if channel.poll_state() == PollState::Added {
            self.backend.borrow_mut().deregister(fd)?;
        }
        channel.set_poll_state(PollState::New);
        Ok(())
    }

    /// Invariant 1 (spec.md §8): every `Added` channel's fd is present in
    /// the kernel mirror. Backs `EventLoop::has_channel`.
    pub(crate) fn contains(&self, fd: RawFd) -> bool {
        self.channel_index.borrow().contains(&fd)
    }
}

/// `epoll(2)`-backed selector. Grounded on
/// `examples/tokio-rs-mio/src/sys/unix/selector/epoll.rs`.
struct EpollBackend {
    epoll_fd: RawFd,
    events: Vec<libc::epoll_event>,
}

impl EpollBackend {
    fn new() -> io::Result<EpollBackend> {
        let epoll_fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(EpollBackend {
            epoll_fd,
            events: vec![unsafe { std::mem::zeroed() }; INITIAL_EVENT_CAPACITY],
        })
    }

    fn select(&mut self, timeout: Option<Duration>, active: &mut Vec<ActiveEvent>) -> io::Result<()> {
        let timeout_ms = to_millis(timeout);
        let n = syscall!(epoll_wait(
            self.epoll_fd,
            self.events.as_mut_ptr(),
            self.events.len() as libc::c_int,
            timeout_ms,
        ))? as usize;

        for raw in &self.events[..n] {
            active.push(ActiveEvent {
                fd: raw.u64 as RawFd,
                revents: from_epoll_events(raw.events),
            });
        }

        if n == self.events.len() {
            let new_len = self.events.len() * 2;
            self.events.resize(new_len, unsafe { std::mem::zeroed() });
        }
        Ok(())
    }

    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut event = epoll_event_for(fd, interest);
        syscall!(epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut event)).map(|_| ())
    }

    fn reregister(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut event = epoll_event_for(fd, interest);
        syscall!(epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut event)).map(|_| ())
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        syscall!(epoll_ctl(
            self.epoll_fd,
            libc::EPOLL_CTL_DEL,
            fd,
            std::ptr::null_mut()
        ))
        .map(|_| ())
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        unsafe { libc::close(self.epoll_fd) };
    }
}

fn epoll_event_for(fd: RawFd, interest: Interest) -> libc::epoll_event {
    let mut events = 0u32;
    if interest.is_readable() {
        events |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
    }
    if interest.is_writable() {
        events |= libc::EPOLLOUT as u32;
    }
    if interest.is_priority() {
        events |= libc::EPOLLPRI as u32;
    }
    libc::epoll_event {
        events,
        u64: fd as u64,
    }
}

fn from_epoll_events(events: u32) -> Interest {
    let mut out = Interest::NONE;
    let e = events as libc::c_int;
    if e & (libc::EPOLLIN | libc::EPOLLPRI) != 0 {
        out = out.add(Interest::READABLE);
    }
    if e & libc::EPOLLPRI != 0 {
        out = out.add(Interest::PRIORITY);
    }
    if e & libc::EPOLLOUT != 0 {
        out = out.add(Interest::WRITABLE);
    }
    if e & libc::EPOLLERR != 0 {
        out = out.add(Interest::ERROR);
    }
    if e & (libc::EPOLLHUP | libc::EPOLLRDHUP) != 0 {
        out = out.add(Interest::HANGUP);
    }
    out
}

fn to_millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => d
            .checked_add(Duration::from_nanos(999_999))
            .unwrap_or(d)
            .as_millis()
            .min(libc::c_int::MAX as u128) as libc::c_int,
    }
}

/// `poll(2)`-backed selector, selected via [`USE_POLL_ENV_VAR`]. A much
/// simpler structure than mio's own `poll` backend
/// (`examples/tokio-rs-mio/src/sys/unix/selector/poll.rs`) suffices here:
/// that one supports concurrent registration from multiple threads, which
/// this core never needs since every `Selector` is confined to one loop's
/// thread by construction.
struct PollBackend {
    fds: Vec<libc::pollfd>,
}

impl PollBackend {
    fn new() -> io::Result<PollBackend> {
        Ok(PollBackend { fds: Vec::new() })
    }

    fn select(&mut self, timeout: Option<Duration>, active: &mut Vec<ActiveEvent>) -> io::Result<()> {
        if self.fds.is_empty() {
            // `poll(2)` with zero fds still sleeps for `timeout`; that's
            // exactly the behavior we want (an idle loop still observes
            // its wakeup fd, which is always registered once the owning
            // `EventLoop` exists).
        }
        let timeout_ms = to_millis(timeout);
        syscall!(poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, timeout_ms))?;

        for pfd in &mut self.fds {
            if pfd.revents != 0 {
                active.push(ActiveEvent {
                    fd: pfd.fd,
                    revents: from_poll_events(pfd.revents),
                });
                pfd.revents = 0;
            }
        }
        Ok(())
    }

    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.fds.push(libc::pollfd {
            fd,
            events: to_poll_events(interest),
            revents: 0,
        });
        Ok(())
    }

    fn reregister(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if let Some(pfd) = self.fds.iter_mut().find(|p| p.fd == fd) {
            pfd.events = to_poll_events(interest);
        }
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.fds.retain(|p| p.fd != fd);
        Ok(())
    }
}

fn to_poll_events(interest: Interest) -> libc::c_short {
    let mut events = 0;
    if interest.is_readable() {
        events |= libc::POLLIN | libc::POLLRDHUP;
    }
    if interest.is_writable() {
        events |= libc::POLLOUT;
    }
    if interest.is_priority() {
        events |= libc::POLLPRI;
    }
    events as libc::c_short
}

fn from_poll_events(revents: libc::c_short) -> Interest {
    let mut out = Interest::NONE;
    let e = revents as libc::c_int;
    if e & (libc::POLLIN | libc::POLLPRI) != 0 {
        out = out.add(Interest::READABLE);
    }
    if e & libc::POLLPRI != 0 {
        out = out.add(Interest::PRIORITY);
    }
    if e & libc::POLLOUT != 0 {
        out = out.add(Interest::WRITABLE);
    }
    if e & libc::POLLERR != 0 {
        out = out.add(Interest::ERROR);
    }
    if e & (libc::POLLHUP | libc::POLLRDHUP) != 0 {
        out = out.add(Interest::HANGUP);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_bitset_add_remove() {
        let i = Interest::READABLE.add(Interest::WRITABLE);
        assert!(i.is_readable());
        assert!(i.is_writable());
        let r = i.remove(Interest::WRITABLE);
        assert!(r.is_readable());
        assert!(!r.is_writable());
    }

    #[test]
    fn none_is_empty() {
        assert!(Interest::NONE.is_empty());
        assert!(!Interest::READABLE.is_empty());
    }

    #[test]
    fn selector_register_update_remove_round_trip() {
        let selector = Selector::new().unwrap();
        // A pipe gives us a real, pollable fd pair without a socket.
        let mut fds = [0 as RawFd; 2];
        unsafe { assert_eq!(libc::pipe(fds.as_mut_ptr()), 0) };
        let read_fd = fds[0];

        let channel = Channel::new(read_fd);
        channel.enable_reading();
        selector.update(&channel).unwrap();
        assert!(selector.contains(read_fd));

        channel.disable_reading();
        channel.disable_all();
        selector.update(&channel).unwrap();
        assert!(!selector.contains(read_fd));

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
