//! Per-accepted-socket state machine: owns a `Channel` and two `Buffer`s,
//! drives the user's connection/message/write-complete/high-water-mark
//! callbacks, and handles the buffered-partial-write and half-close paths.
//!
//! `original_source/` doesn't carry `TcpConnection.cc` — this module is
//! grounded directly on spec.md §3/§4.7, reusing the weak-tie pattern from
//! `Channel.cc` (see `channel.rs`) and the `run_in_loop`/`queue_in_loop`
//! cross-thread submission from `EventLoop.cc`.

use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};

use log::{debug, info, warn};

use crate::buffer::Buffer;
use crate::event_loop::EventLoop;
use crate::macros::syscall;
use crate::net::InetAddr;
use crate::Timestamp;

/// Output-buffer length above which [`Connection::send`] notifies the user
/// to throttle producers, absent an explicit override. Matches the
/// original's `TcpConnection` default of 64 MiB.
pub(crate) const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

pub(crate) type ConnectionCallback = Arc<dyn Fn(&Connection) + Send + Sync>;
pub(crate) type MessageCallback = Arc<dyn Fn(&Connection, &mut Buffer, Timestamp) + Send + Sync>;
pub(crate) type WriteCompleteCallback = Arc<dyn Fn(&Connection) + Send + Sync>;
pub(crate) type HighWaterMarkCallback = Arc<dyn Fn(&Connection, usize) + Send + Sync>;
pub(crate) type CloseCallback = Arc<dyn Fn(Arc<Connection>) + Send + Sync>;

/// Where a `Connection` stands in its accept-to-teardown lifecycle
/// (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed on the base loop, not yet handed to its worker loop.
    Connecting,
    /// `establish()` has run; read is enabled and the user has been told.
    Connected,
    /// User called `shutdown()`; write side closes once output drains.
    Disconnecting,
    /// Socket closed, by either peer or `destroy()`.
    Disconnected,
}

/// A single accepted TCP socket's state machine. Always held as
/// `Arc<Connection>` (never plain `Connection`) so that [`crate::Channel`]
/// can keep a weak back-reference and the `Server`'s connection table, the
/// owning worker loop's dispatch registry, and in-flight cross-thread tasks
/// can all share ownership safely.
pub struct Connection {
    loop_: Arc<EventLoop>,
    name: String,
    fd: RawFd,
    channel: crate::Channel,
    state: Cell<ConnectionState>,
    input_buffer: RefCell<Buffer>,
    output_buffer: RefCell<Buffer>,
    local_addr: InetAddr,
    peer_addr: InetAddr,
    high_water_mark: Cell<usize>,
    weak_self: Weak<Connection>,
    connection_cb: RefCell<Option<ConnectionCallback>>,
    message_cb: RefCell<Option<MessageCallback>>,
    write_complete_cb: RefCell<Option<WriteCompleteCallback>>,
    high_water_cb: RefCell<Option<HighWaterMarkCallback>>,
    close_cb: RefCell<Option<CloseCallback>>,
}

// SAFETY: every field not already `Sync` (the interior-mutable `Cell`s and
// `RefCell`s, plus the embedded `Channel`) is mutated only on `loop_`'s
// owning thread: `establish`/`handle_read`/`handle_write`/`handle_close`/
// `handle_error`/`destroy` all run there, and `send`/`shutdown` funnel
// cross-thread callers through `run_in_loop`/`queue_in_loop` rather than
// touching this state directly. This mirrors `EventLoop`'s own
// justification (see event_loop.rs) for the same pattern.
unsafe impl Send for Connection {}
unsafe impl Sync for Connection {}

impl Connection {
    /// Builds a `Connecting` connection over an already-accepted, already
    /// non-blocking `fd`. Does not touch the demultiplexer yet — that's
    /// `establish`'s job, run on `loop_`'s own thread (spec.md §4.7).
    pub(crate) fn new(
        loop_: Arc<EventLoop>,
        name: String,
        fd: RawFd,
        local_addr: InetAddr,
        peer_addr: InetAddr,
    ) -> Arc<Connection> {
        set_tcp_nodelay(fd);

        Arc::new_cyclic(|weak| {
            let channel = crate::Channel::new(fd);

            let weak_read = weak.clone();
            channel.set_read_callback(move |t| {
                if let Some(conn) = weak_read.upgrade() {
                    conn.handle_read(t);
                }
            });
            let weak_write = weak.clone();
            channel.set_write_callback(move || {
                if let Some(conn) = weak_write.upgrade() {
                    conn.handle_write();
                }
            });
            let weak_close = weak.clone();
            channel.set_close_callback(move || {
                if let Some(conn) = weak_close.upgrade() {
                    conn.handle_close();
                }
            });
            let weak_error = weak.clone();
            channel.set_error_callback(move || {
                if let Some(conn) = weak_error.upgrade() {
                    conn.handle_error();
                }
            });

            Connection {
                loop_,
                name,
                fd,
                channel,
                state: Cell::new(ConnectionState::Connecting),
                input_buffer: RefCell::new(Buffer::new()),
                output_buffer: RefCell::new(Buffer::new()),
                local_addr,
                peer_addr,
                high_water_mark: Cell::new(DEFAULT_HIGH_WATER_MARK),
                weak_self: weak.clone(),
                connection_cb: RefCell::new(None),
                message_cb: RefCell::new(None),
                write_complete_cb: RefCell::new(None),
                high_water_cb: RefCell::new(None),
                close_cb: RefCell::new(None),
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> InetAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> InetAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn connected(&self) -> bool {
        self.state.get() == ConnectionState::Connected
    }

    pub(crate) fn loop_handle(&self) -> Arc<EventLoop> {
        self.loop_.clone()
    }

    pub(crate) fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_cb.borrow_mut() = Some(cb);
    }

    pub(crate) fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_cb.borrow_mut() = Some(cb);
    }

    pub(crate) fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_cb.borrow_mut() = Some(cb);
    }

    pub(crate) fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        self.high_water_mark.set(mark);
        *self.high_water_cb.borrow_mut() = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_cb.borrow_mut() = Some(cb);
    }

    /// `Connecting` -> `Connected`: ties the channel's lifetime check to
    /// this connection, enables read interest, registers with the loop's
    /// dispatch table, and fires the user's connection callback. Must run
    /// on `loop_`'s owning thread — the worker loop that will own this
    /// connection for the rest of its life.
    pub(crate) fn establish(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        assert_eq!(self.state.get(), ConnectionState::Connecting);

        self.channel.tie(self);
        self.channel.enable_reading();
        self.loop_.update_channel(&self.channel);
        self.loop_.register_connection(self.fd, Arc::downgrade(self));

        self.state.set(ConnectionState::Connected);
        info!("Connection [{}] established on fd {}", self.name, self.fd);
        self.fire_connection_callback();
    }

    fn handle_read(&self, receive_time: Timestamp) {
        self.loop_.assert_in_loop_thread();
        match self.input_buffer.borrow_mut().read_from_fd(self.fd) {
            Ok(0) => self.handle_close(),
            Ok(_n) => {
                if let Some(cb) = self.message_cb.borrow().as_ref() {
                    let f: &dyn Fn(&Connection, &mut Buffer, Timestamp) = &**cb;
                    f(self, &mut self.input_buffer.borrow_mut(), receive_time);
                }
            }
            Err(err) => self.handle_read_error(err),
        }
    }

    fn handle_read_error(&self, err: io::Error) {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {}
            _ => {
                warn!(
                    "Connection [{}] read error on fd {}: {err}",
                    self.name, self.fd
                );
                self.handle_error();
            }
        }
    }

    fn handle_write(&self) {
        self.loop_.assert_in_loop_thread();
        if !self.channel.is_writing() {
            debug!(
                "Connection [{}] fd {} is down, no more writing",
                self.name, self.fd
            );
            return;
        }

        match self.output_buffer.borrow().write_to_fd(self.fd) {
            Ok(n) => {
                self.output_buffer.borrow_mut().retrieve(n);
                if self.output_buffer.borrow().readable_bytes() == 0 {
                    self.channel.disable_writing();
                    self.loop_.update_channel(&self.channel);
                    self.queue_write_complete();
                    if self.state.get() == ConnectionState::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(err) => match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {}
                _ => warn!(
                    "Connection [{}] write error on fd {}: {err}",
                    self.name, self.fd
                ),
            },
        }
    }

    /// Disables all events, fires the connection callback with the
    /// now-disconnected state, then the close callback (which drives
    /// `Server` removal). Fires exactly once per connection lifetime:
    /// every path that can observe EOF or a hangup funnels through here,
    /// and the channel is disabled before the callbacks run so a
    /// re-entrant read can't trigger a second call.
    fn handle_close(&self) {
        self.loop_.assert_in_loop_thread();
        assert_ne!(self.state.get(), ConnectionState::Disconnected);

        self.channel.disable_all();
        self.loop_.update_channel(&self.channel);
        self.state.set(ConnectionState::Disconnected);

        self.fire_connection_callback();

        if let (Some(conn), Some(cb)) = (self.weak_self.upgrade(), self.close_cb.borrow().clone())
        {
            let f: &dyn Fn(Arc<Connection>) = &*cb;
            f(conn);
        }
    }

    fn handle_error(&self) {
        let err = socket_error(self.fd);
        warn!(
            "Connection [{}] handle_error on fd {}: {err}",
            self.name, self.fd
        );
    }

    /// Tears down a still-`Connected` connection unconditionally: fires the
    /// disconnected connection callback and deregisters the channel.
    /// Invoked by `Server::remove_connection_in_loop` once this connection
    /// has already been dropped from the connection table.
    pub(crate) fn destroy(&self) {
        self.loop_.assert_in_loop_thread();
        if self.state.get() == ConnectionState::Connected {
            self.state.set(ConnectionState::Disconnected);
            self.channel.disable_all();
            self.fire_connection_callback();
        }
        self.loop_.remove_channel(&self.channel);
    }

    fn fire_connection_callback(&self) {
        if let Some(cb) = self.connection_cb.borrow().as_ref() {
            let f: &dyn Fn(&Connection) = &**cb;
            f(self);
        }
    }

    fn queue_write_complete(&self) {
        if let Some(cb) = self.write_complete_cb.borrow().as_ref() {
            let cb = cb.clone();
            let weak = self.weak_self.clone();
            self.loop_.queue_in_loop(Box::new(move || {
                if let Some(conn) = weak.upgrade() {
                    let f: &dyn Fn(&Connection) = &*cb;
                    f(&conn);
                }
            }));
        }
    }

    /// Queues `data` for the peer. Safe to call from any thread: on the
    /// owning loop it writes inline, otherwise the bytes are copied into a
    /// task and handed to `queue_in_loop` (spec.md §4.7 "Send path").
    pub fn send(&self, data: &[u8]) {
        if self.state.get() != ConnectionState::Connected {
            return;
        }
        if self.loop_.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let owned = data.to_vec();
            let weak = self.weak_self.clone();
            self.loop_.queue_in_loop(Box::new(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.send_in_loop(&owned);
                }
            }));
        }
    }

    fn send_in_loop(&self, data: &[u8]) {
        self.loop_.assert_in_loop_thread();
        if self.state.get() == ConnectionState::Disconnected {
            warn!(
                "Connection [{}] send_in_loop - disconnected, dropping {} bytes",
                self.name,
                data.len()
            );
            return;
        }

        let mut remaining = data;

        if !self.channel.is_writing() && self.output_buffer.borrow().readable_bytes() == 0 {
            match write_fd_direct(self.fd, data) {
                Ok(n) => {
                    remaining = &data[n..];
                    if remaining.is_empty() {
                        self.queue_write_complete();
                    }
                }
                Err(err) => match err.kind() {
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {}
                    _ => warn!(
                        "Connection [{}] send_in_loop write error on fd {}: {err}",
                        self.name, self.fd
                    ),
                },
            }
        }

        if !remaining.is_empty() {
            let old_len = self.output_buffer.borrow().readable_bytes();
            let high_water_mark = self.high_water_mark.get();

            self.output_buffer.borrow_mut().append(remaining);
            let new_len = old_len + remaining.len();

            if !self.channel.is_writing() {
                self.channel.enable_writing();
                self.loop_.update_channel(&self.channel);
            }

            if old_len < high_water_mark && new_len >= high_water_mark {
                if let Some(cb) = self.high_water_cb.borrow().as_ref() {
                    let f: &dyn Fn(&Connection, usize) = &**cb;
                    f(self, new_len);
                }
            }
        }
    }

    /// Half-closes the write side once any buffered output has drained.
    /// `Connected` -> `Disconnecting`; the peer keeps seeing readable data
    /// until it closes its own end.
    pub fn shutdown(&self) {
        if self.state.get() == ConnectionState::Connected {
            self.state.set(ConnectionState::Disconnecting);
            let weak = self.weak_self.clone();
            self.loop_.run_in_loop(Box::new(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.shutdown_in_loop();
                }
            }));
        }
    }

    fn shutdown_in_loop(&self) {
        self.loop_.assert_in_loop_thread();
        if !self.channel.is_writing() {
            if let Err(err) = syscall!(shutdown(self.fd, libc::SHUT_WR)) {
                warn!(
                    "Connection [{}] shutdown_in_loop failed on fd {}: {err}",
                    self.name, self.fd
                );
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("fd", &self.fd)
            .field("state", &self.state.get())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn set_tcp_nodelay(fd: RawFd) {
    let value: libc::c_int = 1;
    if let Err(err) = syscall!(setsockopt(
        fd,
        libc::IPPROTO_TCP,
        libc::TCP_NODELAY,
        &value as *const _ as *const libc::c_void,
        std::mem::size_of::<libc::c_int>() as libc::socklen_t,
    )) {
        warn!("failed to set TCP_NODELAY on fd {fd}: {err}");
    }
}

fn socket_error(fd: RawFd) -> io::Error {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        io::Error::last_os_error()
    } else {
        io::Error::from_raw_os_error(err)
    }
}

fn write_fd_direct(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    syscall!(write(
        fd,
        data.as_ptr() as *const libc::c_void,
        data.len(),
    ))
    .map(|n| n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(rc, 0, "socketpair failed: {}", io::Error::last_os_error());
        (fds[0], fds[1])
    }

    fn addr() -> InetAddr {
        InetAddr::any(0)
    }

    #[test]
    fn establish_transitions_state_and_fires_connection_callback() {
        let event_loop = Arc::new(EventLoop::new());
        let (a, b) = socketpair();
        let conn = Connection::new(event_loop, "test#1".into(), a, addr(), addr());

        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        conn.set_connection_callback(Arc::new(move |c: &Connection| {
            fired2.store(c.connected(), Ordering::SeqCst);
        }));

        conn.establish();

        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(conn.state(), ConnectionState::Connected);
        unsafe { libc::close(b) };
    }

    #[test]
    fn handle_read_delivers_bytes_to_message_callback() {
        let event_loop = Arc::new(EventLoop::new());
        let (a, b) = socketpair();
        let conn = Connection::new(event_loop, "test#2".into(), a, addr(), addr());
        conn.establish();

        let received = Arc::new(Mutex::new(String::new()));
        let received2 = received.clone();
        conn.set_message_callback(Arc::new(move |_c, buf: &mut Buffer, _t| {
            *received2.lock().unwrap() = buf.retrieve_all_as_string();
        }));

        unsafe {
            libc::write(b, b"ping\n".as_ptr() as *const libc::c_void, 5);
        }
        std::thread::sleep(Duration::from_millis(20));
        conn.handle_read(Timestamp::now());

        assert_eq!(*received.lock().unwrap(), "ping\n");
        unsafe { libc::close(b) };
    }

    #[test]
    fn peer_close_fires_close_callback_exactly_once() {
        let event_loop = Arc::new(EventLoop::new());
        let (a, b) = socketpair();
        let conn = Connection::new(event_loop, "test#3".into(), a, addr(), addr());
        conn.establish();

        let closed = Arc::new(AtomicUsize::new(0));
        let closed2 = closed.clone();
        conn.set_close_callback(Arc::new(move |_c: Arc<Connection>| {
            closed2.fetch_add(1, Ordering::SeqCst);
        }));

        unsafe { libc::close(b) };
        std::thread::sleep(Duration::from_millis(20));
        conn.handle_read(Timestamp::now());

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn send_past_high_water_mark_fires_callback_exactly_once() {
        let event_loop = Arc::new(EventLoop::new());
        let (a, b) = socketpair();
        let conn = Connection::new(event_loop, "test#4".into(), a, addr(), addr());
        conn.establish();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        conn.set_high_water_mark_callback(
            Arc::new(move |_c, _len: usize| {
                fired2.fetch_add(1, Ordering::SeqCst);
            }),
            1024,
        );

        let payload = vec![0u8; 4 * 1024 * 1024];
        conn.send(&payload);

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        unsafe { libc::close(b) };
    }

    #[test]
    fn shutdown_closes_write_side_while_connected() {
        let event_loop = Arc::new(EventLoop::new());
        let (a, b) = socketpair();
        let conn = Connection::new(event_loop, "test#5".into(), a, addr(), addr());
        conn.establish();

        conn.shutdown();
        assert_eq!(conn.state(), ConnectionState::Disconnecting);

        std::thread::sleep(Duration::from_millis(20));
        let mut buf = [0u8; 16];
        let n = unsafe { libc::read(b, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        assert_eq!(n, 0, "peer should observe EOF after shutdown(SHUT_WR)");
        unsafe { libc::close(b) };
    }

    #[test]
    fn destroy_on_connected_connection_fires_disconnected_callback() {
        let event_loop = Arc::new(EventLoop::new());
        let (a, b) = socketpair();
        let conn = Connection::new(event_loop, "test#6".into(), a, addr(), addr());
        conn.establish();

        let last_state = Arc::new(Mutex::new(None));
        let last_state2 = last_state.clone();
        conn.set_connection_callback(Arc::new(move |c: &Connection| {
            *last_state2.lock().unwrap() = Some(c.state());
        }));

        conn.destroy();

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(*last_state.lock().unwrap(), Some(ConnectionState::Disconnected));
        unsafe { libc::close(b) };
    }
}
