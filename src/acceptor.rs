//! Owns the listening socket: accepts new connections and hands the raw
//! descriptor off to a new-connection callback.
//!
//! Grounded on `original_source/Acceptor.h` for the shape (one `Channel`
//! over the listening fd, a settable new-connection callback, the
//! reserved-fd EMFILE technique) and on
//! `examples/tokio-rs-mio/src/sys/unix/tcp.rs` for the raw-libc
//! socket/bind/listen sequence this core needs instead of
//! `std::net::TcpListener` (which doesn't expose `SO_REUSEPORT`).

use std::cell::{Cell, RefCell};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};

use log::{info, warn};

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::macros::syscall;
use crate::net::InetAddr;

type NewConnectionCallback = Box<dyn FnMut(RawFd, InetAddr)>;

/// Owns a non-blocking listening socket and the `Channel` that watches it
/// for read-readiness. Held as `Arc<Acceptor>` (never plain `Acceptor`), the
/// same way `Connection` is held, so that `Server::start` can submit
/// `acceptor.listen()` to the base loop via `run_in_loop` — a `LoopTask`
/// requires `Send`, which an `Rc`-held value could never give it. In
/// practice an `Acceptor` is still only ever touched from the base loop's
/// thread; see the `unsafe impl` below for the same accounting
/// `Connection` and `EventLoop` already do.
pub struct Acceptor {
    loop_: Arc<EventLoop>,
    listen_socket: RawFd,
    channel: Channel,
    new_connection_cb: RefCell<Option<NewConnectionCallback>>,
    listening: Cell<bool>,
    /// A spare fd held in reserve so `accept` can still be called (and
    /// immediately closed) when the process is out of descriptors,
    /// preventing a tight `EPOLLIN`-forever busy loop (spec.md §4.5).
    idle_fd: Cell<RawFd>,
}

// SAFETY: every field is either immutable after construction (`loop_`,
// `listen_socket`) or mutated only on the base loop's owning thread
// (`channel`, `new_connection_cb`, `listening`, `idle_fd`) — `listen()` and
// `handle_read()` both run there, dispatched through the base loop's
// registry. Mirrors `Connection`'s and `EventLoop`'s own justification.
unsafe impl Send for Acceptor {}
unsafe impl Sync for Acceptor {}

impl Acceptor {
    /// Creates the listening socket, binds and listens on `addr`, and
    /// wires its channel's read callback — but does not yet register
    /// interest with the demultiplexer; call [`Acceptor::listen`] for that.
    pub fn new(
        loop_: Arc<EventLoop>,
        addr: InetAddr,
        reuse_port: bool,
    ) -> io::Result<Arc<Acceptor>> {
        let listen_socket = syscall!(socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        ))?;

        set_reuseaddr(listen_socket)?;
        if reuse_port {
            set_reuseport(listen_socket)?;
        }
        bind(listen_socket, addr.socket_addr())?;
        syscall!(listen(listen_socket, LISTEN_BACKLOG))?;

        let idle_fd = syscall!(open(
            DEV_NULL.as_ptr() as *const libc::c_char,
            libc::O_RDONLY | libc::O_CLOEXEC,
        ))?;

        let channel = Channel::new(listen_socket);
        let acceptor = Arc::new(Acceptor {
            loop_,
            listen_socket,
            channel,
            new_connection_cb: RefCell::new(None),
            listening: Cell::new(false),
            idle_fd: Cell::new(idle_fd),
        });

        let weak: Weak<Acceptor> = Arc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(move |_time| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        });

        acceptor
            .loop_
            .register_acceptor(listen_socket, acceptor.clone());

        Ok(acceptor)
    }

    pub(crate) fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn listening(&self) -> bool {
        self.listening.get()
    }

    /// The address actually bound, resolved via `getsockname` — useful when
    /// the server was constructed with an ephemeral port (port `0`).
    pub fn local_addr(&self) -> InetAddr {
        let mut storage: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        unsafe {
            libc::getsockname(
                self.listen_socket,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            );
        }
        sockaddr_in_to_inet_addr(&storage)
    }

    pub fn set_new_connection_callback(&self, cb: impl FnMut(RawFd, InetAddr) + 'static) {
        *self.new_connection_cb.borrow_mut() = Some(Box::new(cb));
    }

    /// Starts watching the listening socket for readiness. Must run on the
    /// base loop (spec.md §4.8: submitted via `run_in_loop`).
    pub fn listen(&self) {
        self.listening.set(true);
        self.channel.enable_reading();
        self.loop_.update_channel(&self.channel);
    }

    fn handle_read(&self) {
        loop {
            let mut storage: libc::sockaddr_in = unsafe { mem::zeroed() };
            let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

            match syscall!(accept4(
                self.listen_socket,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )) {
                Ok(fd) => {
                    let peer_addr = sockaddr_in_to_inet_addr(&storage);
                    match self.new_connection_cb.borrow_mut().as_mut() {
                        Some(cb) => cb(fd, peer_addr),
                        None => {
                            unsafe { libc::close(fd) };
                        }
                    }
                }
                Err(err) => {
                    match err.raw_os_error() {
                        Some(libc::EAGAIN) => {}
                        Some(libc::EMFILE) => self.handle_emfile(),
                        _ => warn!("Acceptor::handle_read accept failed: {err}"),
                    }
                    break;
                }
            }
        }
    }

    /// Degrades gracefully under file-descriptor exhaustion: give back the
    /// one descriptor we've been holding in reserve, accept-and-close the
    /// connection that triggered `EMFILE` (so it isn't retried forever),
    /// then reopen the reserve for next time.
    fn handle_emfile(&self) {
        warn!("Acceptor: EMFILE, degrading via reserved descriptor");
        unsafe { libc::close(self.idle_fd.get()) };
        let accepted = unsafe {
            libc::accept(
                self.listen_socket,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if accepted >= 0 {
            unsafe { libc::close(accepted) };
        }
        match syscall!(open(
            DEV_NULL.as_ptr() as *const libc::c_char,
            libc::O_RDONLY | libc::O_CLOEXEC,
        )) {
            Ok(fd) => self.idle_fd.set(fd),
            Err(err) => warn!("Acceptor: failed to reopen reserved descriptor: {err}"),
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        info!("Acceptor for fd {} shutting down", self.listen_socket);
        self.channel.disable_all();
        self.loop_.remove_channel(&self.channel);
        unsafe {
            libc::close(self.listen_socket);
            libc::close(self.idle_fd.get());
        }
    }
}

const LISTEN_BACKLOG: libc::c_int = 1024;
const DEV_NULL: &[u8] = b"/dev/null\0";

fn set_reuseaddr(fd: RawFd) -> io::Result<()> {
    set_bool_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR)
}

fn set_reuseport(fd: RawFd) -> io::Result<()> {
    set_bool_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT)
}

fn set_bool_opt(fd: RawFd, level: libc::c_int, name: libc::c_int) -> io::Result<()> {
    let value: libc::c_int = 1;
    syscall!(setsockopt(
        fd,
        level,
        name,
        &value as *const _ as *const libc::c_void,
        mem::size_of::<libc::c_int>() as libc::socklen_t,
    ))
    .map(|_| ())
}

fn bind(fd: RawFd, addr: SocketAddr) -> io::Result<()> {
    let v4 = match addr {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(_) => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "reactor-core is IPv4-only",
            ))
        }
    };
    let sockaddr = inet_addr_v4_to_sockaddr_in(&v4);
    syscall!(bind(
        fd,
        &sockaddr as *const _ as *const libc::sockaddr,
        mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
    ))
    .map(|_| ())
}

fn inet_addr_v4_to_sockaddr_in(addr: &SocketAddrV4) -> libc::sockaddr_in {
    let mut sockaddr: libc::sockaddr_in = unsafe { mem::zeroed() };
    sockaddr.sin_family = libc::AF_INET as libc::sa_family_t;
    sockaddr.sin_port = addr.port().to_be();
    sockaddr.sin_addr = libc::in_addr {
        s_addr: u32::from_ne_bytes(addr.ip().octets()),
    };
    sockaddr
}

fn sockaddr_in_to_inet_addr(storage: &libc::sockaddr_in) -> InetAddr {
    let octets = storage.sin_addr.s_addr.to_ne_bytes();
    let ip = Ipv4Addr::from(octets);
    let port = u16::from_be(storage.sin_port);
    SocketAddrV4::new(ip, port).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_listens_and_accepts_a_connection() {
        let event_loop = Arc::new(EventLoop::new());
        let addr = InetAddr::new(0, "127.0.0.1").unwrap();
        let acceptor = Acceptor::new(event_loop.clone(), addr, false).unwrap();

        let local_port = {
            let mut storage: libc::sockaddr_in = unsafe { mem::zeroed() };
            let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            unsafe {
                libc::getsockname(
                    acceptor.listen_socket,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                );
            }
            u16::from_be(storage.sin_port)
        };
        assert!(local_port > 0);

        let accepted: Arc<Cell<Option<RawFd>>> = Arc::new(Cell::new(None));
        let accepted_clone = accepted.clone();
        acceptor.set_new_connection_callback(move |fd, _peer| {
            accepted_clone.set(Some(fd));
        });
        acceptor.listen();
        assert!(acceptor.listening());

        let client = std::net::TcpStream::connect(("127.0.0.1", local_port)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        acceptor.handle_read();

        assert!(accepted.get().is_some());
        unsafe { libc::close(accepted.get().unwrap()) };
        drop(client);
    }
}
