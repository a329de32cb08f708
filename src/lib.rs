//! `reactor-core` is a one-loop-per-thread TCP reactor: a single acceptor
//! thread hands off accepted connections, round-robin, to a fixed pool of
//! I/O worker threads, each running its own event loop. Users register
//! callbacks for connection lifecycle and message arrival; the core takes
//! care of readiness multiplexing, buffered partial writes, half-close, and
//! safe cross-thread teardown.
//!
//! # Example
//!
//! ```no_run
//! use reactor_core::{EventLoop, InetAddr, Server, TcpOption};
//! use std::sync::Arc;
//!
//! let base_loop = Arc::new(EventLoop::new());
//! let addr = InetAddr::new(9981, "127.0.0.1").unwrap();
//! let server = Server::new(base_loop.clone(), addr, "echo", TcpOption::NoReusePort).unwrap();
//!
//! server.set_message_callback(|conn, buf, _time| {
//!     let data = buf.retrieve_all_as_string();
//!     conn.send(data.as_bytes());
//! });
//!
//! server.set_thread_num(4);
//! server.start();
//! base_loop.run(); // blocks forever driving the reactor
//! ```
//!
//! The crate is organized the way the reactor itself is layered, leaves
//! first: [`buffer`] and [`net`] are pure data types, [`selector`] wraps the
//! OS readiness mechanism, [`channel`] binds a descriptor to callbacks,
//! [`event_loop`] drives one thread, [`worker_pool`] fans loops out across
//! threads, and [`acceptor`]/[`connection`]/[`server`] assemble the
//! TCP-specific pieces on top.

#[cfg(feature = "os-poll")]
mod acceptor;
mod buffer;
#[cfg(feature = "os-poll")]
mod channel;
#[cfg(feature = "os-poll")]
mod connection;
#[cfg(feature = "os-poll")]
mod current_thread;
#[cfg(feature = "os-poll")]
mod event_loop;
// Used unconditionally by `buffer`'s `read_from_fd`/`write_to_fd`, which stay
// buildable without `os-poll`, so this module isn't gated either.
mod macros;
mod net;
#[cfg(feature = "os-poll")]
mod selector;
#[cfg(feature = "os-poll")]
mod server;
#[cfg(feature = "os-poll")]
mod worker_pool;

#[cfg(feature = "os-poll")]
pub use acceptor::Acceptor;
pub use buffer::Buffer;
#[cfg(feature = "os-poll")]
pub use channel::{Channel, ChannelId};
#[cfg(feature = "os-poll")]
pub use connection::{Connection, ConnectionState};
#[cfg(feature = "os-poll")]
pub use event_loop::{EventLoop, LoopTask};
pub use net::InetAddr;
#[cfg(feature = "os-poll")]
pub use selector::{ActiveEvent, Interest};
#[cfg(feature = "os-poll")]
pub use server::{Server, TcpOption};
#[cfg(feature = "os-poll")]
pub use worker_pool::WorkerPool;

/// Timestamp at which a readiness batch or message was received.
///
/// A thin alias over [`std::time::Instant`]; kept as a named type so the
/// public callback signatures read the way spec.md's `receive-time` reads,
/// without committing callers to a particular clock representation.
pub type Timestamp = std::time::Instant;
