//! End-to-end scenario 2 from spec.md §8: with `set_thread_num(4)`, 8
//! serially opened connections are dispatched to worker threads in
//! round-robin order `[w0, w1, w2, w3, w0, w1, w2, w3]`.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use reactor_core::{EventLoop, InetAddr, Server, TcpOption};

#[test]
fn eight_connections_cycle_across_four_workers() {
    drop(env_logger::try_init());

    let base_loop = Arc::new(EventLoop::new());
    let addr = InetAddr::new(0, "127.0.0.1").unwrap();
    let server = Server::new(base_loop.clone(), addr, "pool", TcpOption::NoReusePort).unwrap();
    server.set_thread_num(4);

    let (tx, rx) = mpsc::channel::<ThreadId>();
    server.set_connection_callback(move |conn| {
        if conn.connected() {
            tx.send(std::thread::current().id()).unwrap();
        }
    });

    server.start();
    let port = server.local_addr().to_port();

    let quitter = base_loop.clone();
    let client_handle = std::thread::spawn(move || {
        let mut streams = Vec::new();
        for _ in 0..8 {
            let stream = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
            streams.push(stream);
            std::thread::sleep(Duration::from_millis(15));
        }
        std::thread::sleep(Duration::from_millis(50));
        quitter.quit();
        streams
    });

    base_loop.run();
    let streams = client_handle.join().unwrap();
    drop(streams);

    let observed: Vec<ThreadId> = rx.try_iter().collect();
    assert_eq!(observed.len(), 8, "expected one connection-callback per connection");

    let mut first_seen: Vec<ThreadId> = Vec::new();
    for id in &observed {
        if !first_seen.contains(id) {
            first_seen.push(*id);
        }
    }
    assert_eq!(first_seen.len(), 4, "expected exactly 4 distinct worker threads");

    for (i, id) in observed.iter().enumerate() {
        assert_eq!(*id, first_seen[i % 4], "connection {i} dispatched off round-robin order");
    }
}
