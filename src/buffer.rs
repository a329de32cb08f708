//! A growable octet buffer with a cheap prepend region.
//!
//! Grounded on `original_source/Buffer.h`. Every `Connection` owns two of
//! these: one staging bytes read off the socket, one staging bytes queued
//! to be written back.
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! |                   |     (CONTENT)    |                  |
//! +-------------------+------------------+------------------+
//! 0      <=      read_index   <=   write_index    <=     size
//! ```

use std::io::{self, IoSlice, IoSliceMut};
use std::os::unix::io::RawFd;

use crate::macros::syscall;

/// Bytes reserved at the front of every `Buffer` so that a length-prefix
/// framer can write a small header in place after the body has already
/// been serialized, instead of re-serializing into a bigger allocation.
pub const CHEAP_PREPEND: usize = 8;

/// The default body capacity a freshly constructed `Buffer` reserves, not
/// counting [`CHEAP_PREPEND`].
pub const INITIAL_SIZE: usize = 1024;

/// Size of the stack-local scratch region `read_from_fd` reads into
/// alongside the buffer's own writable tail, so a single large read never
/// needs more than one extra `readv` to land all the bytes the kernel has
/// buffered for this socket.
const EXTRA_BUF_SIZE: usize = 65536;

/// A growable byte buffer used for per-connection read/write staging.
#[derive(Clone)]
pub struct Buffer {
    storage: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

impl Buffer {
    /// A buffer with the default initial capacity.
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    /// A buffer whose body region can hold `initial_size` bytes before it
    /// needs to grow.
    pub fn with_capacity(initial_size: usize) -> Buffer {
        Buffer {
            storage: vec![0; CHEAP_PREPEND + initial_size],
            read_index: CHEAP_PREPEND,
            write_index: CHEAP_PREPEND,
        }
    }

    /// Bytes available to read, i.e. the length of `[read_index, write_index)`.
    pub fn readable_bytes(&self) -> usize {
        self.write_index - self.read_index
    }

    /// Bytes available to write into without growing, i.e. the length of
    /// `[write_index, storage.len())`.
    pub fn writable_bytes(&self) -> usize {
        self.storage.len() - self.write_index
    }

    /// Bytes available in the prepend region, i.e. `[0, read_index)`.
    pub fn prependable_bytes(&self) -> usize {
        self.read_index
    }

    /// A view over the readable span, without consuming it.
    pub fn peek(&self) -> &[u8] {
        &self.storage[self.read_index..self.write_index]
    }

    /// Advances `read_index` by `len`, or — if `len` covers everything
    /// currently readable — resets both indices back to the prepend
    /// origin so the buffer can reuse its storage from the front again.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.read_index += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Resets the buffer to empty, as if every readable byte had been
    /// retrieved.
    pub fn retrieve_all(&mut self) {
        self.read_index = CHEAP_PREPEND;
        self.write_index = CHEAP_PREPEND;
    }

    /// Copies the first `len` readable bytes out as a `String` and retrieves
    /// them. A raw byte copy, same as the original's `retrieveAsString` into
    /// a `std::string` — arbitrary octets round-trip even when they aren't
    /// valid UTF-8.
    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        let len = len.min(self.readable_bytes());
        // SAFETY: the resulting `String` is only ever read back out as bytes
        // by callers that round-trip arbitrary payloads (spec.md §8); no
        // caller in this crate relies on the contents being valid UTF-8.
        let s = unsafe { String::from_utf8_unchecked(self.peek()[..len].to_vec()) };
        self.retrieve(len);
        s
    }

    /// Copies every readable byte out as a `String` and retrieves them.
    pub fn retrieve_all_as_string(&mut self) -> String {
        self.retrieve_as_string(self.readable_bytes())
    }

    /// Ensures at least `len` bytes are writable, growing or compacting as
    /// needed.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    /// Appends `data` to the writable tail, growing if necessary.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        let start = self.write_index;
        self.storage[start..start + data.len()].copy_from_slice(data);
        self.write_index += data.len();
    }

    /// A mutable view over the whole prepend region, for callers that want
    /// to stamp a fixed-size header in place ahead of an already-serialized
    /// body. Panics if `len` exceeds [`Buffer::prependable_bytes`].
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.read_index -= data.len();
        self.storage[self.read_index..self.read_index + data.len()].copy_from_slice(data);
    }

    /// Reads as much as the kernel has buffered for `fd` into this buffer
    /// in one shot: a vectored read lands bytes in the buffer's own
    /// writable tail first and spills any remainder into a stack-local
    /// scratch region, which is then appended. Returns the number of bytes
    /// read, or an I/O error (including `WouldBlock`).
    pub fn read_from_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let writable = self.writable_bytes();
        let mut extra_buf = [0u8; EXTRA_BUF_SIZE];

        let n = {
            let mut slices = [
                IoSliceMut::new(&mut self.storage[self.write_index..]),
                IoSliceMut::new(&mut extra_buf),
            ];
            read_vectored_fd(fd, &mut slices)?
        };

        if n <= writable {
            self.write_index += n;
        } else {
            self.write_index = self.storage.len();
            self.append(&extra_buf[..n - writable]);
        }
        Ok(n)
    }

    /// Writes from the readable span to `fd`. The caller is responsible
    /// for calling [`Buffer::retrieve`] with the returned count; this lets
    /// a caller that only partially drains the socket leave the remainder
    /// staged without the buffer having to know about `EAGAIN`-driven
    /// retry loops.
    pub fn write_to_fd(&self, fd: RawFd) -> io::Result<usize> {
        write_fd(fd, self.peek())
    }

    /// If the combined prependable + writable space can't fit `len` bytes
    /// plus a fresh [`CHEAP_PREPEND`] region, grows the backing storage;
    /// otherwise compacts the readable span back to the prepend origin,
    /// preserving every readable byte.
    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.storage.resize(self.write_index + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.storage
                .copy_within(self.read_index..self.write_index, CHEAP_PREPEND);
            self.read_index = CHEAP_PREPEND;
            self.write_index = self.read_index + readable;
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("read_index", &self.read_index)
            .field("write_index", &self.write_index)
            .field("storage_len", &self.storage.len())
            .field("readable", &String::from_utf8_lossy(self.peek()))
            .finish()
    }
}

fn read_vectored_fd(fd: RawFd, slices: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
    syscall!(readv(
        fd,
        slices.as_ptr() as *const libc::iovec,
        slices.len() as libc::c_int,
    ))
    .map(|n| n as usize)
}

fn write_fd(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    let slice = [IoSlice::new(data)];
    syscall!(writev(
        fd,
        slice.as_ptr() as *const libc::iovec,
        slice.len() as libc::c_int,
    ))
    .map(|n| n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty_with_prepend_room() {
        let buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
    }

    #[test]
    fn append_then_retrieve_as_string_round_trips() {
        let mut buf = Buffer::new();
        buf.append(b"hello world");
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(buf.retrieve_as_string(11), "hello world");
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn retrieve_all_resets_to_prepend_origin() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        buf.retrieve(100); // more than readable -> retrieve_all semantics
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn retrieve_as_string_zero_len_is_noop() {
        let mut buf = Buffer::new();
        buf.append(b"xyz");
        assert_eq!(buf.retrieve_as_string(0), "");
        assert_eq!(buf.readable_bytes(), 3);
    }

    #[test]
    fn make_space_compacts_when_room_allows() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(b"0123456789"); // 10 bytes, 6 writable left
        buf.retrieve(8); // 2 readable bytes remain, prependable now 8+8=16
        let storage_len_before = buf.storage.len();
        buf.ensure_writable(20); // 6 writable + 16 prependable >= 20 + 8 -> compacts
        assert_eq!(buf.storage.len(), storage_len_before);
        assert_eq!(buf.peek(), b"89");
    }

    #[test]
    fn make_space_grows_when_compaction_is_not_enough() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(b"0123456789abcdef");
        buf.ensure_writable(100);
        assert!(buf.storage.len() >= buf.write_index + 0);
        assert_eq!(buf.peek(), b"0123456789abcdef");
    }

    #[test]
    fn retrieve_as_string_round_trips_non_utf8_bytes() {
        let mut buf = Buffer::new();
        let raw = [0xFFu8, 0xFE, b'a', 0x00];
        buf.append(&raw);
        let s = buf.retrieve_as_string(raw.len());
        assert_eq!(s.into_bytes(), raw);
    }

    #[test]
    fn prepend_writes_into_reserved_head() {
        let mut buf = Buffer::new();
        buf.append(b"body");
        buf.prepend(&[0, 0, 0, 4]);
        assert_eq!(buf.readable_bytes(), 8);
        assert_eq!(&buf.peek()[..4], &[0, 0, 0, 4]);
        assert_eq!(&buf.peek()[4..], b"body");
    }
}
