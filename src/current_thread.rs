//! Thread identity helpers.
//!
//! Grounded on `original_source/CurrentThread.cc`, which caches a Linux TID
//! via `gettid(2)` in a `__thread` global so the owning-loop check is a
//! cheap integer compare. Rust's `std::thread::ThreadId` already gives a
//! process-unique, cheaply comparable identity without an unsafe syscall,
//! so it is used for the actual `assert_in_loop_thread` comparisons; this
//! module stays around as the thin, muduo-flavored wrapper the rest of the
//! crate reaches for when it wants to log "which thread is this", mirroring
//! the original's `CurrentThread::tid()` call sites.

use std::thread::ThreadId;

/// The identity of the calling thread, used to confine loop-owned state to
/// a single thread (spec.md §5).
pub fn id() -> ThreadId {
    std::thread::current().id()
}

/// A human-readable label for the calling thread, for log lines — the
/// original logs the numeric TID; Rust threads carry an optional name
/// instead, which is friendlier in practice and falls back to the debug
/// form of [`ThreadId`] when unset.
pub fn name() -> String {
    std::thread::current()
        .name()
        .map(str::to_owned)
        .unwrap_or_else(|| format!("{:?}", id()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_stable_within_a_thread() {
        assert_eq!(id(), id());
    }

    #[test]
    fn different_threads_have_different_ids() {
        let main_id = id();
        let spawned_id = std::thread::spawn(id).join().unwrap();
        assert_ne!(main_id, spawned_id);
    }
}
