use crate::sync::{
    atomic::{AtomicUsize, Ordering::*},
    hint,
};
use core::fmt;

/// A [sequence lock] counter.
///
/// A `SeqCount` protects a group of atomic fields that must be observed
/// together. Readers never block writers: they snapshot the sequence number,
/// read the protected fields, and retry the whole read if a write started or
/// completed in the meantime. Writers are serialized by the counter itself
/// (an odd sequence number means a write is in progress), so a separate writer
/// lock is not required.
///
/// The protected data must itself be stored in atomics; `SeqCount` only
/// provides the retry protocol that keeps multi-word reads consistent.
///
/// [sequence lock]: https://en.wikipedia.org/wiki/Seqlock
pub struct SeqCount {
    seq: AtomicUsize,
}

/// An RAII guard indicating that a write is in progress.
///
/// The sequence number is advanced again when the guard is dropped,
/// publishing the write to readers.
#[must_use = "dropping the guard immediately ends the write section"]
pub struct WriteGuard<'lock> {
    seq: &'lock AtomicUsize,
    start: usize,
}

impl SeqCount {
    loom_const_fn! {
        #[must_use]
        pub fn new() -> Self {
            Self {
                seq: AtomicUsize::new(0),
            }
        }
    }

    /// Performs an optimistic read, retrying `f` until it observes a state
    /// that was not concurrently modified.
    ///
    /// `f` may be called any number of times, so it should only load the
    /// protected fields.
    #[inline]
    pub fn read<T>(&self, mut f: impl FnMut() -> T) -> T {
        loop {
            let start = self.read_begin();
            let value = f();
            if !self.read_retry(start) {
                return value;
            }
            hint::spin_loop();
        }
    }

    /// Begins a read section, returning the sequence number to pass to
    /// [`SeqCount::read_retry`].
    ///
    /// This spins while a write is in progress.
    #[inline]
    #[must_use]
    pub fn read_begin(&self) -> usize {
        loop {
            let seq = self.seq.load(Acquire);
            if !is_writing(test_dbg!(seq)) {
                return seq;
            }
            hint::spin_loop();
        }
    }

    /// Returns `true` if a read that began at `start` may have observed a torn
    /// state and must be retried.
    #[inline]
    #[must_use]
    pub fn read_retry(&self, start: usize) -> bool {
        test_dbg!(self.seq.load(Acquire)) != start
    }

    /// Begins a write section, spinning until any other writer has finished.
    pub fn write(&self) -> WriteGuard<'_> {
        let mut curr = self.seq.load(Relaxed);
        loop {
            if is_writing(test_dbg!(curr)) {
                hint::spin_loop();
                curr = self.seq.load(Relaxed);
                continue;
            }

            match self.try_start_write(curr) {
                Ok(_) => return WriteGuard { seq: &self.seq, start: curr },
                Err(actual) => curr = actual,
            }

            hint::spin_loop();
        }
    }

    /// Begins a write section if no other write is in progress.
    ///
    /// This never spins waiting for another writer.
    #[cfg(test)]
    pub(crate) fn try_write(&self) -> Option<WriteGuard<'_>> {
        let mut curr = self.seq.load(Relaxed);
        loop {
            if is_writing(test_dbg!(curr)) {
                return None;
            }

            match self.try_start_write(curr) {
                Ok(_) => return Some(WriteGuard { seq: &self.seq, start: curr }),
                Err(actual) => curr = actual,
            }
        }
    }

    /// Returns `true` if a write is currently in progress.
    #[cfg(test)]
    #[must_use]
    pub(crate) fn is_writing(&self) -> bool {
        is_writing(self.seq.load(Relaxed))
    }

    /// Try to increment the sequence number by one to indicate that
    /// we're starting a write.
    #[inline(always)]
    fn try_start_write(&self, curr: usize) -> Result<usize, usize> {
        test_dbg!(self
            .seq
            .compare_exchange_weak(curr, curr.wrapping_add(1), Acquire, Relaxed))
    }
}

impl Default for SeqCount {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SeqCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let seq = self.seq.load(Relaxed);
        f.debug_struct("SeqCount")
            .field("seq", &seq)
            .field("writing", &is_writing(seq))
            .finish()
    }
}

// === impl WriteGuard ===

impl Drop for WriteGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        test_dbg!(self.seq.store(self.start.wrapping_add(2), Release));
    }
}

impl fmt::Debug for WriteGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteGuard")
            .field("start", &self.start)
            .finish()
    }
}

/// Returns `true` if a sequence number indicates that a write is in progress.
#[inline(always)]
const fn is_writing(seq: usize) -> bool {
    seq & 1 == 1
}

#[cfg(test)]
mod tests {
    use crate::loom::{self, sync::Arc, thread};
    use crate::sync::atomic::AtomicU64;

    use super::*;

    // loom hits its branch limit quickly when several readers ping-pong in
    // their spin loops without the writer making progress, so only one reader
    // runs under `cfg(loom)`.
    const READERS: usize = if cfg!(loom) { 1 } else { 4 };

    /// Two words that a writer always keeps equal.
    struct Pair {
        seq: SeqCount,
        a: AtomicU64,
        b: AtomicU64,
    }

    impl Pair {
        fn new() -> Self {
            Self {
                seq: SeqCount::new(),
                a: AtomicU64::new(0),
                b: AtomicU64::new(0),
            }
        }

        fn load(&self) -> (u64, u64) {
            self.seq
                .read(|| (self.a.load(Acquire), self.b.load(Acquire)))
        }

        fn bump(&self) {
            let _write = self.seq.write();
            let next = self.a.load(Relaxed) + 1;
            self.a.store(next, Release);
            self.b.store(next, Release);
        }
    }

    #[test]
    fn readers_never_observe_torn_pairs() {
        const WRITES: u64 = 2;

        loom::model(|| {
            let pair = Arc::new(Pair::new());
            let readers = (0..READERS)
                .map(|_| {
                    let pair = pair.clone();
                    thread::spawn(move || {
                        for _ in 0..WRITES {
                            let (a, b) = test_dbg!(pair.load());
                            assert_eq!(a, b, "observed a torn write");
                        }
                    })
                })
                .collect::<Vec<_>>();

            for _ in 0..WRITES {
                pair.bump();
                thread::yield_now();
            }

            for reader in readers {
                reader.join().unwrap();
            }
            assert_eq!(pair.load(), (WRITES, WRITES));
        });
    }

    #[test]
    fn writers_are_serialized() {
        loom::model(|| {
            let pair = Arc::new(Pair::new());
            let writer = {
                let pair = pair.clone();
                thread::spawn(move || pair.bump())
            };
            pair.bump();
            writer.join().unwrap();

            assert_eq!(pair.load(), (2, 2));
        });
    }

    #[test]
    fn try_write_fails_while_writing() {
        loom::model(|| {
            let seq = SeqCount::new();
            let guard = seq.write();
            assert!(seq.is_writing());
            assert!(seq.try_write().is_none());
            drop(guard);

            assert!(!seq.is_writing());
            let start = seq.read_begin();
            assert!(seq.try_write().is_some());
            assert!(seq.read_retry(start), "a completed write must force a retry");
        });
    }
}
