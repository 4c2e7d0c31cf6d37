use std::{
    hint,
    sync::atomic::{AtomicUsize, Ordering},
    thread,
};

/// Threads that can be inside the resolver at the same time.  Further threads
/// wait for a free entry.
pub const MAX_RESOLVING_THREADS: usize = 64;

// No thread handle is 0.
const FREE: usize = 0;

#[inline]
fn current_thread() -> usize {
    // `pthread_self` reads the thread pointer; it never allocates.
    unsafe { libc::pthread_self() as usize }
}

/// Tracks which threads are currently inside symbol resolution.
///
/// An allocation entry point whose real routine is not yet known, called on a
/// thread that is itself resolving, must take memory from the bootstrap arena:
/// resolving from there would recurse into the resolver.  Other threads are
/// unaffected and resolve for themselves.
///
/// Per-thread state lives in a fixed table indexed by `pthread_self()` rather
/// than in thread-local storage, whose first access in a dynamically loaded
/// library may call `malloc`.
pub struct RecursionGuard {
    // Total nesting depth over all threads.
    depth: AtomicUsize,
    owners: [AtomicUsize; MAX_RESOLVING_THREADS],
    // Only modified by the thread in the matching `owners` entry.
    nesting: [AtomicUsize; MAX_RESOLVING_THREADS],
}

impl RecursionGuard {
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const ZERO: AtomicUsize = AtomicUsize::new(0);
        RecursionGuard {
            depth: AtomicUsize::new(0),
            owners: [ZERO; MAX_RESOLVING_THREADS],
            nesting: [ZERO; MAX_RESOLVING_THREADS],
        }
    }

    fn entry_of(&self, thread: usize) -> Option<usize> {
        self.owners
            .iter()
            .position(|owner| owner.load(Ordering::Acquire) == thread)
    }

    /// Is the calling thread in the middle of a resolution?
    #[inline]
    pub fn active(&self) -> bool {
        self.depth.load(Ordering::Acquire) > 0 && self.entry_of(current_thread()).is_some()
    }

    /// Is a resolution in progress on any thread?
    pub fn held(&self) -> bool {
        self.depth.load(Ordering::Acquire) > 0
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// Mark the start of a resolution on the calling thread.  The mark is
    /// removed when the returned scope is dropped.
    pub fn enter(&self) -> GuardScope<'_> {
        let me = current_thread();
        let entry = match self.entry_of(me) {
            Some(entry) => entry,
            None => self.claim(me),
        };
        self.nesting[entry].fetch_add(1, Ordering::Relaxed);
        self.depth.fetch_add(1, Ordering::AcqRel);
        GuardScope { guard: self, entry }
    }

    fn claim(&self, me: usize) -> usize {
        loop {
            for (entry, owner) in self.owners.iter().enumerate() {
                if owner
                    .compare_exchange(FREE, me, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return entry;
                }
            }
            hint::spin_loop();
            thread::yield_now();
        }
    }
}

impl Default for RecursionGuard {
    fn default() -> Self {
        Self::new()
    }
}

pub struct GuardScope<'a> {
    guard: &'a RecursionGuard,
    entry: usize,
}

impl Drop for GuardScope<'_> {
    fn drop(&mut self) {
        let guard = self.guard;
        crate::hard_assert!(
            guard.owners[self.entry].load(Ordering::Acquire) == current_thread(),
            "recursion guard released by a thread that does not hold it"
        );
        let previous = guard.depth.fetch_sub(1, Ordering::AcqRel);
        crate::hard_assert!(previous > 0, "recursion guard released more often than entered");
        if guard.nesting[self.entry].fetch_sub(1, Ordering::Relaxed) == 1 {
            guard.owners[self.entry].store(FREE, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    #[test]
    fn nested_scopes() {
        let guard = RecursionGuard::new();
        assert!(!guard.active());
        assert!(!guard.held());
        {
            let _outer = guard.enter();
            assert_eq!(guard.depth(), 1);
            {
                let _inner = guard.enter();
                assert_eq!(guard.depth(), 2);
            }
            assert!(guard.active());
        }
        assert!(!guard.active());
        assert!(!guard.held());
    }

    #[test]
    fn only_the_resolving_thread_is_active() {
        let guard = RecursionGuard::new();
        let _scope = guard.enter();
        thread::scope(|s| {
            s.spawn(|| {
                assert!(guard.held());
                assert!(!guard.active());
            });
        });
        assert!(guard.active());
    }

    #[test]
    fn threads_resolve_independently() {
        let guard = RecursionGuard::new();
        let both_inside = Barrier::new(2);
        let second_done = Barrier::new(2);
        thread::scope(|s| {
            s.spawn(|| {
                let _scope = guard.enter();
                both_inside.wait();
                second_done.wait();
                // Still ours after the other thread left.
                assert!(guard.active());
                assert_eq!(guard.depth(), 1);
            });
            {
                let _scope = guard.enter();
                both_inside.wait();
                assert!(guard.active());
                assert_eq!(guard.depth(), 2);
            }
            assert!(!guard.active());
            second_done.wait();
        });
        assert!(!guard.held());
    }

    #[test]
    fn balanced_across_threads() {
        let guard = RecursionGuard::new();
        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        let _scope = guard.enter();
                        assert!(guard.active());
                    }
                });
            }
        });
        assert_eq!(guard.depth(), 0);
        assert!(guard.owners.iter().all(|o| o.load(Ordering::Relaxed) == FREE));
    }
}
