use allocator_api2::alloc::{Allocator, Global};

use crate::{OomHandler, Rmalloc};

/// Rmalloc lock: wrapper struct containing a mutex-locked `Rmalloc`.
///
/// This serialises access between owners sharing one arena. Chunks pinned by
/// one owner stay pinned for all of them; the mutex only guards the metadata.
///
/// Obtain with [`Rmalloc::into_rmlock`] and call [`rmalloc`](Rmlock::rmalloc)
/// to lock the mutex and access the inner `Rmalloc`.
#[derive(Debug)]
pub struct Rmlock<R: lock_api::RawMutex, O: OomHandler, A: Allocator + Clone = Global> {
    mutex: lock_api::Mutex<R, Rmalloc<O, A>>,
}

impl<R: lock_api::RawMutex, O: OomHandler, A: Allocator + Clone> Rmlock<R, O, A> {
    /// Create a new `Rmlock`.
    pub const fn new(rmalloc: Rmalloc<O, A>) -> Self {
        Self { mutex: lock_api::Mutex::new(rmalloc) }
    }

    /// Lock the mutex and access the inner `Rmalloc`.
    pub fn rmalloc(&self) -> lock_api::MutexGuard<'_, R, Rmalloc<O, A>> {
        self.mutex.lock()
    }

    /// Try to lock the mutex and access the inner `Rmalloc`.
    pub fn try_rmalloc(&self) -> Option<lock_api::MutexGuard<'_, R, Rmalloc<O, A>>> {
        self.mutex.try_lock()
    }

    /// Retrieve the inner `Rmalloc`.
    pub fn into_inner(self) -> Rmalloc<O, A> {
        self.mutex.into_inner()
    }
}

/// A [`RawMutex`](lock_api::RawMutex) that never blocks, for an arena driven by
/// exactly one actor that still wants the [`Rmlock`] interface.
///
/// # Safety
/// Nothing is synchronised. If two threads hold a guard at once, they race on
/// the arena metadata, which is undefined behaviour even in safe code. Prefer
/// an uncontended spin lock unless the target has no atomics.
pub struct AssumeUnlockable;

// SAFETY: callers uphold single-actor access, see above
unsafe impl lock_api::RawMutex for AssumeUnlockable {
    const INIT: AssumeUnlockable = AssumeUnlockable;

    type GuardMarker = lock_api::GuardSend;

    fn lock(&self) {}

    fn try_lock(&self) -> bool {
        true
    }

    unsafe fn unlock(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrOnOom;

    #[test]
    fn rmlock_serialises_access() {
        let rmlock = Rmalloc::new(ErrOnOom, 4096).unwrap().into_rmlock::<spin::Mutex<()>>();

        let h = rmlock.rmalloc().allocate(64).unwrap();
        {
            let mut rm = rmlock.rmalloc();
            rm.lock(h);
            assert!(rmlock.try_rmalloc().is_none());
            rm.unlock(h);
        }
        rmlock.rmalloc().free(h);

        let rm = rmlock.into_inner();
        assert_eq!(rm.live_chunk_count(), 0);
    }

    #[test]
    fn shared_between_threads() {
        let rmlock = std::sync::Arc::new(
            Rmalloc::new(ErrOnOom, 1 << 16).unwrap().into_rmlock::<spin::Mutex<()>>(),
        );

        let threads: std::vec::Vec<_> = (0..4)
            .map(|_| {
                let rmlock = rmlock.clone();
                std::thread::spawn(move || {
                    for _ in 0..32 {
                        let h = rmlock.rmalloc().allocate(48).unwrap();
                        rmlock.rmalloc().free(h);
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }
        assert!(rmlock.rmalloc().verify().is_ok());
    }

    #[test]
    fn assume_unlockable() {
        let rmlock = Rmalloc::new(ErrOnOom, 4096).unwrap().into_rmlock::<AssumeUnlockable>();
        let h = rmlock.rmalloc().allocate(16).unwrap();
        assert_eq!(rmlock.rmalloc().size(h), Some(16));
    }
}
