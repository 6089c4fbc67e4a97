//! The two access permits arbitrating cell writes against representation swaps.
//!
//! This is deliberately not a conventional reader/writer lock, even though it
//! is built like one: the shared **update** permit is held by *mutators*, many
//! at once since per-cell writes are already atomic at the bit-packer level, and
//! the exclusive **resize** permit is held while the backing representation is
//! copied and swapped. Reads take no permit at all.
//!
//! The resize permit is re-entrant for its owning thread, and an owner may
//! also take update permits, so a collaborator holding the external write
//! lock can keep issuing logical writes (which grab update permits
//! internally) without deadlocking.

use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct PermitState {
    /// Number of update permits currently held.
    updates: usize,
    /// Thread holding the resize permit, if any.
    resize_owner: Option<ThreadId>,
    /// Re-entrant hold depth of the resize owner.
    resize_depth: usize,
}

/// Shared "update" permit plus exclusive, re-entrant "resize" permit.
pub(crate) struct Permits {
    state: Mutex<PermitState>,
    changed: Condvar,
}

impl Permits {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(PermitState::default()),
            changed: Condvar::new(),
        }
    }

    /// Acquires a shared update permit, blocking while another thread holds
    /// the resize permit.
    pub(crate) fn update(&self) -> UpdatePermit<'_> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        while state.resize_owner.is_some_and(|owner| owner != me) {
            self.changed.wait(&mut state);
        }
        state.updates += 1;
        UpdatePermit { permits: self }
    }

    /// Acquires the exclusive resize permit, blocking until all update
    /// permits held by other threads are released.
    pub(crate) fn resize(&self) -> ResizePermit<'_> {
        self.acquire_resize();
        ResizePermit { permits: self }
    }

    /// Acquires the resize permit without a guard; paired with
    /// [`Permits::release_resize`]. This is the external lock surface.
    pub(crate) fn acquire_resize(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.resize_owner == Some(me) {
            state.resize_depth += 1;
            return;
        }
        // An owner's own update permits would deadlock here; the coordinator
        // never requests a resize while holding an update permit.
        while state.resize_owner.is_some() || state.updates > 0 {
            self.changed.wait(&mut state);
        }
        state.resize_owner = Some(me);
        state.resize_depth = 1;
    }

    /// Attempts to acquire the resize permit without blocking.
    pub(crate) fn try_acquire_resize(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.resize_owner == Some(me) {
            state.resize_depth += 1;
            return true;
        }
        if state.resize_owner.is_none() && state.updates == 0 {
            state.resize_owner = Some(me);
            state.resize_depth = 1;
            return true;
        }
        false
    }

    /// Releases one resize hold.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread does not hold the resize permit; an
    /// unbalanced release is a broken caller, not a runtime condition.
    pub(crate) fn release_resize(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.resize_owner != Some(me) {
            panic!("resize permit released by a thread that does not hold it");
        }
        state.resize_depth -= 1;
        if state.resize_depth == 0 {
            state.resize_owner = None;
            self.changed.notify_all();
        }
    }

    fn release_update(&self) {
        let mut state = self.state.lock();
        state.updates -= 1;
        if state.updates == 0 {
            self.changed.notify_all();
        }
    }
}

/// RAII guard for a shared update permit.
pub(crate) struct UpdatePermit<'a> {
    permits: &'a Permits,
}

impl Drop for UpdatePermit<'_> {
    fn drop(&mut self) {
        self.permits.release_update();
    }
}

/// RAII guard for the exclusive resize permit.
pub(crate) struct ResizePermit<'a> {
    permits: &'a Permits,
}

impl Drop for ResizePermit<'_> {
    fn drop(&mut self) {
        self.permits.release_resize();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_many_update_holders() {
        let permits = Permits::new();
        let a = permits.update();
        let b = permits.update();
        drop(a);
        drop(b);
    }

    #[test]
    fn test_resize_excludes_updates() {
        let permits = Arc::new(Permits::new());
        let entered = Arc::new(AtomicUsize::new(0));

        let resize = permits.resize();
        let handle = {
            let permits = Arc::clone(&permits);
            let entered = Arc::clone(&entered);
            std::thread::spawn(move || {
                let _update = permits.update();
                entered.store(1, Ordering::SeqCst);
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(
            entered.load(Ordering::SeqCst),
            0,
            "update permit granted while resize held"
        );
        drop(resize);
        handle.join().unwrap();
        assert_eq!(entered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_try_resize_fails_under_update() {
        let permits = Arc::new(Permits::new());
        let update = permits.update();
        let permits2 = Arc::clone(&permits);
        let tried = std::thread::spawn(move || permits2.try_acquire_resize())
            .join()
            .unwrap();
        assert!(!tried);
        drop(update);
        assert!(permits.try_acquire_resize());
        permits.release_resize();
    }

    #[test]
    fn test_resize_reentrant_for_owner() {
        let permits = Permits::new();
        permits.acquire_resize();
        permits.acquire_resize();
        assert!(permits.try_acquire_resize());
        // Owner may still take update permits while resizing.
        let update = permits.update();
        drop(update);
        permits.release_resize();
        permits.release_resize();
        permits.release_resize();
        // Fully released: another acquisition starts from scratch.
        let _resize = permits.resize();
    }

    #[test]
    #[should_panic(expected = "does not hold it")]
    fn test_unbalanced_release_panics() {
        let permits = Permits::new();
        permits.release_resize();
    }
}
