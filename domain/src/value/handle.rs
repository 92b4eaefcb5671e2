//! Host-side handles for engine-resident functions and coroutines.
//!
//! A handle wraps `{owning machine id, anchor id}`. Release is
//! deterministic rather than finalizer-driven: dropping the last clone
//! enqueues the anchor id with the owning machine's [`HandleReleaser`],
//! whose pending queue is drained before the machine's next engine
//! operation. The releaser is held weakly so a handle outliving its
//! machine degrades to a no-op on drop.

use std::fmt;
use std::sync::{Arc, Weak};

/// Sink for released anchor ids. Implemented by the machine's shared
/// state; `release` must be callable from any thread.
pub trait HandleReleaser: Send + Sync {
    fn release(&self, id: u64);
}

#[derive(Debug)]
struct HandleCore {
    machine: u64,
    id: u64,
    releaser: Weak<dyn HandleReleaser>,
}

impl HandleCore {
    fn new(machine: u64, id: u64, releaser: Weak<dyn HandleReleaser>) -> Arc<Self> {
        Arc::new(Self {
            machine,
            id,
            releaser,
        })
    }
}

impl Drop for HandleCore {
    fn drop(&mut self) {
        if let Some(releaser) = self.releaser.upgrade() {
            releaser.release(self.id);
        }
    }
}

/// A host-side reference to an engine-resident function.
#[derive(Clone, Debug)]
pub struct FunctionHandle(Arc<HandleCore>);

impl FunctionHandle {
    /// Internal constructor, used by the bridge when an engine function is
    /// first surfaced to the host.
    pub fn new(machine: u64, id: u64, releaser: Weak<dyn HandleReleaser>) -> Self {
        Self(HandleCore::new(machine, id, releaser))
    }

    /// Anchor id within the owning machine.
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// Id of the owning machine, for ownership checks.
    pub fn machine_id(&self) -> u64 {
        self.0.machine
    }

    pub(crate) fn identity(&self) -> (u64, u64) {
        (self.0.machine, self.0.id)
    }

    /// Downgrade for dedup caches that must not keep the handle alive.
    pub fn downgrade(&self) -> WeakFunctionHandle {
        WeakFunctionHandle(Arc::downgrade(&self.0))
    }
}

impl PartialEq for FunctionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for FunctionHandle {}

impl fmt::Display for FunctionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "function#{}", self.0.id)
    }
}

/// Weak counterpart of [`FunctionHandle`] for dedup caches.
#[derive(Clone, Debug)]
pub struct WeakFunctionHandle(Weak<HandleCore>);

impl WeakFunctionHandle {
    pub fn upgrade(&self) -> Option<FunctionHandle> {
        self.0.upgrade().map(FunctionHandle)
    }
}

/// A host-side reference to an engine-level coroutine (thread).
#[derive(Clone, Debug)]
pub struct CoroutineHandle(Arc<HandleCore>);

impl CoroutineHandle {
    pub fn new(machine: u64, id: u64, releaser: Weak<dyn HandleReleaser>) -> Self {
        Self(HandleCore::new(machine, id, releaser))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn machine_id(&self) -> u64 {
        self.0.machine
    }

    pub(crate) fn identity(&self) -> (u64, u64) {
        (self.0.machine, self.0.id)
    }

    pub fn downgrade(&self) -> WeakCoroutineHandle {
        WeakCoroutineHandle(Arc::downgrade(&self.0))
    }
}

impl PartialEq for CoroutineHandle {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for CoroutineHandle {}

impl fmt::Display for CoroutineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "coroutine#{}", self.0.id)
    }
}

/// Weak counterpart of [`CoroutineHandle`] for dedup caches.
#[derive(Clone, Debug)]
pub struct WeakCoroutineHandle(Weak<HandleCore>);

impl WeakCoroutineHandle {
    pub fn upgrade(&self) -> Option<CoroutineHandle> {
        self.0.upgrade().map(CoroutineHandle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingReleaser {
        released: Mutex<Vec<u64>>,
    }

    impl HandleReleaser for RecordingReleaser {
        fn release(&self, id: u64) {
            self.released.lock().unwrap().push(id);
        }
    }

    fn weak_of(releaser: &Arc<RecordingReleaser>) -> Weak<dyn HandleReleaser> {
        let strong: Arc<dyn HandleReleaser> = Arc::clone(releaser) as Arc<dyn HandleReleaser>;
        Arc::downgrade(&strong)
    }

    #[test]
    fn test_drop_of_last_clone_releases_once() {
        let releaser = Arc::new(RecordingReleaser::default());
        let handle = FunctionHandle::new(1, 42, weak_of(&releaser));
        let clone = handle.clone();
        drop(handle);
        assert!(releaser.released.lock().unwrap().is_empty());
        drop(clone);
        assert_eq!(*releaser.released.lock().unwrap(), vec![42]);
    }

    #[test]
    fn test_drop_after_machine_gone_is_noop() {
        let releaser = Arc::new(RecordingReleaser::default());
        let handle = FunctionHandle::new(1, 7, weak_of(&releaser));
        drop(releaser);
        drop(handle); // must not panic
    }

    #[test]
    fn test_identity_equality() {
        let releaser = Arc::new(RecordingReleaser::default());
        let a = FunctionHandle::new(1, 5, weak_of(&releaser));
        let b = a.clone();
        let c = FunctionHandle::new(1, 6, weak_of(&releaser));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_weak_handle_upgrade() {
        let releaser = Arc::new(RecordingReleaser::default());
        let a = CoroutineHandle::new(2, 9, weak_of(&releaser));
        let weak = a.downgrade();
        assert_eq!(weak.upgrade().unwrap(), a);
        drop(a);
        assert!(weak.upgrade().is_none());
    }
}
