//! Markers and futures (spec.md §4.4, §9).
//!
//! Per the Design Notes' recast of the source's smart-pointer-heavy ownership
//! graph: a marker holds a *capability id* (`registration_id`) and re-resolves
//! it against the registry at compile time rather than an owning/weak `Arc`
//! pair, and a future is owned by whoever awaits it with only a weak
//! back-reference held by the marker for coalescing.

use crate::artifact::ArtifactCollection;
use std::sync::{Arc, Condvar, Mutex, Weak};

/// `(state, artifact_collection?, error_blob?)` — spec.md §3. One-shot: settles
/// once and is never retried via the same future.
enum FutureState {
    Pending,
    Ready(ArtifactCollection),
    Invalid(ArtifactCollection),
}

/// A one-shot handle settled with an artifact collection (possibly carrying an
/// error log, per the Log-chunk convention).
pub struct CompileFuture {
    state: Mutex<FutureState>,
    condvar: Condvar,
}

impl CompileFuture {
    pub(crate) fn pending() -> Arc<Self> {
        Arc::new(Self { state: Mutex::new(FutureState::Pending), condvar: Condvar::new() })
    }

    /// Settles the future. Panics if called twice — a future settles once (spec.md
    /// §3: "one-shot; settles once and is never retried via the same future").
    pub(crate) fn settle(&self, collection: ArtifactCollection) {
        use crate::artifact::AssetState;
        let next = match collection.state() {
            AssetState::Invalid => FutureState::Invalid(collection),
            _ => FutureState::Ready(collection),
        };
        let mut state = self.state.lock().unwrap();
        assert!(matches!(*state, FutureState::Pending), "CompileFuture settled twice");
        *state = next;
        drop(state);
        self.condvar.notify_all();
    }

    /// Non-blocking poll.
    pub fn poll(&self) -> Option<ArtifactCollection> {
        match &*self.state.lock().unwrap() {
            FutureState::Pending => None,
            FutureState::Ready(c) | FutureState::Invalid(c) => Some(c.clone()),
        }
    }

    /// Blocks the calling thread until the future settles.
    pub fn wait(&self) -> ArtifactCollection {
        let guard = self.state.lock().unwrap();
        let guard = self.condvar.wait_while(guard, |s| matches!(s, FutureState::Pending)).unwrap();
        match &*guard {
            FutureState::Ready(c) | FutureState::Invalid(c) => c.clone(),
            FutureState::Pending => unreachable!(),
        }
    }
}

/// `(initializers[], type_code, weak_ref_to_registration, weak_ref_to_active_future,
/// store_ref)` — spec.md §3. Cached by `(type_code, initializers)` in the registry's
/// coalescing map; one marker per logical request.
pub struct Marker {
    pub(crate) initializers: Vec<String>,
    pub(crate) type_code: u64,
    pub(crate) registration_id: u64,
    active_future: Mutex<Weak<CompileFuture>>,
}

impl Marker {
    pub(crate) fn new(initializers: Vec<String>, type_code: u64, registration_id: u64) -> Arc<Self> {
        Arc::new(Self { initializers, type_code, registration_id, active_future: Mutex::new(Weak::new()) })
    }

    pub fn initializers(&self) -> &[String] {
        &self.initializers
    }

    pub fn type_code(&self) -> u64 {
        self.type_code
    }

    /// `InvokeCompile` coalescing step (spec.md §4.4 step 1): returns the still-live
    /// future from a prior call within the same burst, if any.
    pub(crate) fn active_future(&self) -> Option<Arc<CompileFuture>> {
        self.active_future.lock().unwrap().upgrade()
    }

    /// Installs a freshly-created future as the marker's active future (spec.md §4.4
    /// step 2).
    pub(crate) fn set_active_future(&self, future: &Arc<CompileFuture>) {
        *self.active_future.lock().unwrap() = Arc::downgrade(future);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::chunkfile::Chunk;
    use crate::depval::ValidationNode;

    #[test]
    fn future_settles_once_and_wakes_waiters() {
        let future = CompileFuture::pending();
        assert!(future.poll().is_none());

        let waiter_future = future.clone();
        let waiter = std::thread::spawn(move || waiter_future.wait());

        std::thread::sleep(std::time::Duration::from_millis(10));
        future.settle(ArtifactCollection::new(vec![Chunk::log("done")], ValidationNode::new()));

        let result = waiter.join().unwrap();
        assert_eq!(result.error_message().as_deref(), Some("done"));
    }

    #[test]
    #[should_panic(expected = "settled twice")]
    fn settling_twice_panics() {
        let future = CompileFuture::pending();
        future.settle(ArtifactCollection::new(vec![], ValidationNode::new()));
        future.settle(ArtifactCollection::new(vec![], ValidationNode::new()));
    }

    #[test]
    fn marker_coalesces_active_future_within_a_burst() {
        let marker = Marker::new(vec!["foo.dae".into()], 1, 0);
        assert!(marker.active_future().is_none());
        let future = CompileFuture::pending();
        marker.set_active_future(&future);
        assert!(Arc::ptr_eq(&marker.active_future().unwrap(), &future));
    }
}
