//! Cancellation signal plumbed from the HTTP layer into the executor
//! (spec.md §5 "Cancellation").

use tokio::sync::watch;

/// Cheap-to-clone cancellation signal. `true` once the client has
/// disconnected or the host otherwise wants the in-flight call aborted.
pub type CancelSignal = watch::Receiver<bool>;

/// Owned by the HTTP layer; dropping it (or calling `cancel`) lets waiters
/// observe the cancellation.
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn new() -> (Self, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (Self(tx), rx)
    }

    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

/// A signal that never fires — used by callers (tests, non-HTTP callers)
/// that don't need cancellation.
pub fn never_cancelled() -> CancelSignal {
    CancelHandle::new().1
}

pub(crate) fn is_cancelled(signal: &CancelSignal) -> bool {
    *signal.borrow()
}
