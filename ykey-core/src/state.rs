//! Cooperative cancellation and keepalive reporting for long-running commands

use std::sync::atomic::{AtomicBool, Ordering};

/// Status reported by a device while a command is pending
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveStatus {
    /// The device is busy processing
    Processing,
    /// The device is waiting for user presence (touch or biometric)
    UpNeeded,
}

type KeepAliveObserver = Box<dyn Fn(KeepAliveStatus) + Send + Sync>;

/// Shared handle for one in-flight command
///
/// Transports poll `is_cancelled` while waiting on the device and forward
/// keepalive packets to the observer. Cancelling unblocks the wait; the
/// transport then resets device state and reports `Error::Cancelled`.
#[derive(Default)]
pub struct CommandState {
    cancelled: AtomicBool,
    observer: Option<KeepAliveObserver>,
}

impl CommandState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a state whose observer is called on every keepalive
    pub fn with_observer(observer: impl Fn(KeepAliveStatus) + Send + Sync + 'static) -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            observer: Some(Box::new(observer)),
        }
    }

    /// Request cancellation of the pending command
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Called by transports when the device signals it is still working
    pub fn on_keepalive(&self, status: KeepAliveStatus) {
        if let Some(observer) = &self.observer {
            observer(status);
        }
    }
}

impl std::fmt::Debug for CommandState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandState")
            .field("cancelled", &self.is_cancelled())
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_cancel() {
        let state = CommandState::new();
        assert!(!state.is_cancelled());
        state.cancel();
        assert!(state.is_cancelled());
    }

    #[test]
    fn test_observer() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let state = CommandState::with_observer(move |status| {
            if status == KeepAliveStatus::UpNeeded {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        state.on_keepalive(KeepAliveStatus::Processing);
        state.on_keepalive(KeepAliveStatus::UpNeeded);
        state.on_keepalive(KeepAliveStatus::UpNeeded);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
