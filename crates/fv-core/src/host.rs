//! Contract with the host emulator
//!
//! The host owns the window, the plugin surface and the user-facing log. The
//! video core only needs a logging sink and a frame-swap notification.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Callbacks the host emulator provides to the video core
pub trait HostCallbacks: Send + Sync {
    /// Forward a message to the host log. Fatal messages are shown to the user.
    fn log(&self, message: &str, is_fatal: bool);

    /// Called once per completed frame swap
    fn frame_swapped(&self);
}

/// Host that routes everything to `tracing` and counts swaps.
///
/// Used by the standalone runner and by tests.
#[derive(Debug, Default)]
pub struct TracingHost {
    swaps: AtomicU64,
    fatal_messages: AtomicU64,
}

impl TracingHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of frame swaps reported so far
    pub fn swap_count(&self) -> u64 {
        self.swaps.load(Ordering::Acquire)
    }

    /// Number of fatal messages reported so far
    pub fn fatal_count(&self) -> u64 {
        self.fatal_messages.load(Ordering::Acquire)
    }
}

impl HostCallbacks for TracingHost {
    fn log(&self, message: &str, is_fatal: bool) {
        if is_fatal {
            self.fatal_messages.fetch_add(1, Ordering::AcqRel);
            tracing::error!(target: "host", "{}", message);
        } else {
            tracing::info!(target: "host", "{}", message);
        }
    }

    fn frame_swapped(&self) {
        self.swaps.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_host_counts() {
        let host = TracingHost::new();
        host.frame_swapped();
        host.frame_swapped();
        host.log("Renderer init failed", true);
        host.log("hello", false);
        assert_eq!(host.swap_count(), 2);
        assert_eq!(host.fatal_count(), 1);
    }
}
