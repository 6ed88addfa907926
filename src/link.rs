//! Shared lifecycle plumbing for transceivers and transports.
//!
//! Every transceiver (and the master/slave wrapper around it) moves through
//! the same terminal progression: open, then close-requested or
//! terminate-requested, then closed. The progression is monotone — a link
//! never reopens — and is published on a watch channel so the link task and
//! any number of waiting callers observe transitions at their next await
//! point.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;

/// Lifecycle state of a serial link. Ordered: a link only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LinkState {
    /// Operating normally.
    Open,
    /// Graceful close requested; in-flight reception and queued transmission
    /// finish before the port is disposed.
    Closing,
    /// Forced close requested; the link task aborts at its next wait point.
    Terminating,
    /// Terminal. The port has been disposed.
    Closed,
}

impl LinkState {
    /// True once any close has been requested (or completed).
    pub fn is_closing(self) -> bool {
        self >= LinkState::Closing
    }
}

/// Watch-channel holder for a link's lifecycle state.
///
/// Shared between the public handle and the link task; transitions are
/// monotone, so a stale request (closing an already-terminating link) is a
/// no-op rather than a regression.
#[derive(Debug)]
pub struct LinkLifecycle {
    state: watch::Sender<LinkState>,
}

impl LinkLifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(LinkState::Open);
        Self { state }
    }

    /// Current state.
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// True once the link reached its terminal state.
    pub fn is_closed(&self) -> bool {
        self.state() == LinkState::Closed
    }

    /// True once any close has been requested.
    pub fn is_closing(&self) -> bool {
        self.state().is_closing()
    }

    /// Request a close. `forcibly` escalates a pending graceful close.
    pub fn request_close(&self, forcibly: bool) {
        let target = if forcibly {
            LinkState::Terminating
        } else {
            LinkState::Closing
        };
        self.state.send_if_modified(|state| {
            if *state < target && *state != LinkState::Closed {
                *state = target;
                true
            } else {
                false
            }
        });
    }

    /// Mark the link terminal. Called once by the link task after disposing
    /// the port.
    pub fn mark_closed(&self) {
        self.state.send_if_modified(|state| {
            if *state != LinkState::Closed {
                *state = LinkState::Closed;
                true
            } else {
                false
            }
        });
    }

    /// Subscribe to state transitions.
    pub fn watch(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Suspend until the link is closed.
    pub async fn closed(&self) {
        let mut rx = self.watch();
        // The sender lives as long as `self`, so wait_for cannot fail here.
        let _ = rx.wait_for(|state| *state == LinkState::Closed).await;
    }
}

impl Default for LinkLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Diagnostic counter that saturates at `u64::MAX` instead of wrapping.
///
/// Bus counters are cumulative over the life of a transceiver; on overflow
/// they pin at the maximum rather than silently restarting from zero.
#[derive(Debug, Default)]
pub struct SaturatingCounter(AtomicU64);

impl SaturatingCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment by one, saturating at `u64::MAX`.
    pub fn increment(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                v.checked_add(1)
            });
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Reset to zero.
    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}
