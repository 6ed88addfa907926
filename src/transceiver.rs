//! The common transceiver contract shared by the RTU and ASCII links.
//!
//! A transceiver owns one serial port for its lifetime and runs one
//! cooperative link task that multiplexes reception, transmission and
//! lifecycle signals at explicit await points. The public handle exposes:
//!
//! - `transmit`: enqueue one frame; at most one frame is pending
//!   transmission at any time, so a second caller waits until the slot is
//!   free (FIFO backpressure, no reordering).
//! - `subscribe`: a broadcast stream carrying every validated inbound frame.
//!   Subscriptions are expected to be short-lived — the master opens one per
//!   in-flight query and drops it on match or cancellation.
//! - `wait` / `close` / `is_closed`: lifecycle. Graceful close drains
//!   in-flight work before the port is disposed; forced close aborts at the
//!   link task's next wait point.

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{ModbusError, ModbusResult};
use crate::frame::SerialFrame;
use crate::link::{LinkLifecycle, LinkState};

/// Capacity of the inbound frame broadcast channel.
///
/// Slow subscribers observe a lag error and skip ahead; the bus itself
/// provides no replay, so buffering more would only hide a stuck consumer.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Asynchronous frame transceiver over one serial port.
#[async_trait]
pub trait Transceiver: Send + Sync + 'static {
    /// The frame type of this encapsulation.
    type Frame: SerialFrame;

    /// Enqueue one frame for transmission and wait until the link task has
    /// written it to the port.
    ///
    /// Fails with `InvalidOperation` when the transceiver is closing or
    /// closed, `Io` when the port write fails, and `Cancelled` when the
    /// token fires first (the frame may still be transmitted in that case —
    /// cancellation abandons the wait, not the queue slot).
    async fn transmit(
        &self,
        frame: Self::Frame,
        cancel: &CancellationToken,
    ) -> ModbusResult<()>;

    /// Subscribe to validated inbound frames.
    fn subscribe(&self) -> broadcast::Receiver<Self::Frame>;

    /// Observe lifecycle transitions.
    fn watch_state(&self) -> watch::Receiver<LinkState>;

    /// True once the transceiver reached its terminal state.
    fn is_closed(&self) -> bool;

    /// Suspend until the transceiver is closed.
    async fn wait(&self, cancel: &CancellationToken) -> ModbusResult<()>;

    /// Request a close and wait for the terminal state. Graceful close
    /// (`forcibly == false`) lets in-flight reception and queued
    /// transmission finish first; a frame whose reception was already under
    /// way may therefore still be surfaced to subscribers after the close
    /// was requested. Idempotent.
    async fn close(&self, forcibly: bool) -> ModbusResult<()>;
}

/// One queued outbound frame plus the completion channel its submitter is
/// waiting on.
pub(crate) struct TxRequest<F> {
    pub frame: F,
    pub done: oneshot::Sender<ModbusResult<()>>,
}

/// Shared `transmit` implementation: one-slot submission with cancellation
/// and lifecycle races, then a wait for the link task's write result.
pub(crate) async fn submit_frame<F: Send>(
    slot: &mpsc::Sender<TxRequest<F>>,
    lifecycle: &LinkLifecycle,
    frame: F,
    cancel: &CancellationToken,
) -> ModbusResult<()> {
    if lifecycle.is_closing() {
        return Err(ModbusError::invalid_operation(
            "transceiver is closing or closed",
        ));
    }

    let (done_tx, done_rx) = oneshot::channel();
    let mut state = lifecycle.watch();

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            return Err(ModbusError::cancelled("frame transmit"));
        }
        _ = state.wait_for(|s| s.is_closing()) => {
            return Err(ModbusError::invalid_operation(
                "transceiver closed while waiting for the transmit slot",
            ));
        }
        res = slot.send(TxRequest { frame, done: done_tx }) => {
            res.map_err(|_| ModbusError::invalid_operation("transceiver is closed"))?;
        }
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ModbusError::cancelled("frame transmit")),
        res = done_rx => match res {
            Ok(result) => result,
            Err(_) => Err(ModbusError::invalid_operation(
                "transceiver closed before the frame was transmitted",
            )),
        },
    }
}

/// Shared `wait` implementation.
pub(crate) async fn wait_closed(
    lifecycle: &LinkLifecycle,
    cancel: &CancellationToken,
) -> ModbusResult<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ModbusError::cancelled("wait for close")),
        _ = lifecycle.closed() => Ok(()),
    }
}

/// Shared `close` implementation: request, then await the terminal state.
pub(crate) async fn close_link(lifecycle: &LinkLifecycle, forcibly: bool) -> ModbusResult<()> {
    lifecycle.request_close(forcibly);
    lifecycle.closed().await;
    Ok(())
}
