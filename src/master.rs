//! The master-side transport wrapper: query/answer correlation on top of a
//! transceiver.
//!
//! A Modbus serial bus carries at most one master transaction at a time, so
//! the transport serializes callers through a single-permit semaphore
//! (FIFO — tokio queues waiters in arrival order, so concurrent queries
//! neither interleave on the bus nor overtake each other). Within a
//! transaction the master subscribes to the frame event stream *before*
//! transmitting, so an answer arriving faster than the scheduler resumes the
//! caller can never be missed, then races the first matching frame against
//! the deadline, the link lifecycle and the caller's cancellation token.
//!
//! A frame answers the pending query when its address equals the queried
//! unit and its function code equals the queried one ignoring the 0x80
//! exception bit — an exception response is still the answer; interpreting
//! it is the PDU layer's business. Frames from other units or with foreign
//! function codes are somebody else's traffic and are skipped without
//! consuming the deadline.
//!
//! Broadcast writes expect no answer by construction; `no_answer` returns as
//! soon as the frame left the port.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Semaphore;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::ascii::AsciiTransceiver;
use crate::error::{ModbusError, ModbusResult};
use crate::frame::SerialFrame;
use crate::rtu::RtuTransceiver;
use crate::transceiver::Transceiver;

/// Modbus master over an RTU link.
pub type RtuMaster = MasterTransport<RtuTransceiver>;

/// Modbus master over an ASCII link.
pub type AsciiMaster = MasterTransport<AsciiTransceiver>;

/// Generic master transport over any frame transceiver.
pub struct MasterTransport<T: Transceiver> {
    transceiver: T,
    admission: Arc<Semaphore>,
}

impl<T: Transceiver> std::fmt::Debug for MasterTransport<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterTransport").finish_non_exhaustive()
    }
}

impl<T: Transceiver> MasterTransport<T> {
    /// Wrap a transceiver; the master takes ownership of the link.
    pub fn new(transceiver: T) -> Self {
        Self {
            transceiver,
            admission: Arc::new(Semaphore::new(1)),
        }
    }

    /// The underlying transceiver (bus counters, state watching).
    pub fn transceiver(&self) -> &T {
        &self.transceiver
    }

    /// Send a query and wait for the matching answer.
    ///
    /// `timeout` bounds the wait for the answer only, not the wait for bus
    /// admission; `None` waits indefinitely (until close or cancellation).
    /// Returns the first frame whose address equals `unit_id` and whose
    /// function code equals `function` modulo the 0x80 exception bit.
    pub async fn query(
        &self,
        unit_id: u8,
        function: u8,
        data: Vec<u8>,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> ModbusResult<T::Frame> {
        let frame = T::Frame::new(unit_id, function, data)?;
        let _permit = self.admit(cancel).await?;

        // Subscribe before transmitting: the answer must not be able to win
        // the race against our own subscription.
        let mut events = self.transceiver.subscribe();
        let mut state = self.transceiver.watch_state();
        self.transceiver.transmit(frame, cancel).await?;

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(ModbusError::cancelled("master query"));
                }
                _ = state.wait_for(|s| s.is_closing()) => {
                    return Err(ModbusError::invalid_operation(
                        "transceiver closed while waiting for an answer",
                    ));
                }
                _ = expire(deadline) => {
                    return Err(ModbusError::timeout(
                        format!("query to unit {unit_id}"),
                        timeout.map(|t| t.as_millis() as u64).unwrap_or(0),
                    ));
                }
                received = events.recv() => received,
            };

            match received {
                Ok(frame) => {
                    if frame.address() == unit_id
                        && frame.function() & 0x7F == function & 0x7F
                    {
                        return Ok(frame);
                    }
                    // Another unit's exchange on the shared bus.
                    debug!(
                        "ignoring frame from unit {} fn {:#04x} while querying unit {unit_id}",
                        frame.address(),
                        frame.function()
                    );
                }
                // Skipped ahead past frames we never got to inspect; any
                // answer among them is lost, so keep waiting for the retry
                // window (the deadline still bounds us).
                Err(RecvError::Lagged(missed)) => {
                    debug!("frame event stream lagged, {missed} frames skipped");
                }
                Err(RecvError::Closed) => {
                    return Err(ModbusError::invalid_operation(
                        "transceiver closed while waiting for an answer",
                    ));
                }
            }
        }
    }

    /// Send a query expecting no answer (broadcast writes).
    ///
    /// Returns once the frame has been written to the port.
    pub async fn no_answer(
        &self,
        unit_id: u8,
        function: u8,
        data: Vec<u8>,
        cancel: &CancellationToken,
    ) -> ModbusResult<()> {
        let frame = T::Frame::new(unit_id, function, data)?;
        let _permit = self.admit(cancel).await?;
        self.transceiver.transmit(frame, cancel).await
    }

    /// True once the underlying link reached its terminal state.
    pub fn is_closed(&self) -> bool {
        self.transceiver.is_closed()
    }

    /// Suspend until the underlying link is closed.
    pub async fn wait(&self, cancel: &CancellationToken) -> ModbusResult<()> {
        self.transceiver.wait(cancel).await
    }

    /// Close the underlying link. Graceful close lets an in-flight exchange
    /// finish its transmission first.
    pub async fn close(&self, forcibly: bool) -> ModbusResult<()> {
        self.transceiver.close(forcibly).await
    }

    /// Wait for the bus admission permit, racing the cancellation token.
    async fn admit(
        &self,
        cancel: &CancellationToken,
    ) -> ModbusResult<tokio::sync::OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ModbusError::cancelled("bus admission")),
            permit = self.admission.clone().acquire_owned() => {
                permit.map_err(|_| ModbusError::internal("admission semaphore closed"))
            }
        }
    }
}

/// Resolves at the deadline; pends forever when there is none.
async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => futures::future::pending().await,
    }
}
