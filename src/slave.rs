//! The slave-side transport wrapper: queries become transactions that are
//! answered or ignored exactly once.
//!
//! A serial slave must finish serving one query before it looks at the next,
//! so the intake task acquires a single-token gate *before* reading a frame
//! from the event stream. The token travels inside the [`Transaction`] and
//! is released only when the transaction resolves; until then no further
//! query is taken off the bus. Because of the gate there is at most one
//! unresolved transaction at any time.
//!
//! A transaction resolves exactly once, whichever comes first:
//!
//! - `answer` transmits a reply reusing the query's address and marks the
//!   transaction `Complete` (or `CompleteWithError` when the write fails),
//! - `ignore` marks it `Complete` without transmitting (queries addressed to
//!   another unit, broadcasts),
//! - closing the transport marks it `Cancelled`.
//!
//! Later calls observe `InvalidOperation` (a second `answer`) or are no-ops
//! (`ignore`); the terminal state never changes once set.

use std::sync::{Arc, Mutex, Weak};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::ascii::AsciiTransceiver;
use crate::error::{ModbusError, ModbusResult};
use crate::frame::SerialFrame;
use crate::rtu::RtuTransceiver;
use crate::transceiver::Transceiver;

/// Modbus slave over an RTU link.
pub type RtuSlave = SlaveTransport<RtuTransceiver>;

/// Modbus slave over an ASCII link.
pub type AsciiSlave = SlaveTransport<AsciiTransceiver>;

/// Resolution state of a slave transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Not yet answered, ignored or cancelled.
    Incomplete,
    /// The transport closed before the transaction was resolved.
    Cancelled,
    /// Answered (reply transmitted) or deliberately ignored.
    Complete,
    /// An answer was attempted but the transmission failed.
    CompleteWithError,
}

impl TransactionState {
    /// True once the transaction can no longer change state.
    pub fn is_terminal(self) -> bool {
        self != TransactionState::Incomplete
    }
}

struct TransactionInner<T: Transceiver> {
    query: T::Frame,
    state: watch::Sender<TransactionState>,
    /// The intake gate token; taken by whichever resolution happens first.
    permit: Mutex<Option<OwnedSemaphorePermit>>,
    transceiver: Arc<T>,
}

impl<T: Transceiver> TransactionInner<T> {
    /// First terminal state wins; the permit is released alongside it.
    fn resolve(&self, to: TransactionState, permit: OwnedSemaphorePermit) {
        self.state.send_if_modified(|state| {
            if *state == TransactionState::Incomplete {
                *state = to;
                true
            } else {
                false
            }
        });
        drop(permit);
    }

    /// Called on transport close for the outstanding transaction, if any.
    fn cancel(&self) {
        if let Some(permit) = self.permit.lock().unwrap_or_else(|e| e.into_inner()).take() {
            self.resolve(TransactionState::Cancelled, permit);
        }
    }
}

/// One received query awaiting its resolution.
pub struct Transaction<T: Transceiver> {
    inner: Arc<TransactionInner<T>>,
}

impl<T: Transceiver> std::fmt::Debug for Transaction<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction").finish_non_exhaustive()
    }
}

impl<T: Transceiver> Clone for Transaction<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transceiver> Transaction<T> {
    /// The query frame as received from the bus.
    pub fn query(&self) -> &T::Frame {
        &self.inner.query
    }

    /// Current resolution state.
    pub fn state(&self) -> TransactionState {
        *self.inner.state.borrow()
    }

    /// Suspend until the transaction reaches a terminal state.
    pub async fn wait(&self, cancel: &CancellationToken) -> ModbusResult<TransactionState> {
        let mut rx = self.inner.state.subscribe();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ModbusError::cancelled("transaction wait")),
            res = rx.wait_for(|s| s.is_terminal()) => {
                res.map(|s| *s)
                    .map_err(|_| ModbusError::internal("transaction state channel closed"))
            }
        }
    }

    /// Transmit a reply to this query and resolve the transaction.
    ///
    /// The reply reuses the query's address; `function` may carry the 0x80
    /// exception bit. Fails with `InvalidOperation` when the transaction was
    /// already resolved.
    pub async fn answer(
        &self,
        function: u8,
        data: Vec<u8>,
        cancel: &CancellationToken,
    ) -> ModbusResult<()> {
        let reply = T::Frame::new(self.inner.query.address(), function, data)?;
        let permit = self
            .inner
            .permit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| ModbusError::invalid_operation("transaction already resolved"))?;

        let result = self.inner.transceiver.transmit(reply, cancel).await;
        let state = if result.is_ok() {
            TransactionState::Complete
        } else {
            TransactionState::CompleteWithError
        };
        self.inner.resolve(state, permit);
        result
    }

    /// Resolve the transaction without transmitting anything.
    ///
    /// For queries addressed to another unit and for broadcasts, which must
    /// never be answered. A no-op on an already resolved transaction.
    pub fn ignore(&self) {
        if let Some(permit) = self
            .inner
            .permit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            self.inner.resolve(TransactionState::Complete, permit);
        }
    }
}

/// Generic slave transport over any frame transceiver.
pub struct SlaveTransport<T: Transceiver> {
    transceiver: Arc<T>,
    queue: tokio::sync::Mutex<mpsc::UnboundedReceiver<Transaction<T>>>,
}

impl<T: Transceiver> SlaveTransport<T> {
    /// Wrap a transceiver and start the query intake task.
    pub fn new(transceiver: T) -> Self {
        let transceiver = Arc::new(transceiver);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        let intake = Intake {
            transceiver: transceiver.clone(),
            gate: Arc::new(Semaphore::new(1)),
            outstanding: Arc::new(Mutex::new(Weak::new())),
            queue: queue_tx,
        };
        tokio::spawn(intake.run());

        Self {
            transceiver,
            queue: tokio::sync::Mutex::new(queue_rx),
        }
    }

    /// The underlying transceiver (bus counters, state watching).
    pub fn transceiver(&self) -> &T {
        &self.transceiver
    }

    /// Receive the next query as a transaction, in bus order.
    ///
    /// Fails with `InvalidOperation` once the transport is closed and no
    /// queries remain, and with `Cancelled` when the token fires first.
    pub async fn poll(&self, cancel: &CancellationToken) -> ModbusResult<Transaction<T>> {
        let mut queue = self.queue.lock().await;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ModbusError::cancelled("slave poll")),
            transaction = queue.recv() => transaction.ok_or_else(|| {
                ModbusError::invalid_operation("transceiver is closed")
            }),
        }
    }

    /// True once the underlying link reached its terminal state.
    pub fn is_closed(&self) -> bool {
        self.transceiver.is_closed()
    }

    /// Suspend until the underlying link is closed.
    pub async fn wait(&self, cancel: &CancellationToken) -> ModbusResult<()> {
        self.transceiver.wait(cancel).await
    }

    /// Close the underlying link. The outstanding transaction, if any, is
    /// marked `Cancelled`.
    pub async fn close(&self, forcibly: bool) -> ModbusResult<()> {
        self.transceiver.close(forcibly).await
    }
}

/// The intake task: turns inbound frames into gated transactions.
struct Intake<T: Transceiver> {
    transceiver: Arc<T>,
    gate: Arc<Semaphore>,
    /// The (at most one) unresolved transaction, cancelled on close.
    outstanding: Arc<Mutex<Weak<TransactionInner<T>>>>,
    queue: mpsc::UnboundedSender<Transaction<T>>,
}

impl<T: Transceiver> Intake<T> {
    async fn run(self) {
        let mut events = self.transceiver.subscribe();
        let mut state = self.transceiver.watch_state();

        loop {
            // The gate comes first: the next frame is not even read until
            // the previous transaction has been resolved.
            let permit = tokio::select! {
                biased;
                _ = state.wait_for(|s| s.is_closing()) => break,
                permit = self.gate.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let query = tokio::select! {
                biased;
                _ = state.wait_for(|s| s.is_closing()) => break,
                received = events.recv() => match received {
                    Ok(frame) => frame,
                    Err(RecvError::Lagged(missed)) => {
                        debug!("query stream lagged, {missed} frames skipped");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };

            let (state_tx, _) = watch::channel(TransactionState::Incomplete);
            let inner = Arc::new(TransactionInner {
                query,
                state: state_tx,
                permit: Mutex::new(Some(permit)),
                transceiver: self.transceiver.clone(),
            });
            *self.outstanding.lock().unwrap_or_else(|e| e.into_inner()) =
                Arc::downgrade(&inner);

            if self.queue.send(Transaction { inner }).is_err() {
                // The transport handle is gone; nobody will ever poll.
                break;
            }
        }

        if let Some(inner) = self
            .outstanding
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .upgrade()
        {
            inner.cancel();
        }
    }
}
