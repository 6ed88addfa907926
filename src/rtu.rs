//! Modbus RTU transceiver: the timing-driven reception state machine and
//! its transmit path.
//!
//! RTU has no start or end delimiter byte; frame boundaries exist only as
//! silence on the bus. The link task therefore runs the classic five-state
//! machine from the Modbus serial-line specification:
//!
//! ```text
//! INIT ──3.5t silence──▶ IDLE ──char──▶ RECEPTION ──1.5t gap──▶ CTRLWAIT
//!   ▲                      │ ▲                                     │
//!   └──char restarts       │ └────────────3.5t total silence───────┘
//!      the wait            └──frame queued──▶ EMISSION ──3.5t settle──┐
//!                                ▲────────────────────────────────────┘
//! ```
//!
//! - **INIT** synchronizes with an already-active bus: any character
//!   restarts the wait, and only 3.5 character-times of silence admit the
//!   transceiver to IDLE. The transceiver never transmits before that.
//! - **RECEPTION** appends each character and re-arms the 1.5t deadline;
//!   when it fires, the frame's main bytes are over.
//! - **CTRLWAIT** waits out the remaining silence up to 3.5t. A character
//!   arriving here sits in the forbidden 1.5t–3.5t window and forcibly
//!   marks the frame NOK. On 3.5t of total silence the frame is finalized:
//!   NOK or short frames are counted and dropped, everything else is CRC
//!   checked and, only if the residue is zero, surfaced as a frame event.
//! - **EMISSION** writes the raw frame and then holds the bus-settle gap of
//!   3.5t before returning to IDLE.
//!
//! The two deadlines are independent monotonic-clock instants re-armed from
//! the last character's arrival time; there are no tick callbacks. A
//! graceful close lets the state machine finish what it is doing and drains
//! the transmit slot; a forced close aborts at the next wait point. Either
//! way the port is disposed exactly once, when the link task ends.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::checksum::Crc16;
use crate::error::ModbusResult;
use crate::frame::RtuFrame;
use crate::link::{LinkLifecycle, LinkState, SaturatingCounter};
use crate::port::{RxChar, SerialPort};
use crate::timing::SerialTimings;
use crate::transceiver::{
    close_link, submit_frame, wait_closed, Transceiver, TxRequest, EVENT_CHANNEL_CAPACITY,
};
use crate::util::format_hex;

/// Diagnostic bus counters per the Modbus serial-line conventions.
///
/// Cumulative and saturating; not correctness-critical, but exact. Only the
/// RTU encapsulation maintains them.
#[derive(Debug, Default)]
pub struct RtuBusCounters {
    messages: SaturatingCounter,
    comm_errors: SaturatingCounter,
    overruns: SaturatingCounter,
}

impl RtuBusCounters {
    /// Read all three counters at once.
    pub fn snapshot(&self) -> RtuBusCounterSnapshot {
        RtuBusCounterSnapshot {
            messages: self.messages.get(),
            comm_errors: self.comm_errors.get(),
            overruns: self.overruns.get(),
        }
    }

    /// Reset all three counters to zero.
    pub fn reset(&self) {
        self.messages.reset();
        self.comm_errors.reset();
        self.overruns.reset();
    }
}

/// Point-in-time view of the bus counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RtuBusCounterSnapshot {
    /// CRC-clean frames surfaced as events.
    pub messages: u64,
    /// Frames dropped for NOK characters, short length or CRC mismatch.
    pub comm_errors: u64,
    /// Frames during which the driver reported a character overrun.
    pub overruns: u64,
}

/// Modbus RTU frame transceiver over one serial port.
pub struct RtuTransceiver {
    tx_slot: mpsc::Sender<TxRequest<RtuFrame>>,
    events: broadcast::Sender<RtuFrame>,
    lifecycle: Arc<LinkLifecycle>,
    counters: Arc<RtuBusCounters>,
}

impl RtuTransceiver {
    /// Take ownership of an open port and start the link task.
    ///
    /// `scale` stretches the character-time unit (1..=512) for busses with
    /// slow converters; 1 is the nominal Modbus timing.
    pub fn new(port: Box<dyn SerialPort>, scale: u16) -> ModbusResult<Self> {
        let timings = SerialTimings::new(&port.options(), scale)?;
        let (tx_slot, tx_queue) = mpsc::channel(1);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let lifecycle = Arc::new(LinkLifecycle::new());
        let counters = Arc::new(RtuBusCounters::default());

        let link = RtuLink {
            port,
            timings,
            tx_queue,
            events: events.clone(),
            lifecycle: lifecycle.clone(),
            counters: counters.clone(),
        };
        tokio::spawn(link.run());

        Ok(Self {
            tx_slot,
            events,
            lifecycle,
            counters,
        })
    }

    /// Read the diagnostic bus counters.
    pub fn counters(&self) -> RtuBusCounterSnapshot {
        self.counters.snapshot()
    }

    /// Reset the diagnostic bus counters.
    pub fn reset_counters(&self) {
        self.counters.reset();
    }
}

#[async_trait]
impl Transceiver for RtuTransceiver {
    type Frame = RtuFrame;

    async fn transmit(&self, frame: RtuFrame, cancel: &CancellationToken) -> ModbusResult<()> {
        submit_frame(&self.tx_slot, &self.lifecycle, frame, cancel).await
    }

    fn subscribe(&self) -> broadcast::Receiver<RtuFrame> {
        self.events.subscribe()
    }

    fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.lifecycle.watch()
    }

    fn is_closed(&self) -> bool {
        self.lifecycle.is_closed()
    }

    async fn wait(&self, cancel: &CancellationToken) -> ModbusResult<()> {
        wait_closed(&self.lifecycle, cancel).await
    }

    async fn close(&self, forcibly: bool) -> ModbusResult<()> {
        close_link(&self.lifecycle, forcibly).await
    }
}

/// Continue or shut the link task down.
enum Flow {
    Continue,
    Exit,
}

/// What woke the IDLE state.
enum IdleEvent {
    Lifecycle,
    Tx(Option<TxRequest<RtuFrame>>),
    Rx(ModbusResult<RxChar>),
}

/// The link task: owns the port and runs the state machine until close.
struct RtuLink {
    port: Box<dyn SerialPort>,
    timings: SerialTimings,
    tx_queue: mpsc::Receiver<TxRequest<RtuFrame>>,
    events: broadcast::Sender<RtuFrame>,
    lifecycle: Arc<LinkLifecycle>,
    counters: Arc<RtuBusCounters>,
}

impl RtuLink {
    async fn run(mut self) {
        let mut state = self.lifecycle.watch();
        if let Flow::Continue = self.synchronize(&mut state).await {
            self.idle_loop(&mut state).await;
        }
        // The port is owned by this task and dropped exactly once, here.
        debug!("RTU link closed");
        self.lifecycle.mark_closed();
    }

    /// INIT: wait for 3.5t of silence before touching the bus. Characters
    /// restart the wait — the bus is busy or in an unknown state.
    async fn synchronize(&mut self, state: &mut watch::Receiver<LinkState>) -> Flow {
        loop {
            let deadline = Instant::now() + self.timings.inter_frame();
            let event = tokio::select! {
                biased;
                _ = state.wait_for(|s| s.is_closing()) => Some(Flow::Exit),
                res = self.port.recv() => match res {
                    Ok(_) => None,
                    Err(e) => {
                        error!("serial port failed during synchronization: {e}");
                        Some(Flow::Exit)
                    }
                },
                _ = sleep_until(deadline) => Some(Flow::Continue),
            };
            if let Some(flow) = event {
                return flow;
            }
        }
    }

    /// IDLE: wake on lifecycle changes, a queued outgoing frame, or the
    /// first character of an inbound frame.
    async fn idle_loop(&mut self, state: &mut watch::Receiver<LinkState>) {
        loop {
            let event = tokio::select! {
                biased;
                _ = state.wait_for(|s| s.is_closing()) => IdleEvent::Lifecycle,
                req = self.tx_queue.recv() => IdleEvent::Tx(req),
                res = self.port.recv() => IdleEvent::Rx(res),
            };

            match event {
                IdleEvent::Lifecycle => {
                    if self.lifecycle.state() == LinkState::Closing {
                        self.drain_transmit_queue(state).await;
                    }
                    return;
                }
                // All handles dropped: nothing can reach this link anymore.
                IdleEvent::Tx(None) => return,
                IdleEvent::Tx(Some(req)) => {
                    if let Flow::Exit = self.emission(state, req).await {
                        return;
                    }
                }
                IdleEvent::Rx(Ok(first)) => {
                    if let Flow::Exit = self.reception(state, first).await {
                        return;
                    }
                }
                IdleEvent::Rx(Err(e)) => {
                    error!("serial port failure: {e}");
                    return;
                }
            }
        }
    }

    /// Graceful close: frames already accepted into the transmit slot still
    /// go out before the port is disposed.
    async fn drain_transmit_queue(&mut self, state: &mut watch::Receiver<LinkState>) {
        while let Ok(req) = self.tx_queue.try_recv() {
            if let Flow::Exit = self.emission(state, req).await {
                return;
            }
        }
    }

    /// EMISSION: write the raw frame, then hold the 3.5t bus-settle gap.
    async fn emission(
        &mut self,
        state: &mut watch::Receiver<LinkState>,
        req: TxRequest<RtuFrame>,
    ) -> Flow {
        let raw = req.frame.encode();
        trace!("RTU send {}", format_hex(&raw));

        let result = tokio::select! {
            biased;
            _ = state.wait_for(|s| *s == LinkState::Terminating) => {
                drop(req.done);
                return Flow::Exit;
            }
            res = self.port.send(&raw) => res,
        };
        if let Err(e) = &result {
            warn!("RTU frame transmission failed: {e}");
        }
        let _ = req.done.send(result);

        let deadline = Instant::now() + self.timings.inter_frame();
        tokio::select! {
            biased;
            _ = state.wait_for(|s| *s == LinkState::Terminating) => Flow::Exit,
            _ = sleep_until(deadline) => Flow::Continue,
        }
    }

    /// RECEPTION and CTRLWAIT: accumulate one raw frame bounded by the two
    /// character-gap deadlines, then finalize it.
    ///
    /// Only a forced close aborts mid-frame; a graceful one lets the frame
    /// complete first.
    async fn reception(
        &mut self,
        state: &mut watch::Receiver<LinkState>,
        first: RxChar,
    ) -> Flow {
        let mut frame = FrameInProgress::new();
        frame.absorb(first);
        let mut last_char = Instant::now();

        // RECEPTION: each character re-arms the 1.5t deadline.
        loop {
            let deadline = last_char + self.timings.inter_character();
            let event = tokio::select! {
                biased;
                _ = state.wait_for(|s| *s == LinkState::Terminating) => return Flow::Exit,
                res = self.port.recv() => Some(res),
                _ = sleep_until(deadline) => None,
            };
            match event {
                Some(Ok(ch)) => {
                    frame.absorb(ch);
                    last_char = Instant::now();
                }
                Some(Err(e)) => {
                    error!("serial port failure during reception: {e}");
                    return Flow::Exit;
                }
                None => break,
            }
        }

        // CTRLWAIT: a character in the 1.5t–3.5t window poisons the frame;
        // 3.5t of total silence since the last character finalizes it.
        loop {
            let deadline = last_char + self.timings.inter_frame();
            let event = tokio::select! {
                biased;
                _ = state.wait_for(|s| *s == LinkState::Terminating) => return Flow::Exit,
                res = self.port.recv() => Some(res),
                _ = sleep_until(deadline) => None,
            };
            match event {
                Some(Ok(ch)) => {
                    frame.intrude(ch);
                    last_char = Instant::now();
                }
                Some(Err(e)) => {
                    error!("serial port failure during reception: {e}");
                    return Flow::Exit;
                }
                None => break,
            }
        }

        self.finalize(frame);
        Flow::Continue
    }

    /// Count and drop bad frames; surface CRC-clean ones as events.
    fn finalize(&self, frame: FrameInProgress) {
        if frame.overrun {
            self.counters.overruns.increment();
        }
        // A frame under the 4-byte minimum is a line error by definition and
        // is never checksum-checked.
        if frame.nok || frame.buffer.len() < 4 {
            self.counters.comm_errors.increment();
            debug!("RTU drop {} (line error)", format_hex(&frame.buffer));
            return;
        }
        if frame.crc.finalize() != 0 {
            self.counters.comm_errors.increment();
            debug!("RTU drop {} (CRC mismatch)", format_hex(&frame.buffer));
            return;
        }
        let raw = frame.buffer;
        match RtuFrame::new(raw[0], raw[1], raw[2..raw.len() - 2].to_vec()) {
            Ok(frame) => {
                trace!("RTU recv {}", format_hex(&raw));
                self.counters.messages.increment();
                // No subscribers is fine; events are fire-and-forget.
                let _ = self.events.send(frame);
            }
            Err(e) => {
                self.counters.comm_errors.increment();
                debug!("RTU drop {} ({e})", format_hex(&raw));
            }
        }
    }
}

/// One inbound frame being accumulated, with its running CRC and line
/// status.
struct FrameInProgress {
    buffer: Vec<u8>,
    /// Digested character by character as bytes land; a clean frame leaves
    /// the zero residue since the wire CRC is part of the input.
    crc: Crc16,
    nok: bool,
    overrun: bool,
}

impl FrameInProgress {
    fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(crate::MAX_RTU_FRAME_SIZE),
            crc: Crc16::new(),
            nok: false,
            overrun: false,
        }
    }

    /// Append one character during RECEPTION, folding its line status into
    /// the cumulative NOK flag.
    fn absorb(&mut self, ch: RxChar) {
        if self.buffer.len() < crate::MAX_RTU_FRAME_SIZE {
            self.buffer.push(ch.byte);
            self.crc.update(ch.byte);
        } else {
            self.nok = true;
        }
        if !ch.valid {
            self.nok = true;
        }
        if ch.overrun {
            self.nok = true;
            self.overrun = true;
        }
    }

    /// A character in the forbidden 1.5t–3.5t window: the frame is lost.
    fn intrude(&mut self, ch: RxChar) {
        self.nok = true;
        if ch.overrun {
            self.overrun = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::SerialFrame;
    use crate::port::{DataBits, Parity, SerialPortOptions, StopBits};
    use crate::ModbusError;
    use std::time::Duration;

    struct ScriptedPort {
        rx: mpsc::UnboundedReceiver<RxChar>,
        tx: mpsc::UnboundedSender<Vec<u8>>,
        options: SerialPortOptions,
    }

    #[async_trait]
    impl SerialPort for ScriptedPort {
        async fn recv(&mut self) -> ModbusResult<RxChar> {
            self.rx
                .recv()
                .await
                .ok_or_else(|| ModbusError::io("scripted port closed"))
        }

        async fn send(&mut self, bytes: &[u8]) -> ModbusResult<()> {
            self.tx
                .send(bytes.to_vec())
                .map_err(|_| ModbusError::io("scripted port closed"))
        }

        fn options(&self) -> SerialPortOptions {
            self.options
        }
    }

    fn harness() -> (
        RtuTransceiver,
        mpsc::UnboundedSender<RxChar>,
        mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let (rx_tx, rx_rx) = mpsc::unbounded_channel();
        let (tx_tx, tx_rx) = mpsc::unbounded_channel();
        let port = ScriptedPort {
            rx: rx_rx,
            tx: tx_tx,
            options: SerialPortOptions {
                baud_rate: 9600,
                data_bits: DataBits::Eight,
                stop_bits: StopBits::One,
                parity: Parity::None,
            },
        };
        let transceiver = RtuTransceiver::new(Box::new(port), 1).unwrap();
        (transceiver, rx_tx, tx_rx)
    }

    fn feed(line: &mpsc::UnboundedSender<RxChar>, bytes: &[u8]) {
        for &b in bytes {
            line.send(RxChar::clean(b)).unwrap();
        }
    }

    /// The same 9600 8N1 timings the harness port reports.
    fn nominal_timings() -> SerialTimings {
        SerialTimings::new(
            &SerialPortOptions {
                baud_rate: 9600,
                data_bits: DataBits::Eight,
                stop_bits: StopBits::One,
                parity: Parity::None,
            },
            1,
        )
        .unwrap()
    }

    /// Longer than any deadline in these tests; paused time makes it cheap.
    const SETTLE: Duration = Duration::from_millis(50);

    /// Let the link leave INIT; characters fed before the initial 3.5t of
    /// silence would be treated as bus-busy noise and discarded.
    async fn until_idle() {
        tokio::time::sleep(SETTLE).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_discards_traffic_until_the_bus_goes_quiet() {
        let (transceiver, line, _tx_out) = harness();
        let mut events = transceiver.subscribe();

        // A perfectly valid frame on a bus we have not synchronized with
        // yet: every character just restarts the 3.5t wait.
        feed(&line, &[0x01, 0x03, 0x00, 0x00, 0x00, 0x08, 0x44, 0x0C]);
        tokio::time::sleep(Duration::from_millis(2)).await;
        line.send(RxChar::clean(0xFF)).unwrap();
        tokio::time::sleep(SETTLE).await;

        assert!(events.try_recv().is_err());
        let counters = transceiver.counters();
        assert_eq!(counters.messages, 0);
        assert_eq!(counters.comm_errors, 0);

        // Quiet long enough: the same frame now goes through reception.
        feed(&line, &[0x01, 0x03, 0x00, 0x00, 0x00, 0x08, 0x44, 0x0C]);
        let frame = events.recv().await.unwrap();
        assert_eq!(frame.address(), 0x01);
        assert_eq!(transceiver.counters().messages, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_frame_is_received() {
        let (transceiver, line, _tx_out) = harness();
        let mut events = transceiver.subscribe();
        until_idle().await;

        feed(&line, &[0x01, 0x03, 0x00, 0x00, 0x00, 0x08, 0x44, 0x0C]);

        let frame = events.recv().await.unwrap();
        assert_eq!(frame.address(), 0x01);
        assert_eq!(frame.function(), 0x03);
        assert_eq!(frame.data(), &[0x00, 0x00, 0x00, 0x08]);

        let counters = transceiver.counters();
        assert_eq!(counters.messages, 1);
        assert_eq!(counters.comm_errors, 0);
        assert_eq!(counters.overruns, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crc_mismatch_is_counted_and_dropped() {
        let (transceiver, line, _tx_out) = harness();
        let mut events = transceiver.subscribe();
        until_idle().await;

        feed(&line, &[0x01, 0x03, 0x00, 0x00, 0x00, 0x08, 0x44, 0x0D]);
        tokio::time::sleep(SETTLE).await;

        assert!(events.try_recv().is_err());
        let counters = transceiver.counters();
        assert_eq!(counters.messages, 0);
        assert_eq!(counters.comm_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_frame_is_a_line_error() {
        let (transceiver, line, _tx_out) = harness();
        until_idle().await;

        feed(&line, &[0x01, 0x03, 0x44]);
        tokio::time::sleep(SETTLE).await;

        assert_eq!(transceiver.counters().comm_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_character_poisons_frame() {
        let (transceiver, line, _tx_out) = harness();
        let mut events = transceiver.subscribe();
        until_idle().await;

        feed(&line, &[0x01, 0x03, 0x00, 0x00, 0x00, 0x08, 0x44]);
        line.send(RxChar {
            byte: 0x0C,
            valid: false,
            overrun: false,
        })
        .unwrap();
        tokio::time::sleep(SETTLE).await;

        assert!(events.try_recv().is_err());
        assert_eq!(transceiver.counters().comm_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrun_increments_both_counters() {
        let (transceiver, line, _tx_out) = harness();
        until_idle().await;

        line.send(RxChar {
            byte: 0x01,
            valid: true,
            overrun: true,
        })
        .unwrap();
        feed(&line, &[0x03, 0x00, 0x00, 0x00, 0x08, 0x44, 0x0C]);
        tokio::time::sleep(SETTLE).await;

        let counters = transceiver.counters();
        assert_eq!(counters.comm_errors, 1);
        assert_eq!(counters.overruns, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_character_in_ctrlwait_window_suppresses_frame() {
        let (transceiver, line, _tx_out) = harness();
        let mut events = transceiver.subscribe();

        until_idle().await;

        let timings = nominal_timings();

        feed(&line, &[0x01, 0x03, 0x00, 0x00, 0x00, 0x08, 0x44, 0x0C]);

        // Straggler between the 1.5t and 3.5t marks: forbidden window.
        let gap = timings.inter_character() + timings.unit() / 2;
        tokio::time::sleep(gap).await;
        line.send(RxChar::clean(0xFF)).unwrap();

        tokio::time::sleep(SETTLE).await;
        assert!(events.try_recv().is_err());
        let counters = transceiver.counters();
        assert_eq!(counters.messages, 0);
        assert_eq!(counters.comm_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_after_line_error() {
        let (transceiver, line, _tx_out) = harness();
        let mut events = transceiver.subscribe();
        until_idle().await;

        feed(&line, &[0xDE, 0xAD]);
        tokio::time::sleep(SETTLE).await;

        feed(&line, &[0x01, 0x03, 0x00, 0x00, 0x00, 0x08, 0x44, 0x0C]);
        let frame = events.recv().await.unwrap();
        assert_eq!(frame.address(), 0x01);

        let counters = transceiver.counters();
        assert_eq!(counters.messages, 1);
        assert_eq!(counters.comm_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transmit_writes_encoded_frame() {
        let (transceiver, _line, mut tx_out) = harness();
        let cancel = CancellationToken::new();

        let frame = RtuFrame::new(0x01, 0x03, vec![0x00, 0x00, 0x00, 0x08]).unwrap();
        transceiver.transmit(frame, &cancel).await.unwrap();

        let raw = tx_out.recv().await.unwrap();
        assert_eq!(raw, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x08, 0x44, 0x0C]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emission_holds_bus_settle_gap() {
        let (transceiver, _line, mut tx_out) = harness();
        let transceiver = Arc::new(transceiver);
        let cancel = CancellationToken::new();
        until_idle().await;

        let sender = {
            let transceiver = transceiver.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                for function in [0x03u8, 0x04] {
                    transceiver
                        .transmit(RtuFrame::new(0x01, function, vec![]).unwrap(), &cancel)
                        .await
                        .unwrap();
                }
            })
        };

        let first = tx_out.recv().await.unwrap();
        assert_eq!(first[1], 0x03);
        let first_written = Instant::now();

        // The second frame is already queued, but the bus-settle gap keeps
        // it off the wire for a full 3.5t.
        let second = tx_out.recv().await.unwrap();
        assert_eq!(second[1], 0x04);
        assert!(Instant::now() - first_written >= nominal_timings().inter_frame());
        sender.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transmit_after_close_is_invalid_operation() {
        let (transceiver, _line, _tx_out) = harness();
        let cancel = CancellationToken::new();

        transceiver.close(false).await.unwrap();
        assert!(transceiver.is_closed());

        let frame = RtuFrame::new(0x01, 0x03, vec![]).unwrap();
        let err = transceiver.transmit(frame, &cancel).await.unwrap_err();
        assert!(matches!(err, ModbusError::InvalidOperation { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_close_reaches_terminal_state() {
        let (transceiver, line, _tx_out) = harness();
        until_idle().await;

        // Mid-reception when the terminate lands.
        feed(&line, &[0x01, 0x03]);
        transceiver.close(true).await.unwrap();
        assert!(transceiver.is_closed());

        let cancel = CancellationToken::new();
        transceiver.wait(&cancel).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_close_lets_reception_finish() {
        let (transceiver, line, _tx_out) = harness();
        let transceiver = Arc::new(transceiver);
        let mut events = transceiver.subscribe();
        until_idle().await;

        // Half a frame, then a graceful close while it is in flight.
        feed(&line, &[0x01, 0x03, 0x00, 0x00]);
        tokio::time::sleep(Duration::from_millis(1)).await;
        let closer = {
            let transceiver = transceiver.clone();
            tokio::spawn(async move { transceiver.close(false).await })
        };

        feed(&line, &[0x00, 0x08, 0x44, 0x0C]);
        let frame = events.recv().await.unwrap();
        assert_eq!(frame.data(), &[0x00, 0x00, 0x00, 0x08]);

        closer.await.unwrap().unwrap();
        assert!(transceiver.is_closed());
        assert_eq!(transceiver.counters().messages, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_close_drains_transmit_slot() {
        let (transceiver, line, mut tx_out) = harness();
        let transceiver = Arc::new(transceiver);
        let cancel = CancellationToken::new();
        until_idle().await;

        // Park the link in reception so the queued frame cannot go out yet.
        feed(&line, &[0x01, 0x03]);
        tokio::time::sleep(Duration::from_millis(1)).await;

        let sender = {
            let transceiver = transceiver.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                transceiver
                    .transmit(RtuFrame::new(0x02, 0x06, vec![0x00, 0x01]).unwrap(), &cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_micros(500)).await;
        let closer = {
            let transceiver = transceiver.clone();
            tokio::spawn(async move { transceiver.close(false).await })
        };

        // The queued frame still reaches the wire before the port goes away.
        let raw = tx_out.recv().await.unwrap();
        assert_eq!(raw[..2], [0x02, 0x06]);
        sender.await.unwrap().unwrap();
        closer.await.unwrap().unwrap();
        assert!(transceiver.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_honors_cancellation() {
        let (transceiver, _line, _tx_out) = harness();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = transceiver.wait(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_reset() {
        let (transceiver, line, _tx_out) = harness();
        until_idle().await;

        feed(&line, &[0xBA, 0xD1]);
        tokio::time::sleep(SETTLE).await;
        assert_eq!(transceiver.counters().comm_errors, 1);

        transceiver.reset_counters();
        assert_eq!(transceiver.counters(), RtuBusCounterSnapshot::default());
    }
}
