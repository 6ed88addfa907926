//! Modbus ASCII transceiver: delimiter-driven framing, no bus timing.
//!
//! ASCII frames carry their own boundaries — `':'` opens a frame and CR LF
//! closes it — so unlike RTU there are no silence deadlines and no bus
//! counters. Reception is a small per-character state machine:
//!
//! ```text
//! IDLE ──':'──▶ APPEND ──CR──▶ EOF ──LF──▶ frame complete, back to IDLE
//!                  ▲ │            │
//!                  │ └─':' clears │ CR stays in EOF; ':' restarts; any
//!                  └──────────────┘ other character falls back to APPEND
//! ```
//!
//! A `':'` in any state restarts the frame: the bus may carry a retry of a
//! query whose first rendition was clipped, and the retry is the one worth
//! keeping. Characters with line errors or a buffer overflow mark the frame
//! NOK; NOK frames and frames that fail hex or LRC validation are dropped
//! without surfacing an event.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::error::ModbusResult;
use crate::frame::AsciiFrame;
use crate::link::{LinkLifecycle, LinkState};
use crate::port::{RxChar, SerialPort};
use crate::transceiver::{
    close_link, submit_frame, wait_closed, Transceiver, TxRequest, EVENT_CHANNEL_CAPACITY,
};
use crate::util::format_hex;

/// Bounded accumulator for one raw ASCII frame.
///
/// The bound is the longest legal frame; pushing past it does not grow the
/// buffer, it flags an overflow the receptor folds into NOK.
struct FrameBuffer {
    bytes: Vec<u8>,
    overflowed: bool,
}

impl FrameBuffer {
    fn new() -> Self {
        Self {
            bytes: Vec::with_capacity(crate::MAX_ASCII_FRAME_SIZE),
            overflowed: false,
        }
    }

    /// Append one character; false when the frame bound was exceeded.
    fn push(&mut self, byte: u8) -> bool {
        if self.bytes.len() >= crate::MAX_ASCII_FRAME_SIZE {
            self.overflowed = true;
            return false;
        }
        self.bytes.push(byte);
        true
    }

    fn restart(&mut self) {
        self.bytes.clear();
        self.overflowed = false;
        self.bytes.push(b':');
    }

    fn take(&mut self) -> Vec<u8> {
        self.overflowed = false;
        std::mem::take(&mut self.bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceptorState {
    /// Waiting for a frame start; everything but `':'` is bus noise.
    Idle,
    /// Collecting the hex body.
    Append,
    /// CR seen; waiting for the final LF.
    Eof,
}

/// One raw frame as delimited on the wire, before hex and LRC validation.
struct RawAsciiEvent {
    /// `':'` plus the collected body characters.
    raw: Vec<u8>,
    /// True when any character had a line error or the buffer overflowed.
    nok: bool,
}

/// Pure per-character reception state machine.
struct AsciiReceptor {
    state: ReceptorState,
    buffer: FrameBuffer,
    nok: bool,
}

impl AsciiReceptor {
    fn new() -> Self {
        Self {
            state: ReceptorState::Idle,
            buffer: FrameBuffer::new(),
            nok: false,
        }
    }

    fn start(&mut self) {
        self.buffer.restart();
        self.nok = false;
        self.state = ReceptorState::Append;
    }

    /// Feed one character; returns a raw frame when one just completed.
    fn on_char(&mut self, ch: RxChar) -> Option<RawAsciiEvent> {
        if self.state != ReceptorState::Idle && (!ch.valid || ch.overrun) {
            self.nok = true;
        }

        match (self.state, ch.byte) {
            // ':' restarts the frame from any state.
            (_, b':') => {
                self.start();
                None
            }
            (ReceptorState::Idle, _) => None,
            (ReceptorState::Append, b'\r') => {
                self.state = ReceptorState::Eof;
                None
            }
            (ReceptorState::Append, byte) => {
                if !self.buffer.push(byte) {
                    self.nok = true;
                }
                None
            }
            (ReceptorState::Eof, b'\n') => {
                let event = RawAsciiEvent {
                    raw: self.buffer.take(),
                    nok: self.nok,
                };
                self.state = ReceptorState::Idle;
                self.nok = false;
                Some(event)
            }
            // A repeated CR keeps waiting for the LF.
            (ReceptorState::Eof, b'\r') => None,
            // Anything else in EOF was not an end after all; keep the
            // character and resume collecting.
            (ReceptorState::Eof, byte) => {
                if !self.buffer.push(byte) {
                    self.nok = true;
                }
                self.state = ReceptorState::Append;
                None
            }
        }
    }
}

/// Modbus ASCII frame transceiver over one serial port.
pub struct AsciiTransceiver {
    tx_slot: mpsc::Sender<TxRequest<AsciiFrame>>,
    events: broadcast::Sender<AsciiFrame>,
    lifecycle: Arc<LinkLifecycle>,
}

impl AsciiTransceiver {
    /// Take ownership of an open port and start the link task.
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        let (tx_slot, tx_queue) = mpsc::channel(1);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let lifecycle = Arc::new(LinkLifecycle::new());

        let link = AsciiLink {
            port,
            tx_queue,
            events: events.clone(),
            lifecycle: lifecycle.clone(),
            receptor: AsciiReceptor::new(),
        };
        tokio::spawn(link.run());

        Self {
            tx_slot,
            events,
            lifecycle,
        }
    }
}

#[async_trait]
impl Transceiver for AsciiTransceiver {
    type Frame = AsciiFrame;

    async fn transmit(&self, frame: AsciiFrame, cancel: &CancellationToken) -> ModbusResult<()> {
        submit_frame(&self.tx_slot, &self.lifecycle, frame, cancel).await
    }

    fn subscribe(&self) -> broadcast::Receiver<AsciiFrame> {
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

enum Flow {
    Continue,
    Exit,
}

enum LinkEvent {
    Lifecycle,
    Tx(Option<TxRequest<AsciiFrame>>),
    Rx(ModbusResult<RxChar>),
}

/// The link task: owns the port, the receptor and the transmit path.
struct AsciiLink {
    port: Box<dyn SerialPort>,
    tx_queue: mpsc::Receiver<TxRequest<AsciiFrame>>,
    events: broadcast::Sender<AsciiFrame>,
    lifecycle: Arc<LinkLifecycle>,
    receptor: AsciiReceptor,
}

impl AsciiLink {
    async fn run(mut self) {
        let mut state = self.lifecycle.watch();
        loop {
            let event = tokio::select! {
                biased;
                _ = state.wait_for(|s| s.is_closing()) => LinkEvent::Lifecycle,
                req = self.tx_queue.recv() => LinkEvent::Tx(req),
                res = self.port.recv() => LinkEvent::Rx(res),
            };

            match event {
                LinkEvent::Lifecycle => {
                    if self.lifecycle.state() == LinkState::Closing {
                        self.drain_transmit_queue(&mut state).await;
                    }
                    break;
                }
                LinkEvent::Tx(None) => break,
                LinkEvent::Tx(Some(req)) => {
                    if let Flow::Exit = self.emission(&mut state, req).await {
                        break;
                    }
                }
                LinkEvent::Rx(Ok(ch)) => {
                    if let Some(raw) = self.receptor.on_char(ch) {
                        self.finalize(raw);
                    }
                }
                LinkEvent::Rx(Err(e)) => {
                    error!("serial port failure: {e}");
                    break;
                }
            }
        }
        // The port is owned by this task and dropped exactly once, here.
        debug!("ASCII link closed");
        self.lifecycle.mark_closed();
    }

    async fn drain_transmit_queue(&mut self, state: &mut watch::Receiver<LinkState>) {
        while let Ok(req) = self.tx_queue.try_recv() {
            if let Flow::Exit = self.emission(state, req).await {
                return;
            }
        }
    }

    /// Write one encoded frame. ASCII needs no bus-settle gap afterwards.
    async fn emission(
        &mut self,
        state: &mut watch::Receiver<LinkState>,
        req: TxRequest<AsciiFrame>,
    ) -> Flow {
        let raw = req.frame.encode();
        trace!("ASCII send {}", String::from_utf8_lossy(&raw).trim_end());

        let result = tokio::select! {
            biased;
            _ = state.wait_for(|s| *s == LinkState::Terminating) => {
                drop(req.done);
                return Flow::Exit;
            }
            res = self.port.send(&raw) => res,
        };
        if let Err(e) = &result {
            warn!("ASCII frame transmission failed: {e}");
        }
        let _ = req.done.send(result);
        Flow::Continue
    }

    /// Validate a completed raw frame and surface it, or drop it silently.
    fn finalize(&self, event: RawAsciiEvent) {
        if event.nok {
            debug!("ASCII drop {} (line error)", format_hex(&event.raw));
            return;
        }
        match AsciiFrame::decode(&event.raw) {
            Ok(frame) => {
                trace!("ASCII recv {}", String::from_utf8_lossy(&event.raw));
                let _ = self.events.send(frame);
            }
            Err(e) => {
                debug!("ASCII drop {} ({e})", format_hex(&event.raw));
            }
        }
    }
}
