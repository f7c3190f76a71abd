use thiserror::Error;

use crate::aperture::{Aperture, TxWriter};
use crate::evq::EventQueue;
use crate::hw::{
    self, Event, TX_CT_DISABLE, TX_HEADER_BYTES,
};
use crate::txq::{RequestId, TxQueue, REQUEST_ID_NONE};
use crate::util::align_up;

/// Errors a virtual interface operation can return. Both are ordinary
/// conditions for the caller: retry after polling, or use another path.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViError {
    /// Not enough transmit fifo space; poll for completions and retry
    #[error("insufficient transmit space")]
    Again,
    /// This adapter generation does not implement the operation
    #[error("operation not supported")]
    Unsupported,
}

/// A decoded completion, handed back from the event poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViEvent {
    /// One or more frames finished transmitting. `desc_id` is the count of
    /// descriptors retired so far; everything before it is done.
    Tx { label: u8, desc_id: u32 },
}

/// The per-adapter-generation operation table. Callers program against this
/// trait so a different generation's implementation can be swapped in
/// without touching the data path.
pub trait ViOps {
    /// Send a single contiguous frame.
    fn transmit(&mut self, frame: &[u8], id: RequestId) -> Result<(), ViError>;

    /// Send a frame gathered from multiple spans.
    fn transmitv(&mut self, spans: &[&[u8]], id: RequestId) -> Result<(), ViError>;

    /// Ring the doorbell for previously queued sends. Cut-through hardware
    /// transmits on the aperture write itself, so some generations have
    /// nothing to do here.
    fn transmit_push(&mut self);

    /// Send from a pre-programmed PIO region.
    fn transmit_pio(&mut self, offset: u32, len: u32, id: RequestId) -> Result<(), ViError>;

    /// Copy into a PIO region and send.
    fn transmit_copy_pio(
        &mut self,
        offset: u32,
        frame: &[u8],
        id: RequestId,
    ) -> Result<(), ViError>;

    /// Warm the PIO write path without sending.
    fn transmit_pio_warm(&mut self);

    /// Warm the copy-PIO write path without sending.
    fn transmit_copy_pio_warm(&mut self, offset: u32, frame: &[u8]);

    /// Cut-through send. The caller must have seen `check_space` pass for
    /// this frame's fifo footprint; there is no error return because a
    /// partially written aperture cannot be rolled back.
    fn transmitv_ctpio(&mut self, frame_len: u32, spans: &[&[u8]], ct_thresh: u32);

    /// Cut-through send with a caller-supplied fallback copy for
    /// generations that need one posted behind the aperture write.
    fn transmitv_ctpio_copy(
        &mut self,
        frame_len: u32,
        spans: &[&[u8]],
        ct_thresh: u32,
        fallback: &mut [u8],
    );

    /// Post a receive buffer.
    fn receive_init(&mut self, addr: u64, id: RequestId) -> Result<(), ViError>;

    /// Ring the receive doorbell for posted buffers.
    fn receive_push(&mut self);

    /// Drain up to `max` completions into `evs`. Returns the number added.
    fn eventq_poll(&mut self, evs: &mut Vec<ViEvent>, max: usize) -> usize;

    /// Request an interrupt when the next event arrives.
    fn eventq_prime(&mut self);

    /// Event queue timer controls, reserved for generations with a
    /// moderation timer.
    fn eventq_timer_prime(&mut self, ticks: u32);
    fn eventq_timer_run(&mut self, ticks: u32);
    fn eventq_timer_clear(&mut self);
    fn eventq_timer_zero(&mut self);
}

/// A cut-through PIO virtual interface: the transmit aperture, the
/// descriptor ring tracking it, and the event queue reporting completions.
/// Single writer; the caller serializes transmit and poll.
pub struct CtpioVi {
    aperture: Aperture,
    txq: TxQueue,
    evq: EventQueue,
    scratch: Vec<Event>,
}

impl CtpioVi {
    pub fn new(aperture: Aperture, txq: TxQueue, evq: EventQueue) -> CtpioVi {
        CtpioVi {
            aperture,
            txq,
            evq,
            scratch: Vec::new(),
        }
    }

    /// Fifo bytes a frame of `payload_len` consumes: header plus payload,
    /// padded out to the write granularity.
    #[inline]
    pub fn frame_footprint(payload_len: u32) -> u32 {
        align_up(TX_HEADER_BYTES + payload_len, hw::TX_ALIGNMENT)
    }

    /// Whether a frame of `payload_len` currently fits. Required before
    /// `transmitv_ctpio`.
    #[inline]
    pub fn check_space(&self, payload_len: u32) -> bool {
        self.txq.check_space(Self::frame_footprint(payload_len))
    }

    #[inline]
    pub fn txq(&self) -> &TxQueue {
        &self.txq
    }

    /// Write header and spans to the aperture and record the descriptor.
    fn push_frame(&mut self, frame_len: u32, spans: &[&[u8]], ct_thresh: u32, id: RequestId) {
        let mut tx = TxWriter::begin(&self.aperture, self.txq.ct_offset());
        tx.word(hw::tx_pkt_header(frame_len, ct_thresh, false));
        for span in spans {
            tx.block(span);
        }
        let len = tx.finish();
        self.txq.submit(len, id);
    }
}

impl ViOps for CtpioVi {
    fn transmit(&mut self, frame: &[u8], id: RequestId) -> Result<(), ViError> {
        self.transmitv(&[frame], id)
    }

    fn transmitv(&mut self, spans: &[&[u8]], id: RequestId) -> Result<(), ViError> {
        let frame_len = spans.iter().map(|s| s.len() as u32).sum();

        if !self.check_space(frame_len) {
            return Err(ViError::Again);
        }

        self.push_frame(frame_len, spans, TX_CT_DISABLE, id);
        Ok(())
    }

    fn transmit_push(&mut self) {
        // the aperture write is the doorbell
    }

    fn transmit_pio(&mut self, _offset: u32, _len: u32, _id: RequestId) -> Result<(), ViError> {
        Err(ViError::Unsupported)
    }

    fn transmit_copy_pio(
        &mut self,
        _offset: u32,
        _frame: &[u8],
        _id: RequestId,
    ) -> Result<(), ViError> {
        Err(ViError::Unsupported)
    }

    fn transmit_pio_warm(&mut self) {}

    fn transmit_copy_pio_warm(&mut self, _offset: u32, _frame: &[u8]) {}

    fn transmitv_ctpio(&mut self, frame_len: u32, spans: &[&[u8]], ct_thresh: u32) {
        assert!(
            self.check_space(frame_len),
            "transmitv_ctpio called without fifo space"
        );
        self.push_frame(frame_len, spans, ct_thresh, REQUEST_ID_NONE);
    }

    fn transmitv_ctpio_copy(
        &mut self,
        frame_len: u32,
        spans: &[&[u8]],
        ct_thresh: u32,
        _fallback: &mut [u8],
    ) {
        // no fallback needed: the fifo either had space or the caller's
        // check failed before any aperture write
        self.transmitv_ctpio(frame_len, spans, ct_thresh);
    }

    fn receive_init(&mut self, _addr: u64, _id: RequestId) -> Result<(), ViError> {
        Err(ViError::Unsupported)
    }

    fn receive_push(&mut self) {}

    fn eventq_poll(&mut self, evs: &mut Vec<ViEvent>, max: usize) -> usize {
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        self.evq.poll(&mut scratch, max);

        let mut n = 0;
        for event in &scratch {
            match event.ev_type() {
                hw::EVENT_TYPE_TX => {
                    let desc_id = self.txq.reconcile(event.tx_sequence());
                    evs.push(ViEvent::Tx {
                        label: event.tx_label(),
                        desc_id,
                    });
                    n += 1;
                }
                hw::EVENT_TYPE_RX | hw::EVENT_TYPE_CONTROL => {
                    // belongs to the receive path implementation for this
                    // generation, which lives elsewhere
                    log::debug!("ignoring rx/control event {:#018x}", event.0);
                }
                other => {
                    log::error!("unknown event type {}: {:#018x}", other, event.0);
                }
            }
        }

        self.scratch = scratch;
        n
    }

    fn eventq_prime(&mut self) {}

    fn eventq_timer_prime(&mut self, _ticks: u32) {}

    fn eventq_timer_run(&mut self, _ticks: u32) {}

    fn eventq_timer_clear(&mut self) {}

    fn eventq_timer_zero(&mut self) {}
}
