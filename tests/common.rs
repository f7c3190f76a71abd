//
// Test infrastructure simulating a cut-through device. One anonymous
// mapping holds the doubled transmit aperture and the event ring. After the
// VI writes frames, the device model walks the aperture using the header
// packet-length field, returns the payloads it "transmitted" and posts
// phase-correct completion events, the way hardware would.
//
use std::sync::Arc;

use ctpio::aperture::Aperture;
use ctpio::evq::EventQueue;
use ctpio::hw::{header_packet_length, tx_event, TX_APERTURE, TX_HEADER_BYTES};
use ctpio::mmap_area::{MmapArea, MmapAreaOptions};
use ctpio::txq::TxQueue;
use ctpio::vi::CtpioVi;

pub const EVQ_ENTRIES: usize = 256;
pub const TXQ_ENTRIES: u32 = 64;
pub const FIFO_BYTES: u32 = 2048;

pub struct SimDevice {
    aperture_base: *mut u8,
    evq_base: *mut u64,
    evq_wr: usize,
    ct_consumed: u32,
    completed: u32,
}

impl SimDevice {
    /// Consume `n` frames from the aperture in fifo order and post a single
    /// completion event covering all of them. Returns the payloads.
    pub fn complete(&mut self, n: usize) -> Vec<Vec<u8>> {
        let mut frames = Vec::with_capacity(n);

        for _ in 0..n {
            let start = (self.ct_consumed % TX_APERTURE) as usize;

            let header: u64;
            unsafe {
                header = (self.aperture_base.add(start) as *const u64).read();
            }
            let len = header_packet_length(header);

            let mut payload = vec![0u8; len as usize];
            unsafe {
                let src = self.aperture_base.add(start + TX_HEADER_BYTES as usize);
                std::ptr::copy_nonoverlapping(src, payload.as_mut_ptr(), len as usize);
            }
            frames.push(payload);

            self.ct_consumed = self
                .ct_consumed
                .wrapping_add(CtpioVi::frame_footprint(len));
            self.completed = self.completed.wrapping_add(1);
        }

        self.post_tx_event(self.completed & 0xff);
        frames
    }

    fn post_tx_event(&mut self, seq: u32) {
        let slot = self.evq_wr % EVQ_ENTRIES;
        let phase = (self.evq_wr / EVQ_ENTRIES) % 2 == 1;
        unsafe {
            self.evq_base.add(slot).write(tx_event(seq, 0, phase).0);
        }
        self.evq_wr += 1;
    }
}

pub struct SimHarness {
    pub device: SimDevice,
    pub vi: CtpioVi,
    _area: Arc<MmapArea>,
}

impl SimHarness {
    pub fn new() -> SimHarness {
        let aperture_bytes = (2 * TX_APERTURE) as usize;
        let evq_bytes = EVQ_ENTRIES * 8;

        let area = MmapArea::new(
            aperture_bytes + evq_bytes,
            MmapAreaOptions { huge_tlb: false },
        )
        .expect("mmap failed");

        let aperture_base = area.as_ptr();
        let evq_base = unsafe { area.as_ptr().add(aperture_bytes) as *mut u64 };

        // a fresh event ring must not look readable on the first lap:
        // stale entries carry the opposite phase
        for i in 0..EVQ_ENTRIES {
            unsafe {
                evq_base.add(i).write(tx_event(0, 0, true).0);
            }
        }

        let vi = unsafe {
            CtpioVi::new(
                Aperture::new(aperture_base, TX_APERTURE),
                TxQueue::new(TXQ_ENTRIES, FIFO_BYTES),
                EventQueue::new(evq_base as *const u8, (EVQ_ENTRIES * 8) as u32),
            )
        };

        SimHarness {
            device: SimDevice {
                aperture_base,
                evq_base,
                evq_wr: 0,
                ct_consumed: 0,
                completed: 0,
            },
            vi,
            _area: area,
        }
    }
}
