use std::ptr;

use crate::hw::{Event, EVENT_BYTES};
use crate::util::is_pow_of_two;

/// Read cursor over a hardware event queue. The queue is a power-of-two
/// ring of 8-byte events; each entry carries a phase bit the device toggles
/// on every lap, which is the only way software can tell a fresh entry from
/// a stale one (there is no producer count).
#[derive(Debug)]
pub struct EventQueue {
    base: *const u64,
    mask: u64,
    ptr: u64,
}
unsafe impl Send for EventQueue {}

impl EventQueue {
    /// Wrap an event queue mapping of `capacity_bytes` (a power of two).
    /// `base` must stay valid for the lifetime of the returned value.
    pub unsafe fn new(base: *const u8, capacity_bytes: u32) -> EventQueue {
        assert!(is_pow_of_two(capacity_bytes));
        assert_eq!(base as usize % 8, 0);

        EventQueue {
            base: base as *const u64,
            mask: u64::from(capacity_bytes - 1),
            ptr: 0,
        }
    }

    #[inline]
    fn slot_at(&self, byte_cursor: u64) -> Event {
        let index = ((byte_cursor & self.mask) / u64::from(EVENT_BYTES)) as usize;
        Event(unsafe { ptr::read_volatile(self.base.add(index)) })
    }

    /// Phase a fresh entry at this cursor position must carry: the parity
    /// of the number of times the ring has wrapped.
    #[inline]
    fn expected_phase(&self, byte_cursor: u64) -> bool {
        (byte_cursor & (self.mask + 1)) != 0
    }

    /// Drain up to `max` fresh events into `out`. Returns the number read;
    /// zero means the next slot has not been written yet and the cursor did
    /// not move.
    ///
    /// Panics if the most recently consumed slot no longer carries the
    /// phase it was consumed with: the device has lapped the ring faster
    /// than it was drained, events are lost, and the queue is too small for
    /// the traffic rate. Skipped until the first event has been consumed,
    /// since a fresh queue has no previously consumed slot to check.
    pub fn poll(&mut self, out: &mut Vec<Event>, max: usize) -> usize {
        if self.ptr != 0 {
            let prev = self.ptr - u64::from(EVENT_BYTES);
            assert!(
                self.slot_at(prev).phase() == self.expected_phase(prev),
                "event queue overflowed"
            );
        }

        let mut n = 0;
        while n < max {
            let event = self.slot_at(self.ptr);
            if event.phase() != self.expected_phase(self.ptr) {
                break;
            }

            out.push(event);
            n += 1;
            self.ptr += u64::from(EVENT_BYTES);
        }

        n
    }
}
