use crate::hw::{TX_ALIGNMENT, TX_EVENT_SEQUENCE_WIDTH, TX_HEADER_BYTES};
use crate::util::is_pow_of_two;

/// Request id recorded against a transmit so completions can be matched
/// back to the caller's operation.
pub type RequestId = u32;

/// Id recorded for sends the caller does not want reported individually.
pub const REQUEST_ID_NONE: RequestId = 0xffff_ffff;

/// One transmit descriptor, held in the ring from submission until the
/// completion event retires it.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxDescriptor {
    /// Total length including header and padding, in bytes
    pub len: u16,
}

/// Per-VI transmit ring. `added`/`previous` count descriptors; `ct_added`/
/// `ct_removed` count hardware fifo bytes. All four wrap naturally.
#[derive(Debug)]
pub struct TxQueue {
    mask: u32,
    fifo_bytes: u32,
    descriptors: Box<[TxDescriptor]>,
    ids: Box<[RequestId]>,
    added: u32,
    previous: u32,
    ct_added: u32,
    ct_removed: u32,
}

impl TxQueue {
    /// `entries` is the ring size in descriptors, `fifo_bytes` the hardware
    /// cut-through fifo capacity. The ring must be large enough for the
    /// maximum number of minimum-size frames the fifo can hold, so that
    /// descriptor slots never run out while fifo space remains.
    pub fn new(entries: u32, fifo_bytes: u32) -> TxQueue {
        assert!(is_pow_of_two(entries));
        assert!(entries >= (fifo_bytes + TX_HEADER_BYTES) / TX_ALIGNMENT);

        TxQueue {
            mask: entries - 1,
            fifo_bytes,
            descriptors: vec![TxDescriptor::default(); entries as usize].into_boxed_slice(),
            ids: vec![REQUEST_ID_NONE; entries as usize].into_boxed_slice(),
            added: 0,
            previous: 0,
            ct_added: 0,
            ct_removed: 0,
        }
    }

    /// Fifo bytes not yet retired by a completion.
    #[inline]
    pub fn fill_bytes(&self) -> u32 {
        self.ct_added.wrapping_sub(self.ct_removed)
    }

    /// Fifo bytes available for new frames.
    #[inline]
    pub fn space_bytes(&self) -> u32 {
        self.fifo_bytes - self.fill_bytes()
    }

    /// Check that a frame consuming `len` fifo bytes fits. Must pass before
    /// any aperture write; a partially written frame cannot be rolled back.
    #[inline]
    pub fn check_space(&self, len: u32) -> bool {
        self.space_bytes() >= len
    }

    /// Number of descriptors submitted and not yet retired.
    #[inline]
    pub fn fill_level(&self) -> u32 {
        self.added.wrapping_sub(self.previous)
    }

    /// Hardware fifo offset at which the next frame starts.
    #[inline]
    pub fn ct_offset(&self) -> u32 {
        self.ct_added
    }

    /// Record a descriptor for a frame just written to the aperture.
    /// Returns the ring slot used. Submitting without a passing
    /// `check_space` is a contract violation, not a runtime error.
    pub fn submit(&mut self, len: u32, id: RequestId) -> u32 {
        debug_assert!(len <= self.space_bytes());
        debug_assert!(self.fill_level() <= self.mask);

        let i = (self.added & self.mask) as usize;
        self.descriptors[i].len = len as u16;
        self.ids[i] = id;
        self.ct_added = self.ct_added.wrapping_add(len);
        self.added = self.added.wrapping_add(1);

        i as u32
    }

    /// Retire descriptors up to a hardware completion sequence number.
    /// The sequence is the low bits of the descriptor count the device has
    /// finished with; walking the ring converts that back into fifo bytes.
    /// Returns the retired descriptor count, usable as a completion id.
    ///
    /// Panics if the device reports a sequence the ring never issued; the
    /// VI state has diverged from hardware and cannot be recovered.
    pub fn reconcile(&mut self, seq: u32) -> u32 {
        let seq_mask = (1u32 << TX_EVENT_SEQUENCE_WIDTH) - 1;

        while (self.previous & seq_mask) != seq {
            assert!(
                self.previous != self.added,
                "tx completion sequence {:#x} does not match any pending descriptor",
                seq
            );
            let i = (self.previous & self.mask) as usize;
            self.ct_removed = self
                .ct_removed
                .wrapping_add(u32::from(self.descriptors[i].len));
            self.previous = self.previous.wrapping_add(1);
        }

        self.previous
    }

    /// Request id recorded at a ring slot.
    #[inline]
    pub fn request_id(&self, slot: u32) -> RequestId {
        self.ids[(slot & self.mask) as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn space_accounting() {
        let mut q = TxQueue::new(64, 2048);

        assert_eq!(q.space_bytes(), 2048);
        assert!(q.check_space(2048));
        assert!(!q.check_space(2049));

        q.submit(512, 1);
        assert_eq!(q.fill_bytes(), 512);
        assert_eq!(q.space_bytes(), 1536);
        assert!(q.check_space(1536));
        assert!(!q.check_space(1537));
    }

    #[test]
    fn reconcile_retires_exact_lengths() {
        let mut q = TxQueue::new(64, 4096);

        // ring of 4 in-flight descriptors, cumulative 320 fifo bytes
        q.submit(64, 1);
        q.submit(128, 2);
        q.submit(64, 3);
        q.submit(64, 4);
        assert_eq!(q.fill_bytes(), 320);

        // completion for the first three descriptors
        let done = q.reconcile(3);
        assert_eq!(done, 3);
        assert_eq!(q.ct_removed, 256);
        assert_eq!(q.space_bytes(), 4096 - (320 - 256));
        assert_eq!(q.fill_level(), 1);

        // the remaining descriptor retires on the next event
        let done = q.reconcile(4);
        assert_eq!(done, 4);
        assert_eq!(q.fill_bytes(), 0);
    }

    #[test]
    fn reconcile_is_idempotent_at_current_seq() {
        let mut q = TxQueue::new(64, 4096);
        q.submit(64, 1);
        q.reconcile(1);
        // same sequence again retires nothing further
        assert_eq!(q.reconcile(1), 1);
        assert_eq!(q.ct_removed, 64);
    }

    #[test]
    fn sequence_wraps_at_field_width() {
        let mut q = TxQueue::new(512, 32768);

        // walk past the 8-bit sequence wrap
        for i in 0..260 {
            q.submit(64, i);
            q.reconcile((i + 1) & 0xff);
        }
        assert_eq!(q.fill_level(), 0);
        assert_eq!(q.fill_bytes(), 0);
    }

    #[test]
    #[should_panic(expected = "does not match any pending descriptor")]
    fn unknown_sequence_is_fatal() {
        let mut q = TxQueue::new(64, 4096);
        q.submit(64, 1);
        q.submit(64, 2);
        q.reconcile(7);
    }

    #[test]
    fn invariants_hold_under_churn() {
        let mut q = TxQueue::new(64, 2048);
        let mut submitted = 0u32;

        for round in 0..1000u32 {
            let len = 64 + (round % 4) * 64;
            if q.check_space(len) {
                q.submit(len, round);
                submitted += 1;
            } else {
                // drain half of what is outstanding
                let target = submitted.wrapping_sub(q.fill_level() / 2) & 0xff;
                q.reconcile(target);
            }
            assert!(q.fill_bytes() <= 2048);
            assert!(q.fill_level() <= 64);
        }
    }

    #[test]
    fn request_ids_follow_slots() {
        let mut q = TxQueue::new(8, 512);
        let s0 = q.submit(64, 41);
        let s1 = q.submit(64, 42);
        assert_eq!(q.request_id(s0), 41);
        assert_eq!(q.request_id(s1), 42);
    }

    #[test]
    fn ring_must_cover_min_size_frames() {
        // 2048 byte fifo of 64 byte frames needs at least 32 slots
        let q = TxQueue::new(32, 2048);
        assert_eq!(q.space_bytes(), 2048);
    }

    #[test]
    #[should_panic]
    fn undersized_ring_is_rejected() {
        TxQueue::new(16, 2048);
    }
}
