use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use arraydeque::{ArrayDeque, Wrapping};

/// Superbuf slots in one receive queue's pool.
pub const MAX_SUPERBUFS: usize = 512;

/// Hardware receive queues per adapter.
pub const MAX_RX_QUEUES: usize = 8;

/// Superbufs carved out of one backing hugepage.
pub const SUPERBUFS_PER_HUGEPAGE: u32 = 2;

/// Delivery-order window length. Superbufs older than this can no longer be
/// granted to an app that fell behind.
const SBUF_WINDOW: usize = 128;

/// Token for one pool backing page, handed through to the device management
/// layer which owns the actual mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hugepage {
    pub fd: i32,
    pub offset: u64,
}

/// Ownership bitmap, one bit per superbuf slot in the shared pool.
#[derive(Debug, Default, Clone)]
pub struct SuperbufBitmap {
    words: [u64; MAX_SUPERBUFS / 64],
}

impl SuperbufBitmap {
    #[inline]
    pub fn set(&mut self, sbuf: u16) {
        self.words[sbuf as usize / 64] |= 1 << (sbuf % 64);
    }

    #[inline]
    pub fn clear(&mut self, sbuf: u16) {
        self.words[sbuf as usize / 64] &= !(1 << (sbuf % 64));
    }

    #[inline]
    pub fn test(&self, sbuf: u16) -> bool {
        self.words[sbuf as usize / 64] & (1 << (sbuf % 64)) != 0
    }

    /// Iterate over the set bits in ascending slot order.
    pub fn iter_set(&self) -> impl Iterator<Item = u16> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, &word)| {
            let mut word = word;
            std::iter::from_fn(move || {
                if word == 0 {
                    return None;
                }
                let bit = word.trailing_zeros();
                word &= word - 1;
                Some((wi * 64) as u16 + bit as u16)
            })
        })
    }
}

/// State shared between the binding (process) context and the consumer
/// context for one app: the destroy request flag and the teardown callback.
pub struct RxqShared {
    qid: u32,
    destroy: AtomicBool,
    freer: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

/// Caller-side handle returned by bind. Dropping it does not tear the queue
/// down; teardown is an explicit, deferred request.
pub struct RxqHandle {
    shared: Arc<RxqShared>,
}

impl RxqHandle {
    #[inline]
    pub fn qid(&self) -> u32 {
        self.shared.qid
    }

    /// Request teardown. The consumer context moves the app out of service
    /// on its next sweep; `freer` runs once every hardware-visible
    /// reference has been dropped by the reclamation pass.
    pub fn free(self, freer: Box<dyn FnOnce() + Send>) {
        *self.shared.freer.lock().unwrap() = Some(freer);
        self.shared.destroy.store(true, Ordering::Release);
    }
}

/// Bind parameters for one receive-buffer subscription. Affinity and the
/// timestamp flag are carried through to the device management layer.
pub struct BindRequest {
    pub qid: u32,
    pub affinity: u64,
    pub timestamp_req: bool,
    pub hugepages: Vec<Hugepage>,
}

/// Consumer-private per-app state. Created in process context, pushed onto
/// the pending list, then owned exclusively by the consumer context until
/// reclamation.
pub struct RxqApp {
    next: *mut RxqApp,
    shared: Arc<RxqShared>,
    affinity: u64,
    timestamp_req: bool,
    hugepages: Vec<Hugepage>,
    next_sbuf_seq: u32,
    current_owned: u32,
    max_allowed: u32,
    owns: SuperbufBitmap,
}

// Ownership moves between execution contexts by convention; the raw `next`
// pointer is only live while the app sits on the pending list.
unsafe impl Send for RxqApp {}

/// Lock-free multi-producer list of apps waiting for admission. Push may be
/// called from any number of threads; take_all is consumer-exclusive.
pub struct PendingList {
    head: AtomicPtr<RxqApp>,
}

unsafe impl Send for PendingList {}
unsafe impl Sync for PendingList {}

impl PendingList {
    pub fn new() -> PendingList {
        PendingList {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn push(&self, app: Box<RxqApp>) {
        let node = Box::into_raw(app);
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            unsafe {
                (*node).next = head;
            }
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Detach and return every pending app, oldest first.
    pub fn take_all(&self) -> Vec<Box<RxqApp>> {
        let mut node = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        let mut apps = Vec::new();

        while !node.is_null() {
            let app = unsafe { Box::from_raw(node) };
            node = app.next;
            apps.push(app);
        }

        apps.reverse();
        apps
    }
}

impl Default for PendingList {
    fn default() -> PendingList {
        PendingList::new()
    }
}

impl Drop for PendingList {
    fn drop(&mut self) {
        self.take_all();
    }
}

/// Superbufs in the order hardware is going to fill them. Needed to
/// progressively refill app queues, resume a stopped app and start a new
/// app without rollover.
#[derive(Debug)]
struct SbufSeq {
    q: ArrayDeque<[u16; SBUF_WINDOW], Wrapping>,
    /// Sequence number the next delivery will be assigned
    next_seq: u32,
}

impl Default for SbufSeq {
    fn default() -> SbufSeq {
        SbufSeq {
            q: ArrayDeque::new(),
            next_seq: 0,
        }
    }
}

impl SbufSeq {
    fn push(&mut self, sbuf: u16) -> u32 {
        // wrapping deque: a full window drops its oldest entry
        let _ = self.q.push_back(sbuf);
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }

    fn oldest_seq(&self) -> u32 {
        self.next_seq.wrapping_sub(self.q.len() as u32)
    }

    /// Superbuf at `seq`, if it is still inside the tracked window.
    fn get(&self, seq: u32) -> Option<u16> {
        let back = self.next_seq.wrapping_sub(seq);
        if back == 0 || back > self.q.len() as u32 {
            return None;
        }
        self.q.get(self.q.len() - back as usize).copied()
    }
}

/// The part of one hardware receive queue's state that is reachable from
/// more than one execution context: the admission list and the pool
/// reference counts. Everything here is atomic.
pub struct RxQueueShared {
    new_apps: PendingList,
    superbuf_refcount: [AtomicU32; MAX_SUPERBUFS],
}

impl RxQueueShared {
    pub fn new() -> Arc<RxQueueShared> {
        const ZERO: AtomicU32 = AtomicU32::new(0);
        Arc::new(RxQueueShared {
            new_apps: PendingList::new(),
            superbuf_refcount: [ZERO; MAX_SUPERBUFS],
        })
    }

    /// Register a new receive-buffer subscription. Safe to call from any
    /// thread; the consumer admits the app on its next service pass.
    pub fn bind(&self, req: BindRequest) -> RxqHandle {
        let shared = Arc::new(RxqShared {
            qid: req.qid,
            destroy: AtomicBool::new(false),
            freer: Mutex::new(None),
        });

        let app = Box::new(RxqApp {
            next: ptr::null_mut(),
            shared: shared.clone(),
            affinity: req.affinity,
            timestamp_req: req.timestamp_req,
            max_allowed: req.hugepages.len() as u32 * SUPERBUFS_PER_HUGEPAGE,
            hugepages: req.hugepages,
            next_sbuf_seq: 0,
            current_owned: 0,
            owns: SuperbufBitmap::default(),
        });
        self.new_apps.push(app);

        RxqHandle { shared }
    }

    /// A superbuf's physical resources may be reclaimed only when this
    /// returns true.
    #[inline]
    pub fn superbuf_is_free(&self, sbuf: u16) -> bool {
        self.superbuf_refcount[sbuf as usize].load(Ordering::Acquire) == 0
    }

    #[inline]
    pub fn superbuf_refcount(&self, sbuf: u16) -> u32 {
        self.superbuf_refcount[sbuf as usize].load(Ordering::Acquire)
    }

    #[inline]
    fn ref_get(&self, sbuf: u16) {
        self.superbuf_refcount[sbuf as usize].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn ref_put(&self, sbuf: u16) {
        let prev = self.superbuf_refcount[sbuf as usize].fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }
}

/// Consumer-context state for one hardware receive queue: the live and
/// pending-destruction app sets and the superbuf delivery window. Only the
/// consumer context touches this, so no locking is needed.
pub struct RxQueue {
    shared: Arc<RxQueueShared>,
    live: Vec<Box<RxqApp>>,
    destroy: Vec<Box<RxqApp>>,
    sbufs: SbufSeq,
}

impl RxQueue {
    pub fn new() -> RxQueue {
        RxQueue {
            shared: RxQueueShared::new(),
            live: Vec::new(),
            destroy: Vec::new(),
            sbufs: SbufSeq::default(),
        }
    }

    /// Handle for the binding side.
    pub fn shared(&self) -> Arc<RxQueueShared> {
        self.shared.clone()
    }

    /// Admit pending apps and sweep destroy requests out of the live set.
    pub fn service(&mut self) {
        for mut app in self.shared.new_apps.take_all() {
            // start at the current delivery point; already-delivered
            // superbufs are not replayed for a new app
            app.next_sbuf_seq = self.sbufs.next_seq;
            log::debug!(
                "rxq {}: admitted app, affinity {:#x} timestamp {} max superbufs {}",
                app.shared.qid,
                app.affinity,
                app.timestamp_req,
                app.max_allowed
            );
            self.live.push(app);
        }

        let mut i = 0;
        while i < self.live.len() {
            if self.live[i].shared.destroy.load(Ordering::Acquire) {
                let app = self.live.swap_remove(i);
                self.destroy.push(app);
            } else {
                i += 1;
            }
        }
    }

    /// The device handed us a freshly filled superbuf. Record it in
    /// delivery order and hand ownership out to whichever live apps have
    /// room for it.
    pub fn superbuf_delivered(&mut self, sbuf: u16) {
        debug_assert!((sbuf as usize) < MAX_SUPERBUFS);
        self.service();
        self.sbufs.push(sbuf);

        let shared = &*self.shared;
        let sbufs = &self.sbufs;
        for app in &mut self.live {
            Self::catch_up(shared, sbufs, app);
        }
    }

    /// Grant tracked superbufs to `app` in delivery order until it is
    /// caught up or owns its maximum. A full app simply waits; the grant is
    /// deferred, not dropped.
    fn catch_up(shared: &RxQueueShared, sbufs: &SbufSeq, app: &mut RxqApp) {
        let oldest = sbufs.oldest_seq();
        if sbufs.next_seq.wrapping_sub(app.next_sbuf_seq) > sbufs.next_seq.wrapping_sub(oldest) {
            // fell behind the tracked window; those buffers are gone
            log::warn!(
                "rxq {}: app missed superbufs {}..{}",
                app.shared.qid,
                app.next_sbuf_seq,
                oldest
            );
            app.next_sbuf_seq = oldest;
        }

        while app.current_owned < app.max_allowed {
            let sbuf = match sbufs.get(app.next_sbuf_seq) {
                Some(sbuf) => sbuf,
                None => break, // caught up
            };

            debug_assert!(!app.owns.test(sbuf));
            app.owns.set(sbuf);
            app.current_owned += 1;
            shared.ref_get(sbuf);
            app.next_sbuf_seq = app.next_sbuf_seq.wrapping_add(1);
        }
    }

    /// An app handed a superbuf back (it is done reading it). Clears the
    /// ownership bit and drops the pool reference; returns false if the app
    /// did not own the buffer.
    pub fn app_returned(&mut self, qid: u32, sbuf: u16) -> bool {
        let shared = &*self.shared;
        let sbufs = &self.sbufs;
        for app in &mut self.live {
            if app.shared.qid != qid {
                continue;
            }
            if !app.owns.test(sbuf) {
                return false;
            }
            app.owns.clear(sbuf);
            app.current_owned -= 1;
            shared.ref_put(sbuf);
            // freeing a slot may unblock deferred grants
            Self::catch_up(shared, sbufs, app);
            return true;
        }

        false
    }

    /// Deferred reclamation pass. Releases every superbuf still owned by an
    /// app marked for destruction, then runs its teardown callback. Called
    /// from a background task so in-flight hardware references are never
    /// invalidated under the event path.
    pub fn reap(&mut self) {
        for app in self.destroy.drain(..) {
            for sbuf in app.owns.iter_set() {
                self.shared.ref_put(sbuf);
            }
            log::debug!("rxq {}: app destroyed", app.shared.qid);

            let freer = app.shared.freer.lock().unwrap().take();
            if let Some(freer) = freer {
                freer();
            }
        }
    }

    /// Backing pages of every live app, for the device management layer.
    pub fn hugepages(&self, out: &mut Vec<Hugepage>) {
        for app in &self.live {
            out.extend_from_slice(&app.hugepages);
        }
    }

    #[inline]
    pub fn live_apps(&self) -> usize {
        self.live.len()
    }

    /// Superbufs currently owned by the app bound as `qid`.
    pub fn owned_superbufs(&self, qid: u32) -> Option<u32> {
        self.live
            .iter()
            .find(|app| app.shared.qid == qid)
            .map(|app| app.current_owned)
    }

    /// Whether the app bound as `qid` currently owns `sbuf`.
    pub fn owns_superbuf(&self, qid: u32, sbuf: u16) -> Option<bool> {
        self.live
            .iter()
            .find(|app| app.shared.qid == qid)
            .map(|app| app.owns.test(sbuf))
    }
}

impl Default for RxQueue {
    fn default() -> RxQueue {
        RxQueue::new()
    }
}

/// All receive queues of one adapter.
pub struct RxRegistry {
    queues: Vec<RxQueue>,
}

impl RxRegistry {
    pub fn new(n_queues: usize) -> RxRegistry {
        assert!(n_queues <= MAX_RX_QUEUES);
        RxRegistry {
            queues: (0..n_queues).map(|_| RxQueue::new()).collect(),
        }
    }

    #[inline]
    pub fn queue(&self, hw_qid: usize) -> &RxQueue {
        &self.queues[hw_qid]
    }

    #[inline]
    pub fn queue_mut(&mut self, hw_qid: usize) -> &mut RxQueue {
        &mut self.queues[hw_qid]
    }
}
