pub mod aperture;
pub mod evq;
pub mod hw;
pub mod mmap_area;
pub mod rxq;
pub mod txq;
pub mod vi;

mod util;

pub const POLL_BATCH: usize = 64; // TODO: Experiment with size
