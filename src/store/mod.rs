//! Job persistence seam.

pub mod memory;
pub mod traits;

pub use memory::MemoryJobStore;
pub use traits::JobStore;
