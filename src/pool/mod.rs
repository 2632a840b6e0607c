//! Display output pool.
//!
//! A fixed table of scanout slots and their lifecycle state. The pool is
//! pure state: it performs no I/O and holds no references to encoders,
//! connections, or leases. The lease broker is the only writer; everything
//! else reads snapshots.

pub mod slot;
pub mod table;

pub use slot::{ScanoutSlot, SlotState};
pub use table::{SlotTable, DEFAULT_POOL_SIZE};
