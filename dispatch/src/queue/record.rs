//! Layout of task records inside the ring.
//!
//! The ring is an arena of `Option<Record>` cells. A record spans one header cell (which holds
//! the [Record]) followed by enough continuation cells (always `None`) to account for the size of
//! its payload. Payloads are boxed and moved in, so a record's footprint only models capacity:
//! larger payloads consume proportionally more of the ring.

use super::Task;
use crate::barrier::Barrier;
use std::{mem, sync::Arc};

/// Bytes accounted to each cell of the ring.
pub const CELL_SIZE: usize = 64;

/// Cells occupied by a record whose payload has type `T`.
pub(crate) fn cells_for<T>() -> usize {
    1 + mem::size_of::<T>().div_ceil(CELL_SIZE)
}

/// A task that has not yet been admitted to the ring.
pub(crate) struct Pending {
    pub task: Box<dyn Task>,
    pub cells: usize,
    pub barrier: Option<Arc<Barrier>>,
}

/// Header of an admitted task.
pub(crate) struct Record {
    pub seq: u64,
    pub cells: usize,
    pub claimed: bool,
    pub finished: bool,

    /// Taken by the consumer that claims the record.
    pub task: Option<Box<dyn Task>>,

    /// Rendezvous with a blocked producer once the payload has run.
    pub barrier: Option<Arc<Barrier>>,
}

impl Record {
    pub fn new(seq: u64, pending: Pending) -> Self {
        Self {
            seq,
            cells: pending.cells,
            claimed: false,
            finished: false,
            task: Some(pending.task),
            barrier: pending.barrier,
        }
    }
}

/// A record claimed by a consumer.
pub(crate) struct Claim {
    /// Absolute index of the record's header cell.
    pub index: usize,
    pub seq: u64,
    pub task: Box<dyn Task>,
    pub barrier: Option<Arc<Barrier>>,
}
