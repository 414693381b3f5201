use crate::batch::Batch;
use crate::token::{Pos, SeqId};

/// One occupied KV cell.
#[derive(Debug, Clone)]
struct Cell {
    pos: Pos,
    seq_ids: Vec<SeqId>,
}

/// Bookkeeping half of a KV cache: which positions of which sequences are
/// stored. Each decoded batch entry occupies one cell until `clear`.
#[derive(Debug, Clone)]
pub struct KvCells {
    cells: Vec<Cell>,
    /// Maximum number of cells (the context's `n_ctx`).
    capacity: usize,
}

impl KvCells {
    /// Create an empty cache with room for `capacity` cells.
    pub fn new(capacity: usize) -> Self {
        KvCells {
            cells: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Store every entry of `batch`, or nothing if they do not all fit.
    pub fn insert(&mut self, batch: &Batch) -> bool {
        if batch.len() > self.free() {
            return false;
        }
        self.cells.extend(batch.entries().map(|e| Cell {
            pos: e.pos,
            seq_ids: e.seq_ids.to_vec(),
        }));
        true
    }

    /// Number of occupied cells.
    pub fn used(&self) -> usize {
        self.cells.len()
    }

    /// Number of cells still available.
    pub fn free(&self) -> usize {
        self.capacity - self.cells.len()
    }

    /// Highest stored position of `seq`, if any.
    pub fn max_pos(&self, seq: SeqId) -> Option<Pos> {
        self.cells
            .iter()
            .filter(|c| c.seq_ids.contains(&seq))
            .map(|c| c.pos)
            .max()
    }

    /// Drop all cells.
    pub fn clear(&mut self) {
        self.cells.clear();
    }
}
