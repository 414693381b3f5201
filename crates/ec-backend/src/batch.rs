use crate::error::BatchError;
use crate::token::{Pos, SeqId, TokenId};
use tracing::warn;

/// Per-entry payload storage. A batch carries either token ids or raw
/// embeddings, never both.
#[derive(Debug)]
enum Input {
    Tokens(Vec<TokenId>),
    Embeddings { data: Vec<f32>, dim: usize },
}

/// Fixed-capacity set of parallel arrays describing the tokens submitted to
/// the backend in one decode call.
///
/// Storage for all `capacity` slots is allocated up front. Only entries in
/// `[0, len())` are valid; `clear` resets the length without touching the
/// underlying memory, so stale slots are never observable through the API.
///
/// Layout:
///   tokens / embeddings: [capacity] or [capacity, embedding_dim]
///   pos, n_seq_id, logits: [capacity]
///   seq_id: flat array of shape [capacity, max_sequences]
#[derive(Debug)]
pub struct Batch {
    input: Input,
    pos: Vec<Pos>,
    n_seq_id: Vec<usize>,
    seq_id: Vec<SeqId>,
    logits: Vec<bool>,
    n_tokens: usize,
    capacity: usize,
    max_sequences: usize,
}

/// A read-only view of one valid batch entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchEntry<'a> {
    /// Token id, or `None` for embedding batches.
    pub token: Option<TokenId>,
    pub pos: Pos,
    pub seq_ids: &'a [SeqId],
    pub logits: bool,
}

/// Allocate `len` copies of `value`, reporting allocator failure instead of
/// aborting the process.
fn try_filled<T: Clone>(len: usize, value: T, what: &str) -> Result<Vec<T>, BatchError> {
    let mut v = Vec::new();
    if let Err(e) = v.try_reserve_exact(len) {
        warn!(what, len, error = %e, "batch allocation failed");
        return Err(BatchError::Allocation(format!("{what} ({len} slots): {e}")));
    }
    v.resize(len, value);
    Ok(v)
}

impl Batch {
    /// Allocate a batch able to hold `capacity` entries.
    ///
    /// If `embedding_dim > 0` the batch stores float embeddings of that width
    /// instead of token ids. Each entry may belong to at most `max_sequences`
    /// sequences.
    ///
    /// # Errors
    /// `InvalidArgument` for a zero capacity or zero `max_sequences`,
    /// `Allocation` if any member cannot be allocated. Members allocated
    /// before the failure are released on return.
    pub fn new(
        capacity: usize,
        embedding_dim: usize,
        max_sequences: usize,
    ) -> Result<Batch, BatchError> {
        if capacity == 0 {
            return Err(BatchError::InvalidArgument(
                "capacity must be greater than zero".to_string(),
            ));
        }
        if max_sequences == 0 {
            return Err(BatchError::InvalidArgument(
                "max_sequences must be greater than zero".to_string(),
            ));
        }

        let input = if embedding_dim > 0 {
            let len = capacity.checked_mul(embedding_dim).ok_or_else(|| {
                BatchError::Allocation(format!(
                    "embedding storage overflows: {capacity} x {embedding_dim}"
                ))
            })?;
            Input::Embeddings {
                data: try_filled(len, 0.0f32, "embeddings")?,
                dim: embedding_dim,
            }
        } else {
            Input::Tokens(try_filled(capacity, 0, "tokens")?)
        };

        let seq_len = capacity.checked_mul(max_sequences).ok_or_else(|| {
            BatchError::Allocation(format!(
                "sequence id storage overflows: {capacity} x {max_sequences}"
            ))
        })?;

        Ok(Batch {
            input,
            pos: try_filled(capacity, 0, "positions")?,
            n_seq_id: try_filled(capacity, 0, "sequence counts")?,
            seq_id: try_filled(seq_len, 0, "sequence ids")?,
            logits: try_filled(capacity, false, "logits flags")?,
            n_tokens: 0,
            capacity,
            max_sequences,
        })
    }

    /// Forget all entries. O(1); memory is reused by later `add` calls.
    pub fn clear(&mut self) {
        self.n_tokens = 0;
    }

    /// Append a token entry.
    ///
    /// # Errors
    /// `CapacityExceeded` when the batch is full, `TooManySequences` when
    /// `seq_ids` is longer than `max_sequences`, `WrongInput` on an embedding
    /// batch. The batch is unchanged on error.
    pub fn add(
        &mut self,
        token: TokenId,
        pos: Pos,
        seq_ids: &[SeqId],
        logits: bool,
    ) -> Result<(), BatchError> {
        let tokens = match &mut self.input {
            Input::Tokens(tokens) => tokens,
            Input::Embeddings { .. } => {
                return Err(BatchError::WrongInput {
                    holds: "embeddings",
                    adding: "a token",
                })
            }
        };
        let slot = Self::check_slot(self.n_tokens, self.capacity, self.max_sequences, seq_ids)?;
        tokens[slot] = token;
        self.commit(slot, pos, seq_ids, logits);
        Ok(())
    }

    /// Append an embedding entry of exactly `embedding_dim()` floats.
    ///
    /// # Errors
    /// Same conditions as [`Batch::add`], plus `InvalidArgument` for an
    /// embedding of the wrong width and `WrongInput` on a token batch.
    pub fn add_embedding(
        &mut self,
        embedding: &[f32],
        pos: Pos,
        seq_ids: &[SeqId],
        logits: bool,
    ) -> Result<(), BatchError> {
        let (data, dim) = match &mut self.input {
            Input::Embeddings { data, dim } => (data, *dim),
            Input::Tokens(_) => {
                return Err(BatchError::WrongInput {
                    holds: "tokens",
                    adding: "an embedding",
                })
            }
        };
        if embedding.len() != dim {
            return Err(BatchError::InvalidArgument(format!(
                "embedding has {} values, batch expects {dim}",
                embedding.len()
            )));
        }
        let slot = Self::check_slot(self.n_tokens, self.capacity, self.max_sequences, seq_ids)?;
        data[slot * dim..(slot + 1) * dim].copy_from_slice(embedding);
        self.commit(slot, pos, seq_ids, logits);
        Ok(())
    }

    fn check_slot(
        n_tokens: usize,
        capacity: usize,
        max_sequences: usize,
        seq_ids: &[SeqId],
    ) -> Result<usize, BatchError> {
        if n_tokens == capacity {
            return Err(BatchError::CapacityExceeded { capacity });
        }
        if seq_ids.len() > max_sequences {
            return Err(BatchError::TooManySequences {
                given: seq_ids.len(),
                max: max_sequences,
            });
        }
        Ok(n_tokens)
    }

    fn commit(&mut self, slot: usize, pos: Pos, seq_ids: &[SeqId], logits: bool) {
        self.pos[slot] = pos;
        self.n_seq_id[slot] = seq_ids.len();
        let row = slot * self.max_sequences;
        self.seq_id[row..row + seq_ids.len()].copy_from_slice(seq_ids);
        self.logits[slot] = logits;
        self.n_tokens += 1;
    }

    /// Number of valid entries.
    pub fn len(&self) -> usize {
        self.n_tokens
    }

    /// Returns true if the batch holds no valid entries.
    pub fn is_empty(&self) -> bool {
        self.n_tokens == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_sequences(&self) -> usize {
        self.max_sequences
    }

    /// Embedding width, or 0 for a token batch.
    pub fn embedding_dim(&self) -> usize {
        match &self.input {
            Input::Tokens(_) => 0,
            Input::Embeddings { dim, .. } => *dim,
        }
    }

    /// Valid token ids, or `None` for an embedding batch.
    pub fn tokens(&self) -> Option<&[TokenId]> {
        match &self.input {
            Input::Tokens(tokens) => Some(&tokens[..self.n_tokens]),
            Input::Embeddings { .. } => None,
        }
    }

    /// Embedding of entry `i`, if `i` is valid and this is an embedding batch.
    pub fn embedding(&self, i: usize) -> Option<&[f32]> {
        match &self.input {
            Input::Embeddings { data, dim } if i < self.n_tokens => {
                Some(&data[i * dim..(i + 1) * dim])
            }
            _ => None,
        }
    }

    /// Positions of all valid entries.
    pub fn positions(&self) -> &[Pos] {
        &self.pos[..self.n_tokens]
    }

    /// Sequence ids of entry `i`; empty when `i` is out of range.
    pub fn seq_ids(&self, i: usize) -> &[SeqId] {
        if i >= self.n_tokens {
            return &[];
        }
        let row = i * self.max_sequences;
        &self.seq_id[row..row + self.n_seq_id[i]]
    }

    /// Whether the backend should compute logits for entry `i`.
    pub fn wants_logits(&self, i: usize) -> bool {
        i < self.n_tokens && self.logits[i]
    }

    /// View of entry `i`, if valid.
    pub fn entry(&self, i: usize) -> Option<BatchEntry<'_>> {
        if i >= self.n_tokens {
            return None;
        }
        Some(BatchEntry {
            token: self.tokens().map(|t| t[i]),
            pos: self.pos[i],
            seq_ids: self.seq_ids(i),
            logits: self.logits[i],
        })
    }

    /// Iterate over all valid entries in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = BatchEntry<'_>> + '_ {
        (0..self.n_tokens).filter_map(move |i| self.entry(i))
    }

    /// Indices of entries flagged for logits output, in order.
    pub fn output_indices(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.n_tokens).filter(move |&i| self.logits[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_until_full() {
        let mut batch = Batch::new(3, 0, 1).unwrap();
        for i in 0..3 {
            batch.add(10 + i, i, &[0], false).unwrap();
        }
        assert_eq!(batch.len(), 3);

        let err = batch.add(99, 3, &[0], true).unwrap_err();
        assert_eq!(err, BatchError::CapacityExceeded { capacity: 3 });
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.tokens().unwrap(), &[10, 11, 12]);
        assert!(!batch.wants_logits(2));
    }

    #[test]
    fn test_clear_behaves_like_fresh() {
        let mut used = Batch::new(4, 0, 2).unwrap();
        for i in 0..4 {
            used.add(i, i, &[0, 1], true).unwrap();
        }
        used.clear();
        assert_eq!(used.len(), 0);
        assert!(used.is_empty());
        assert_eq!(used.entries().count(), 0);

        let mut fresh = Batch::new(4, 0, 2).unwrap();
        used.add(7, 0, &[1], false).unwrap();
        fresh.add(7, 0, &[1], false).unwrap();
        assert_eq!(used.entry(0), fresh.entry(0));
        // The stale second sequence id of slot 0 must not leak.
        assert_eq!(used.seq_ids(0), &[1]);
        assert_eq!(used.entry(1), None);
    }

    #[test]
    fn test_entry_fields() {
        let mut batch = Batch::new(2, 0, 4).unwrap();
        batch.add(5, 0, &[0], false).unwrap();
        batch.add(6, 1, &[0, 2, 3], true).unwrap();

        let e = batch.entry(1).unwrap();
        assert_eq!(e.token, Some(6));
        assert_eq!(e.pos, 1);
        assert_eq!(e.seq_ids, &[0, 2, 3]);
        assert!(e.logits);
        assert_eq!(batch.positions(), &[0, 1]);
        assert_eq!(batch.output_indices().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_too_many_sequences() {
        let mut batch = Batch::new(2, 0, 1).unwrap();
        let err = batch.add(1, 0, &[0, 1], true).unwrap_err();
        assert_eq!(err, BatchError::TooManySequences { given: 2, max: 1 });
        assert!(batch.is_empty());
    }

    #[test]
    fn test_embedding_batch() {
        let mut batch = Batch::new(2, 3, 1).unwrap();
        assert_eq!(batch.embedding_dim(), 3);
        assert!(batch.tokens().is_none());

        batch.add_embedding(&[1.0, 2.0, 3.0], 0, &[0], true).unwrap();
        assert_eq!(batch.embedding(0).unwrap(), &[1.0, 2.0, 3.0]);
        assert_eq!(batch.entry(0).unwrap().token, None);

        assert!(matches!(
            batch.add(1, 1, &[0], false),
            Err(BatchError::WrongInput { .. })
        ));
        assert!(matches!(
            batch.add_embedding(&[1.0], 1, &[0], false),
            Err(BatchError::InvalidArgument(_))
        ));
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_token_batch_rejects_embeddings() {
        let mut batch = Batch::new(1, 0, 1).unwrap();
        assert!(matches!(
            batch.add_embedding(&[0.5], 0, &[0], false),
            Err(BatchError::WrongInput { .. })
        ));
    }

    #[test]
    fn test_invalid_construction() {
        assert!(matches!(
            Batch::new(0, 0, 1),
            Err(BatchError::InvalidArgument(_))
        ));
        assert!(matches!(
            Batch::new(1, 0, 0),
            Err(BatchError::InvalidArgument(_))
        ));
        assert!(matches!(
            Batch::new(usize::MAX, 2, 1),
            Err(BatchError::Allocation(_))
        ));
        // Too large for the allocator: reported, not aborted.
        assert!(matches!(
            Batch::new(usize::MAX / 2, 0, 1),
            Err(BatchError::Allocation(_))
        ));
    }
}
