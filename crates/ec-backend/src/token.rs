/// Token identifier as understood by the backend vocabulary.
pub type TokenId = i32;

/// Position of a token inside a sequence.
pub type Pos = i32;

/// Tag grouping tokens that belong to the same generation stream.
pub type SeqId = i32;
