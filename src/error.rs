// Error taxonomy for the codec, the network and the objective.
//
// Everything in the crate returns anyhow::Result; these are the typed failures
// callers can recover with `err.downcast_ref::<ModelError>()`.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    /// Character outside the alphabet, usually a corpus/alphabet mismatch.
    #[error("unknown character {0:?}")]
    UnknownCharacter(char),

    /// Id outside `[0, num_chars)`. The end sentinel has no character and is never
    /// fed back as input, so it lands here too.
    #[error("invalid id {id} (alphabet has {num_chars} characters)")]
    InvalidId { id: u32, num_chars: usize },

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("sequence {index} in batch is empty")]
    EmptySequence { index: usize },

    #[error("batch is empty")]
    EmptyBatch,

    #[error("alphabet is empty")]
    EmptyAlphabet,

    #[error("character {0:?} appears more than once in the alphabet")]
    DuplicateCharacter(char),
}

impl ModelError {
    pub fn shape(msg: impl Into<String>) -> Self {
        Self::ShapeMismatch(msg.into())
    }
}
