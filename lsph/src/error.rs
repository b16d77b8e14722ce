use thiserror::Error;

/// Errors surfaced by store filling and structure construction.
///
/// [`Error::DuplicateKey`] is expected and drives the bounded reseed loop;
/// all other variants are terminal. Lookups never error.
#[derive(Error, Debug)]
pub enum Error {
    /// Two keys produced the same 192-bit hash: either a true duplicate in the
    /// input or an adversarial collision. Recoverable by reseeding the store.
    #[error("duplicate key or 192-bit hash collision")]
    DuplicateKey,

    /// The local seed space of some bucket was exhausted without finding
    /// a solvable system.
    #[error("seed space exhausted for bucket {bucket}")]
    Unsolvable { bucket: usize },

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    /// A construction worker panicked; the partial structure was dropped.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
