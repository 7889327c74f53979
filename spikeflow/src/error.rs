//! Error types for the simulation core.
//!
//! Failures fall into three kinds: problems detected while assembling a
//! chunk ([`BuildError`], fatal at `finalize_build`), problems during
//! stepping ([`RuntimeError`], fatal for the run), and I/O problems writing
//! probe output, which are deliberately non-fatal for the step loop and are
//! reported through the `log` facade instead.

use thiserror::Error;

use crate::signal::Key;

/// Errors detected while assembling a chunk.
#[derive(Debug, Error)]
pub enum BuildError {
    /// A base signal was added twice under the same key.
    #[error("duplicate signal key {0}")]
    DuplicateKey(Key),

    /// A view or probe referenced a key no signal carries.
    #[error("unknown signal key {0}")]
    UnknownKey(Key),

    /// A probe was requested under a key no probe carries.
    #[error("unknown probe key {0}")]
    UnknownProbe(Key),

    /// A probe was added twice under the same key.
    #[error("duplicate probe key {0}")]
    DuplicateProbe(Key),

    /// A view's offset, shape and strides reach outside its base signal.
    #[error("view '{label}' exceeds base signal {base} (length {len})")]
    ViewOutOfBounds { label: String, base: Key, len: usize },

    /// Operand shapes do not line up.
    #[error("shape mismatch in {0}")]
    ShapeMismatch(String),

    /// Filter coefficients that cannot describe a filter.
    #[error("invalid filter coefficients: {0}")]
    BadFilter(String),

    /// A probe period below one.
    #[error("probe period must be at least 1 (probe {0})")]
    BadPeriod(Key),

    /// A send or receive whose mirror image is missing on the peer.
    #[error("no matching {expected} for (peer {peer}, tag {tag})")]
    MissingPeer { expected: &'static str, peer: usize, tag: u32 },

    /// A matched send/receive pair with disagreeing element counts.
    #[error("element count mismatch on (peer {peer}, tag {tag}): send {send_len}, recv {recv_len}")]
    CountMismatch { peer: usize, tag: u32, send_len: usize, recv_len: usize },

    /// A communication operator using a reserved tag.
    #[error("tag {0} is reserved")]
    ReservedTag(u32),

    /// An operator kind this build does not recognize.
    #[error("unrecognized operator kind: {0}")]
    UnknownOpKind(String),

    /// A host callback reference with no registered callable.
    #[error("no host callback registered under {0}")]
    UnknownCallback(u64),

    /// Build validation failed on another process; the root has the details.
    #[error("communication table validation failed (reported at the root)")]
    ValidationFailed,

    /// The build protocol was violated.
    #[error("build protocol violation: {0}")]
    Protocol(String),
}

/// Errors during stepping. Fatal; the run is abandoned.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A host callback reported failure.
    #[error("host callback {fn_ref} failed: {message}")]
    CallbackFailed { fn_ref: u64, message: String },

    /// A host callback returned a tensor of the wrong size.
    #[error("host callback {fn_ref} returned {found} values, expected {expected}")]
    CallbackShape { fn_ref: u64, expected: usize, found: usize },

    /// The communication fabric failed underneath the run.
    #[error("communication failure: {0}")]
    Comm(#[from] anyhow::Error),

    /// A peer process reported failure.
    #[error("process {rank} reported: {message}")]
    Remote { rank: usize, message: String },
}

/// Any error the engine surfaces to its caller.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<anyhow::Error> for Error {
    fn from(error: anyhow::Error) -> Self {
        Error::Runtime(RuntimeError::Comm(error))
    }
}

impl From<bincode::Error> for Error {
    fn from(error: bincode::Error) -> Self {
        Error::Runtime(RuntimeError::Comm(anyhow::Error::new(error)))
    }
}

/// The result type used throughout the simulation core.
pub type Result<T> = std::result::Result<T, Error>;
