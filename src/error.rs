//! Error types for sdc-protect

use thiserror::Error;

/// Reasons a guarded block is left untransformed.
///
/// None of these abort a protection pass: the block is logged, skipped,
/// and processing continues with the remaining candidates.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    /// The guard's exit target lies at or before the guard
    #[error("guard jumps backward to {target}")]
    BackwardJump { target: usize },

    /// The guarded range contains no instructions
    #[error("guarded range is empty")]
    EmptyBlock,

    /// The compared constant does not carry enough entropy
    #[error("constant {0} has too little entropy")]
    LowEntropyConstant(String),

    /// The conditional is not a `local != constant` comparison
    #[error("not a guard candidate: {0}")]
    NotACandidate(String),

    /// A switch instruction appears inside the block
    #[error("switch instruction at {0} inside block")]
    SwitchInBlock(usize),

    /// A superclass method is invoked inside the block
    #[error("superclass call to {0} inside block")]
    SuperCall(String),

    /// An instruction outside the block jumps into it
    #[error("instruction {from} jumps into block at {to}")]
    JumpIntoBlock { from: usize, to: usize },

    /// An exception handler region only partially overlaps the block
    #[error("exception region {begin}..{end} partially overlaps block")]
    PartialTrap { begin: usize, end: usize },

    /// The block partially overlaps another guarded block
    #[error("range {start}..{end} partially overlaps guarded block {other_start}..{other_end}")]
    PartialContainment {
        start: usize,
        end: usize,
        other_start: usize,
        other_end: usize,
    },

    /// The compared value's type cannot be digested
    #[error("unsupported comparison: {0}")]
    UnsupportedCompareType(String),

    /// The rewritten code failed structural checks
    #[error("validation failed: {0}")]
    Validation(String),
}

/// Fatal failures inside the managed loader.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoaderError {
    /// The payload did not decrypt to a unit image
    #[error("failed to decrypt unit {unit}: {reason}")]
    Decrypt { unit: String, reason: String },

    /// The decrypted image could not be linked into the runtime
    #[error("failed to link unit {unit}: {reason}")]
    Link { unit: String, reason: String },

    /// The unit has no public static entry point
    #[error("entry point not found in unit {0}")]
    EntryNotFound(String),
}

/// Protection error types
#[derive(Debug, Error)]
pub enum SdcError {
    /// A guarded block was rejected
    #[error("Block rejected: {0}")]
    Rejected(#[from] Rejection),

    /// Structural validation of a body failed
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Unit image (de)serialization failed
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// File not found
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid key format
    #[error("Invalid key format: {0}")]
    InvalidKey(String),

    /// Native code generation or packaging failed
    #[error("Native packaging failed: {0}")]
    Native(String),

    /// External collaborator (front-end, toolchain, archive) failed
    #[error("Collaborator error: {0}")]
    Collaborator(#[from] anyhow::Error),
}

impl From<serde_json::Error> for SdcError {
    fn from(e: serde_json::Error) -> Self {
        SdcError::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for SdcError {
    fn from(e: bincode::Error) -> Self {
        SdcError::Serialization(e.to_string())
    }
}

/// Result type for protection operations
pub type SdcResult<T> = Result<T, SdcError>;
