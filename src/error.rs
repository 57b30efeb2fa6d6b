//! Error kinds for the virtualization pipeline (spec §7). All variants here
//! are fatal: the pipeline aborts and no partial output is written. Warnings
//! (unsupported operand falling back to native embedding) are logged through
//! `tracing::warn!` and never take this path.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CovirtError {
    #[error("input is neither a valid ELF64 nor PE64 image")]
    UnknownFormat,

    #[error("binary appears to be missing a start or end region marker")]
    MissingMarker,

    #[error("found no code markers in binary")]
    NoRegions,

    #[error("jump at {at:#x} targets {target:#x}, which escapes the protected region [{start:#x}, {end:#x})")]
    JumpEscapesRegion {
        at: u64,
        target: u64,
        start: u64,
        end: u64,
    },

    #[error("lifted bytecode requires {0} bytes, which exceeds the configured code space; retry with a larger -vcode")]
    CodeSpaceExhausted(usize),

    #[error("expression lowering ran out of scratch registers")]
    RegisterExhausted,

    #[error("{pass} failed to serialize the generated program: {message}")]
    SerializerFailure { pass: String, message: String },

    #[error("no section found for address {0:#x}")]
    SectionNotFound(u64),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to parse input object: {0}")]
    Object(#[from] object::read::Error),
}

pub type Result<T> = std::result::Result<T, CovirtError>;
