// src/error.rs

use std::path::PathBuf;
use thiserror::Error;

/// Failures of looper operations. Precondition violations (finalizing twice,
/// finalizing with nothing recorded) mean a caller bug; the engine logs them
/// and leaves state untouched.
#[derive(Debug, Error, PartialEq)]
pub enum LooperError {
    #[error("buffer is already finalized")]
    AlreadyFinalized,
    #[error("finalize called without any recording")]
    NothingRecorded,
    #[error("unquantized finalize needs the recording to start at 0, it started at {0}")]
    UnalignedStart(usize),
    #[error("finalize would produce an empty buffer at index {0}")]
    EmptyRecording(usize),
    #[error("reference length {reference} does not fit into buffer capacity {capacity}")]
    ReferenceTooLong { reference: usize, capacity: usize },
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("command '{command}': {reason}")]
    BadArgument { command: String, reason: String },
    #[error("song part {0} does not exist")]
    NoSuchPart(usize),
    #[error("pattern file {path}: {reason}")]
    InvalidPattern { path: PathBuf, reason: String },
    #[error("drum sound '{name}': {reason}")]
    InvalidSound { name: String, reason: String },
    #[error("no song selected")]
    NoSongSelected,
    #[error("no drum kit available")]
    NoDrumKit,
}

pub type LooperResult<T> = Result<T, LooperError>;
