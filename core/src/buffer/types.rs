//! buffer/types.rs
//! Progress signal shared by every transform stage, the cursor commit
//! record, and the contract-violation error raised when a caller breaks a
//! cursor or buffer precondition.

use thiserror::Error;

use crate::buffer::cursor::{InputCursor, OutputCursor};

/// Outcome of one transform step.
///
/// Every stage (copy, compression, cipher) reports one of these after it
/// has moved as many bytes as it could.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The stage drained its input and needs more bytes to continue.
    NeedInput,
    /// The stage still has output to produce but the output cursor is full.
    OutputFull,
    /// The stage has produced its final byte and marked its output
    /// end-of-stream.
    Done,
}

impl Progress {
    #[inline]
    pub fn is_done(self) -> bool {
        matches!(self, Progress::Done)
    }
}

/// One forward step of a pipeline stage: move bytes from `input` to `out`.
///
/// A stage reports `Done` only after its input cursor is end-of-stream and
/// drained and every byte it owes has been produced; it marks `out`
/// end-of-stream at that point.
pub trait TransformStage {
    type Error;

    fn transform(&mut self, out: &mut OutputCursor<'_>, input: &mut InputCursor<'_>) -> Result<Progress, Self::Error>;
}

/// Stage that forwards bytes unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl TransformStage for Passthrough {
    type Error = ContractViolation;

    fn transform(&mut self, out: &mut OutputCursor<'_>, input: &mut InputCursor<'_>) -> Result<Progress, Self::Error> {
        Ok(input.copy_into(out))
    }
}

/// Snapshot of a cursor after a stage ran over it.
///
/// `base` is the owner-relative index the cursor started at, `moved` the
/// number of bytes consumed (input) or produced (output). The staging
/// buffer refuses a state whose `base` does not match its current head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorState {
    pub base: usize,
    pub moved: usize,
    pub end_of_stream: bool,
}

/// Broken precondition in this layer or its caller.
///
/// These are bugs, not data problems. They are surfaced as errors so the
/// owning session can be torn down without taking the process with it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContractViolation {
    #[error("cursor advance of {requested} bytes exceeds remaining {remaining}")]
    AdvanceOverrun { requested: usize, remaining: usize },

    #[error("cursor reduce of {requested} bytes exceeds remaining {remaining}")]
    ReduceOverrun { requested: usize, remaining: usize },

    #[error("staging buffer ordering broken: read={read} write={write} capacity={capacity}")]
    BufferOrder { read: usize, write: usize, capacity: usize },

    #[error("cursor state does not belong to this buffer head (expected base {expected}, got {got})")]
    ForeignCursor { expected: usize, got: usize },

    #[error("operation requires {expected} orientation")]
    WrongOrientation { expected: &'static str },

    #[error("{operation} called out of sequence while {state}")]
    OutOfSequence { operation: &'static str, state: &'static str },

    #[error("alignment {alignment} is not a non-zero power of two")]
    BadAlignment { alignment: usize },

    #[error("session poisoned by an earlier contract violation")]
    Poisoned,
}
