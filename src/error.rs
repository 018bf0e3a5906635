use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced across the pager, WAL, and B+tree engine.
///
/// Variants split along the line drawn in the error-handling design: user-level
/// rejections that leave the tree untouched, corruption/IO failures that leave the
/// store in an indeterminate state until the next successful open, and internal
/// assertions that must never fire on well-formed input.
#[derive(Debug, Error)]
pub enum Error {
    #[error("key already exists")]
    KeyExists,

    #[error("key not found")]
    KeyNotFound,

    #[error("key too large: {0} bytes (max {1})")]
    KeyTooLarge(usize, usize),

    #[error("value too large: {0} bytes (max {1})")]
    ValueTooLarge(usize, usize),

    #[error("invalid file signature")]
    InvalidFileSignature,

    #[error("corrupt file: {0}")]
    CorruptFile(&'static str),

    #[error("wal checksum mismatch at offset {0}")]
    ChecksumMismatch(u64),

    #[error("short write: wrote {wrote} of {expected} bytes")]
    WriteSizeMismatch { wrote: usize, expected: usize },

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("internal assertion failed: operand pages are the same page")]
    SamePage,

    #[error("internal assertion failed: sibling page is empty")]
    SiblingEmpty,

    #[error("internal assertion failed: page overflow escaped the split path")]
    PageOverflow,
}

/// Outcome of a page-local mutation that may not fit.
///
/// Kept separate from [`Error`] on purpose: an out-of-space page is a routine signal
/// to split, not a failure, so it never reaches the places that match on [`Error`]. A
/// leaf/internal page operation returns this instead, and only the tree's split
/// logic ever inspects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOp {
    Done,
    Full,
}

impl PageOp {
    pub fn is_full(self) -> bool {
        matches!(self, PageOp::Full)
    }
}
