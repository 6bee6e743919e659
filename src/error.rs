use std::io;

use thiserror::Error;

/// Every failure mode a `parrotdb` operation can report.
///
/// Ordinary allocator/tokenizer failures (EOF, a malformed document, a pool
/// at capacity) are not programmer errors: they are returned here rather
/// than panicking. Contract violations — a zero-length interning key,
/// freeing an atom that was never issued, deleting the root of a non-empty
/// trie — remain `assert!`/`panic!` at the call site, per the propagation
/// policy in the design notes.
#[derive(Debug, Error)]
pub enum ParrotError {
    /// Normal end of input; not a failure.
    #[error("end of input")]
    Eof,

    /// The tokenizer hit malformed markup. The source is latched: every
    /// subsequent `next_token` call returns this again until the source is
    /// dropped.
    #[error("malformed input at line {line}")]
    Fail { line: u64 },

    /// A header with this name already exists with a different type or
    /// declared size.
    #[error("header {name:?} exists with a different shape")]
    Shape { name: String },

    /// A fixed pool has reached `max_atoms` and cannot allocate further.
    #[error("pool exhausted at {max_atoms} atoms")]
    Full { max_atoms: u32 },

    /// Attempted to insert a key that already exists, or that is a proper
    /// prefix/superset of an existing key, into a Patricia trie.
    #[error("duplicate or overlapping key")]
    Dup,

    /// Attempted to look up or delete a node that is not present.
    #[error("no such entry")]
    NotFound,

    /// The parse driver's state stack was non-empty at EOF.
    #[error("unbalanced state stack: {depth} states still pushed")]
    Unbalanced { depth: usize },

    /// A visitor invoked by an `emit` action asked the drive to stop.
    #[error("aborted by visitor")]
    Abort,

    /// Underlying I/O failure opening, reading, or mapping a segment file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ParrotError>;
