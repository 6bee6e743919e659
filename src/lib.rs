//! ParrotDB: an atom-addressed persistent object store built directly on
//! a memory-mapped segment, plus a streaming XML tokenizer and a
//! rulebook-driven parser that builds a persistent tree from XML input.
//!
//! The storage layers (`segment`, `pool`, `patricia`, `strtab`, `bitmap`,
//! `tree`) never depend on the XML side; `xml` and `rulebook` are built
//! entirely on top of the atom-addressed primitives the storage layers
//! expose.

pub mod atom;
pub mod bitmap;
pub mod error;
pub mod patricia;
pub mod pool;
pub mod rulebook;
pub mod segment;
pub mod strtab;
pub mod tree;
pub mod xml;

pub use atom::{atom_from_raw, atom_to_raw, Atom, Matom};
pub use error::{ParrotError, Result};
pub use segment::Segment;
