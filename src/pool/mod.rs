//! Atom-addressed pools built on top of a [`Segment`](crate::segment::Segment).

pub mod arbitrary;
pub mod fixed;

pub use arbitrary::ArbitraryPool;
pub use fixed::FixedPool;

/// Causes a pool's freshly mapped pages to be zeroed before their first
/// use. Corresponds to the `INIT_ZERO` flag in the design notes.
pub const INIT_ZERO: u8 = 1 << 0;
