use std::num::NonZeroU32;

/// A 32-bit index into some pool. Never a pointer: atoms remain valid
/// across unmap/remap as long as the owning pool is reopened with the same
/// shape parameters. The value 0 is reserved as null and is represented at
/// the Rust API boundary as `None`, so a caller cannot forget to check it.
pub type Atom = Option<NonZeroU32>;

/// Build an `Atom` from a raw record index. Returns `None` for 0.
#[inline]
pub fn atom_from_raw(raw: u32) -> Atom {
    NonZeroU32::new(raw)
}

/// Recover the raw on-disk representation of an atom (0 for `None`).
#[inline]
pub fn atom_to_raw(atom: Atom) -> u32 {
    atom.map_or(0, NonZeroU32::get)
}

/// A matom is an atom of the segment allocator: a page-granularity index.
pub type Matom = Option<NonZeroU32>;

#[inline]
pub fn matom_from_raw(raw: u32) -> Matom {
    NonZeroU32::new(raw)
}

#[inline]
pub fn matom_to_raw(matom: Matom) -> u32 {
    matom.map_or(0, NonZeroU32::get)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_null() {
        assert_eq!(atom_from_raw(0), None);
        assert_eq!(atom_to_raw(None), 0);
    }

    #[test]
    fn nonzero_round_trips() {
        let a = atom_from_raw(42);
        assert_eq!(atom_to_raw(a), 42);
    }
}
