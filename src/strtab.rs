//! Immutable string table: interns byte strings once and hands back an
//! atom that dereferences to the same bytes forever after.
//!
//! Short strings (length 0 or 1) never touch the allocator at all — they
//! decode straight out of a small static table, the fast path the design
//! notes call for. Longer strings are deduplicated through a
//! [`Patricia`] trie keyed on the bytes as stored (including the
//! terminator), so interning the same string twice returns the same atom.

use lazy_static::lazy_static;
use log::trace;

use crate::atom::{atom_from_raw, atom_to_raw, Atom};
use crate::error::Result;
use crate::patricia::Patricia;
use crate::pool::ArbitraryPool;
use crate::segment::Segment;

/// `256` single-byte entries, each stored as `[byte, 0x00]`; atom `1 +
/// byte` decodes to entry `byte`. A value of `0x00` decodes to the empty
/// string, since the stored byte doubles as its own terminator — callers
/// never intern a string containing an embedded NUL, so this is never
/// ambiguous with a genuine one-byte NUL string.
const SHORT_TABLE_LEN: usize = 512;

lazy_static! {
    static ref SHORT_STRING_TABLE: [u8; SHORT_TABLE_LEN] = {
        let mut t = [0u8; SHORT_TABLE_LEN];
        for b in 0..256usize {
            t[b * 2] = b as u8;
            t[b * 2 + 1] = 0;
        }
        t
    };
}

fn short_atom_for(bytes: &[u8]) -> Option<Atom> {
    match bytes.len() {
        0 => Some(atom_from_raw(1)),
        1 => Some(atom_from_raw(1 + bytes[0] as u32)),
        _ => None,
    }
}

fn is_short_atom(raw: u32) -> bool {
    (1..=256).contains(&raw)
}

fn decode_short(raw: u32) -> &'static [u8] {
    let b = (raw - 1) as usize;
    if b == 0 {
        &SHORT_STRING_TABLE[0..0]
    } else {
        &SHORT_STRING_TABLE[b * 2..b * 2 + 1]
    }
}

/// An interning table over a segment's arbitrary pool and Patricia trie.
///
/// The pool is kept behind a leaked `'seg` reference rather than owned
/// directly, so the trie's key function (which must itself live for
/// `'seg`, per [`Patricia::open`]) can close over it without a
/// self-referential struct. This leaks only the pool's own handful of
/// bytes, once per table open — not the segment or the strings in it —
/// matching the "lives as long as the segment is open" contract every
/// other handle in this crate already assumes.
/// Bytes past a record's logical length are whatever the allocator's
/// size class left behind (zeroed only the first time a page is carved
/// up, stale on reuse) — so every record is stored as a 4-byte
/// little-endian length prefix followed by exactly that many bytes.
/// `bytes_of` trims a raw pool buffer down to its real content; both the
/// trie's key function and `deref` go through it, so comparisons never
/// see class-padding or leftover bytes from a previous occupant.
const LEN_PREFIX: usize = 4;

fn bytes_of(buf: &[u8]) -> &[u8] {
    let len = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
    &buf[LEN_PREFIX..LEN_PREFIX + len]
}

pub struct ImmutableStringTable<'seg> {
    pool: &'seg ArbitraryPool<'seg>,
    trie: Patricia<'seg>,
}

impl<'seg> ImmutableStringTable<'seg> {
    pub fn open(segment: &'seg Segment, name: &str, max_pages: u32, max_atoms: u32, flags: u8) -> Result<ImmutableStringTable<'seg>> {
        let pool = ArbitraryPool::open(segment, &format!("{name}.bytes"), max_pages, flags)?;
        let pool: &'seg ArbitraryPool<'seg> = Box::leak(Box::new(pool));
        let trie = Patricia::open(segment, &format!("{name}.trie"), max_atoms, flags, move |atom: Atom| {
            pool.addr(atom).map(bytes_of).unwrap_or(&[])
        })?;
        Ok(ImmutableStringTable { pool, trie })
    }

    /// Intern `bytes` (expected to include any terminator the caller
    /// cares about, e.g. a trailing NUL for C-string semantics), returning
    /// the atom it is now addressable by. Interning the same bytes twice
    /// returns the same atom.
    pub fn intern(&self, bytes: &[u8]) -> Result<Atom> {
        if let Some(atom) = short_atom_for(bytes) {
            return Ok(atom);
        }
        if let Some(existing) = self.trie.get(bytes) {
            return Ok(existing);
        }
        let atom = self.pool.alloc(LEN_PREFIX + bytes.len())?;
        let buf = self.pool.addr_mut(atom).unwrap();
        buf[0..4].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
        buf[LEN_PREFIX..LEN_PREFIX + bytes.len()].copy_from_slice(bytes);
        self.trie.insert(atom)?;
        trace!("interned {} byte string as a fresh atom", bytes.len());
        Ok(atom)
    }

    /// Resolve `atom` back to the bytes it was interned with.
    pub fn deref(&self, atom: Atom) -> Option<&'seg [u8]> {
        let raw = atom_to_raw(atom);
        if raw == 0 {
            return None;
        }
        if is_short_atom(raw) {
            return Some(decode_short(raw));
        }
        self.pool.addr(atom).map(bytes_of)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn empty_and_single_byte_strings_use_the_short_path() {
        let f = NamedTempFile::new().unwrap();
        let seg = Segment::open(f.path()).unwrap();
        let table = ImmutableStringTable::open(&seg, "t", 16, 64, 0).unwrap();

        let empty = table.intern(b"").unwrap();
        assert_eq!(atom_to_raw(empty), 1);
        assert_eq!(table.deref(empty), Some(&b""[..]));

        let a = table.intern(b"a").unwrap();
        assert_eq!(atom_to_raw(a), 1 + b'a' as u32);
        assert_eq!(table.deref(a), Some(&b"a"[..]));
    }

    #[test]
    fn interning_the_same_long_string_twice_dedups() {
        let f = NamedTempFile::new().unwrap();
        let seg = Segment::open(f.path()).unwrap();
        let table = ImmutableStringTable::open(&seg, "t", 16, 64, 0).unwrap();

        let a = table.intern(b"hello world\0").unwrap();
        let b = table.intern(b"hello world\0").unwrap();
        assert_eq!(atom_to_raw(a), atom_to_raw(b));
        assert_eq!(table.deref(a), Some(&b"hello world\0"[..]));
    }

    #[test]
    fn distinct_long_strings_get_distinct_atoms() {
        let f = NamedTempFile::new().unwrap();
        let seg = Segment::open(f.path()).unwrap();
        let table = ImmutableStringTable::open(&seg, "t", 16, 64, 0).unwrap();

        let a = table.intern(b"apple\0").unwrap();
        let b = table.intern(b"banana\0").unwrap();
        assert_ne!(atom_to_raw(a), atom_to_raw(b));
        assert_eq!(table.deref(a), Some(&b"apple\0"[..]));
        assert_eq!(table.deref(b), Some(&b"banana\0"[..]));
    }
}
