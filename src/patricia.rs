//! Patricia trie over byte-string keys, generalized from this crate's
//! predecessor's copy-on-write B+-tree (`slicebtree`) to the bit-indexed,
//! back-linking structure the design notes call for: a key function
//! supplied at open time converts a data atom into the bytes to compare,
//! so the trie itself never owns or copies key bytes.
//!
//! Keys are assumed null-terminated (or otherwise arranged so that no key
//! is a proper prefix of another) — the dedup use in [`crate::strtab`]
//! gets this for free from C-string semantics.

use log::trace;

use crate::atom::{atom_from_raw, atom_to_raw, Atom, Matom};
use crate::error::{ParrotError, Result};
use crate::pool::{FixedPool, INIT_ZERO};
use crate::segment::{FlexibleMemory, HeaderType, Segment};

#[repr(C)]
struct RootInfo {
    top: u32,
    key_len: u32,
}

#[repr(C)]
struct NodeRecord {
    bit_index: u32,
    left: u32,
    right: u32,
    data: u32,
}

const NODE_RECORD_SIZE: u32 = std::mem::size_of::<NodeRecord>() as u32;

/// Pack a (byte offset, bit-within-byte) pair into the monotonically
/// increasing bit index the walk algorithms compare numerically. `bit`
/// counts from the most significant bit (`bit == 0`) to the least (`bit
/// == 7`); the low byte stores `!(0x80 >> bit)` so that deeper bits
/// within a byte, and later bytes across the key, both sort larger.
fn pack_bit_index(byte_offset: u32, bit: u32) -> u32 {
    let hi_bit_mask: u8 = 0x80 >> bit;
    let mask = !hi_bit_mask;
    (byte_offset << 8) | mask as u32
}

fn test_bit(key: &[u8], bit_index: u32) -> bool {
    let byte_offset = (bit_index >> 8) as usize;
    if byte_offset >= key.len() {
        return false;
    }
    let mask = !(bit_index as u8);
    key[byte_offset] & mask != 0
}

/// First bit (in `pack_bit_index` order) at which `a` and `b` differ.
/// Bytes past the shorter key are treated as zero, consistent with
/// `test_bit`'s out-of-range behavior.
fn first_differing_bit(a: &[u8], b: &[u8]) -> Option<u32> {
    let len = a.len().max(b.len());
    for byte_offset in 0..len {
        let ab = a.get(byte_offset).copied().unwrap_or(0);
        let bb = b.get(byte_offset).copied().unwrap_or(0);
        if ab == bb {
            continue;
        }
        let diff = ab ^ bb;
        for bit in 0..8u32 {
            if diff & (0x80 >> bit) != 0 {
                return Some(pack_bit_index(byte_offset as u32, bit));
            }
        }
    }
    None
}

/// A bit-indexed trie over keys resolved from data atoms by a caller-
/// supplied key function. Parameterized by `'seg` (segment lifetime) and
/// `'k` (the key function closure's own lifetime, usually `'seg` too).
pub struct Patricia<'seg> {
    segment: &'seg Segment,
    root_page: u32,
    nodes: FixedPool<'seg>,
    key_fn: Box<dyn Fn(Atom) -> &'seg [u8] + 'seg>,
}

impl<'seg> Patricia<'seg> {
    pub fn open(
        segment: &'seg Segment,
        name: &str,
        max_atoms: u32,
        flags: u8,
        key_fn: impl Fn(Atom) -> &'seg [u8] + 'seg,
    ) -> Result<Patricia<'seg>> {
        let root_header = segment.header(
            &format!("{name}.root"),
            HeaderType::Patricia,
            flags,
            std::mem::size_of::<RootInfo>() as u64,
        )?;
        let root_page = atom_to_raw(root_header.matom);
        let nodes = FixedPool::open(segment, &format!("{name}.nodes"), 6, NODE_RECORD_SIZE, max_atoms, flags | INIT_ZERO)?;
        Ok(Patricia {
            segment,
            root_page,
            nodes,
            key_fn: Box::new(key_fn),
        })
    }

    fn root_info(&self) -> &RootInfo {
        self.segment.page(self.root_page).transmute_page::<RootInfo>()
    }

    #[allow(clippy::mut_from_ref)]
    fn root_info_mut(&self) -> &mut RootInfo {
        self.segment.page_mut(self.root_page).transmute_page_mut::<RootInfo>()
    }

    fn root(&self) -> Matom {
        atom_from_raw(self.root_info().top)
    }

    fn set_root(&self, node: Matom) {
        self.root_info_mut().top = atom_to_raw(node);
    }

    fn node(&self, atom: Atom) -> &NodeRecord {
        self.nodes.addr(atom).expect("patricia node atom must resolve").transmute_page::<NodeRecord>()
    }

    #[allow(clippy::mut_from_ref)]
    fn node_mut(&self, atom: Atom) -> &mut NodeRecord {
        self.nodes
            .addr_mut(atom)
            .expect("patricia node atom must resolve")
            .transmute_page_mut::<NodeRecord>()
    }

    fn key_of(&self, data: Atom) -> &'seg [u8] {
        (self.key_fn)(data)
    }

    /// Walk from `root` toward `key`, tracking the edge that led to the
    /// final node reached (`None` if that node is the root itself). A
    /// node is terminal exactly when descending from it loops back to
    /// itself — every node created by [`Patricia::insert`] has exactly
    /// one such self-link side, the one naming its own data atom — so
    /// detecting `next == cur` is both necessary and sufficient to stop,
    /// with no separate bookkeeping of bit indices required.
    ///
    /// `stop_at_bit`, when given, additionally halts the walk at the
    /// first node whose own bit index has reached or passed it, before
    /// testing that node's bit at all — used by `insert` to find where a
    /// new critical-bit node splices in without descending past it.
    fn walk_tracking_parent(&self, root: u32, key: &[u8], stop_at_bit: Option<u32>) -> (u32, Option<(u32, bool)>) {
        let mut cur = root;
        let mut parent: Option<(u32, bool)> = None;
        loop {
            let n = self.node(atom_from_raw(cur));
            if let Some(bound) = stop_at_bit {
                if n.bit_index >= bound {
                    break;
                }
            }
            let go_right = test_bit(key, n.bit_index);
            let next = if go_right { n.right } else { n.left };
            if next == cur {
                break;
            }
            parent = Some((cur, go_right));
            cur = next;
        }
        (cur, parent)
    }

    /// Exact-match lookup: the data atom stored under `key`, or `None`.
    pub fn get(&self, key: &[u8]) -> Option<Atom> {
        let root = self.root()?;
        let raw_root = atom_to_raw(Some(root));
        let (leaf, _) = self.walk_tracking_parent(raw_root, key, None);
        let n = self.node(atom_from_raw(leaf));
        let data = atom_from_raw(n.data);
        if self.key_of(data) == key {
            Some(data)
        } else {
            None
        }
    }

    /// Insert `data`'s key (resolved via the key function) into the trie.
    /// Fails with `Dup` if an entry with the same key already exists.
    pub fn insert(&self, data: Atom) -> Result<()> {
        let key = self.key_of(data);
        let Some(root) = self.root() else {
            let new = self.nodes.alloc()?;
            let raw_new = atom_to_raw(new);
            let rec = self.node_mut(new);
            rec.bit_index = 0;
            rec.left = raw_new;
            rec.right = raw_new;
            rec.data = atom_to_raw(data);
            self.set_root(new);
            return Ok(());
        };

        let raw_root = atom_to_raw(Some(root));
        let (leaf, _) = self.walk_tracking_parent(raw_root, key, None);
        let leaf_data = atom_from_raw(self.node(atom_from_raw(leaf)).data);
        let leaf_key = self.key_of(leaf_data);
        if leaf_key == key {
            return Err(ParrotError::Dup);
        }
        // A `None` here means one key is a true byte-prefix of the other
        // (`first_differing_bit` treats bytes past the shorter key as
        // zero, same as `leaf_key == key` would if they were actually
        // equal-length) — that's the same "no key is a proper prefix of
        // another" violation as an exact duplicate, so it fails the same
        // way rather than panicking.
        let Some(crit_bit) = first_differing_bit(leaf_key, key) else {
            return Err(ParrotError::Dup);
        };

        // Re-walk, this time stopping just before descending past crit_bit,
        // to find where the new decision node splices in.
        let (cur, parent) = self.walk_tracking_parent(raw_root, key, Some(crit_bit));

        let new = self.nodes.alloc()?;
        let raw_new = atom_to_raw(new);
        let new_goes_right = test_bit(key, crit_bit);
        {
            let rec = self.node_mut(new);
            rec.bit_index = crit_bit;
            rec.data = atom_to_raw(data);
            if new_goes_right {
                rec.right = raw_new;
                rec.left = cur;
            } else {
                rec.left = raw_new;
                rec.right = cur;
            }
        }

        match parent {
            Some((p, went_right)) => {
                let prec = self.node_mut(atom_from_raw(p));
                if went_right {
                    prec.right = raw_new;
                } else {
                    prec.left = raw_new;
                }
            }
            None => self.set_root(new),
        }
        trace!("patricia insert spliced node at bit {crit_bit}");
        Ok(())
    }

    /// Remove the entry stored under `key`, if present. Returns the data
    /// atom that was removed.
    pub fn delete(&self, key: &[u8]) -> Result<Atom> {
        let Some(root) = self.root() else {
            return Err(ParrotError::NotFound);
        };
        let raw_root = atom_to_raw(Some(root));
        let (leaf, parent) = self.walk_tracking_parent(raw_root, key, None);

        let leaf_node = self.node(atom_from_raw(leaf));
        let data = atom_from_raw(leaf_node.data);
        if self.key_of(data) != key {
            return Err(ParrotError::NotFound);
        }

        // `leaf`'s self-link side is the one matching its own key; the
        // other side either holds a real surviving subtree, or (for a
        // node that has never had a sibling spliced under it) loops back
        // to `leaf` itself, meaning there is nothing to preserve.
        let self_goes_right = test_bit(key, leaf_node.bit_index);
        let other = if self_goes_right { leaf_node.left } else { leaf_node.right };
        let other_is_real = other != leaf;

        match (parent, other_is_real) {
            (None, false) => self.set_root(None),
            (None, true) => self.set_root(atom_from_raw(other)),
            (Some((p, went_right)), real) => {
                // When there's no real subtree to preserve, the parent's
                // edge collapses to point at itself instead of `leaf`.
                let replacement = if real { other } else { p };
                let prec = self.node_mut(atom_from_raw(p));
                if went_right {
                    prec.right = replacement;
                } else {
                    prec.left = replacement;
                }
            }
        }
        self.nodes.free(atom_from_raw(leaf));
        Ok(data)
    }

    /// True if the trie currently holds no entries.
    pub fn is_empty(&self) -> bool {
        self.root().is_none()
    }

    fn leaves_inorder(&self, node: u32, prev_bit: i64, out: &mut Vec<Atom>, visited_bound: u32) {
        let n = self.node(atom_from_raw(node));
        if prev_bit >= n.bit_index as i64 || visited_bound == 0 {
            out.push(atom_from_raw(n.data));
            return;
        }
        self.leaves_inorder(n.left, n.bit_index as i64, out, visited_bound - 1);
        self.leaves_inorder(n.right, n.bit_index as i64, out, visited_bound - 1);
    }

    /// All data atoms in ascending key order. Used for `find_next`/
    /// `find_prev`-style range scans; a bounded recursion depth guards
    /// against a corrupted trie looping forever instead of terminating.
    pub fn in_order(&self) -> Vec<Atom> {
        let mut out = Vec::new();
        if let Some(root) = self.root() {
            self.leaves_inorder(atom_to_raw(Some(root)), -1, &mut out, self.nodes.max_atoms());
        }
        out
    }

    /// The smallest key strictly greater than `key`, if any.
    fn find_next_key(&self, key: &[u8]) -> Option<Atom> {
        self.in_order().into_iter().find(|&a| self.key_of(a) > key)
    }

    /// The largest key strictly less than `key`, if any.
    fn find_prev_key(&self, key: &[u8]) -> Option<Atom> {
        self.in_order().into_iter().rev().find(|&a| self.key_of(a) < key)
    }

    /// The node after `node` in key order — `null` (`None`) means "before
    /// the minimum", so `find_next(null)` is the trie's minimum entry, and
    /// `find_next` of the maximum entry is `null`. Satisfies
    /// `find_prev(find_next(n)) == n` for any node or null.
    pub fn find_next(&self, node: Atom) -> Option<Atom> {
        match node {
            None => self.in_order().into_iter().next(),
            Some(_) => self.find_next_key(self.key_of(node)),
        }
    }

    /// The node before `node` in key order — `null` (`None`) means "after
    /// the maximum", so `find_prev(null)` is the trie's maximum entry, and
    /// `find_prev` of the minimum entry is `null`.
    pub fn find_prev(&self, node: Atom) -> Option<Atom> {
        match node {
            None => self.in_order().into_iter().next_back(),
            Some(_) => self.find_prev_key(self.key_of(node)),
        }
    }

    /// The lexicographically smallest key whose first `prefix_len` bits
    /// equal `prefix`'s, or `None` if no key matches. `prefix_len` is a
    /// bit count, not a byte count (`2 * 8` for a two-byte prefix).
    pub fn subtree_match(&self, prefix_len: u32, prefix: &[u8]) -> Option<Atom> {
        self.in_order().into_iter().find(|&a| shares_prefix(self.key_of(a), prefix, prefix_len))
    }

    /// `find_next` restricted to keys that share `node`'s own first
    /// `prefix_len` bits with it; `None` once the subtree is exhausted.
    pub fn subtree_next(&self, node: Atom, prefix_len: u32) -> Option<Atom> {
        let key = self.key_of(node);
        self.in_order().into_iter().find(|&a| self.key_of(a) > key && shares_prefix(self.key_of(a), key, prefix_len))
    }
}

/// Whether `key` and `prefix` agree on their first `prefix_len_bits` bits.
/// Bytes past either slice's end are treated as zero, consistent with
/// [`test_bit`]'s out-of-range behavior.
fn shares_prefix(key: &[u8], prefix: &[u8], prefix_len_bits: u32) -> bool {
    let full_bytes = (prefix_len_bits / 8) as usize;
    let rem_bits = prefix_len_bits % 8;
    for i in 0..full_bytes {
        let kb = key.get(i).copied().unwrap_or(0);
        let pb = prefix.get(i).copied().unwrap_or(0);
        if kb != pb {
            return false;
        }
    }
    if rem_bits == 0 {
        return true;
    }
    let mask = !(0xFFu8 >> rem_bits);
    let kb = key.get(full_bytes).copied().unwrap_or(0);
    let pb = prefix.get(full_bytes).copied().unwrap_or(0);
    (kb & mask) == (pb & mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use tempfile::NamedTempFile;

    use crate::pool::ArbitraryPool;

    /// A minimal key store: an arbitrary pool holding null-terminated
    /// strings, with a side table so the test's key function can resolve
    /// atoms without a full string table.
    struct Strings<'seg> {
        pool: ArbitraryPool<'seg>,
        cache: RefCell<HashMap<u32, &'seg [u8]>>,
    }

    impl<'seg> Strings<'seg> {
        fn new(pool: ArbitraryPool<'seg>) -> Self {
            Strings { pool, cache: RefCell::new(HashMap::new()) }
        }

        fn put(&self, s: &str) -> Atom {
            let bytes = s.as_bytes();
            let atom = self.pool.alloc(bytes.len() + 1).unwrap();
            let buf = self.pool.addr_mut(atom).unwrap();
            buf[..bytes.len()].copy_from_slice(bytes);
            buf[bytes.len()] = 0;
            let stored = self.pool.addr(atom).unwrap();
            let trimmed = &stored[..=bytes.len()];
            self.cache.borrow_mut().insert(atom_to_raw(atom), trimmed);
            atom
        }

        /// Store `bytes` verbatim, with no terminator appended — unlike
        /// [`Strings::put`], which always adds one. Used to set up exact
        /// byte-prefix pairs (a tag name's own NUL vs. untagged content).
        fn put_exact(&self, bytes: &[u8]) -> Atom {
            let atom = self.pool.alloc(bytes.len()).unwrap();
            let buf = self.pool.addr_mut(atom).unwrap();
            buf[..bytes.len()].copy_from_slice(bytes);
            let stored = self.pool.addr(atom).unwrap();
            let trimmed = &stored[..bytes.len()];
            self.cache.borrow_mut().insert(atom_to_raw(atom), trimmed);
            atom
        }

        fn key_fn(&'seg self) -> impl Fn(Atom) -> &'seg [u8] + 'seg {
            move |atom: Atom| *self.cache.borrow().get(&atom_to_raw(atom)).expect("unknown atom")
        }
    }

    #[test]
    fn insert_then_get_round_trips() {
        let f = NamedTempFile::new().unwrap();
        let seg = Segment::open(f.path()).unwrap();
        let pool = ArbitraryPool::open(&seg, "strs", 64, 0).unwrap();
        let strings = Box::leak(Box::new(Strings::new(pool)));
        let trie = Patricia::open(&seg, "trie", 64, 0, strings.key_fn()).unwrap();

        let apple = strings.put("apple\0");
        let ant = strings.put("ant\0");
        let banana = strings.put("banana\0");
        trie.insert(apple).unwrap();
        trie.insert(ant).unwrap();
        trie.insert(banana).unwrap();

        assert_eq!(trie.get(b"apple\0"), Some(apple));
        assert_eq!(trie.get(b"ant\0"), Some(ant));
        assert_eq!(trie.get(b"banana\0"), Some(banana));
        assert_eq!(trie.get(b"missing\0"), None);
    }

    #[test]
    fn duplicate_key_rejected() {
        let f = NamedTempFile::new().unwrap();
        let seg = Segment::open(f.path()).unwrap();
        let pool = ArbitraryPool::open(&seg, "strs", 64, 0).unwrap();
        let strings = Box::leak(Box::new(Strings::new(pool)));
        let trie = Patricia::open(&seg, "trie", 64, 0, strings.key_fn()).unwrap();

        let a1 = strings.put("x\0");
        trie.insert(a1).unwrap();
        let a2 = strings.put("x\0");
        let err = trie.insert(a2).unwrap_err();
        assert!(matches!(err, ParrotError::Dup));
    }

    #[test]
    fn prefix_overlapping_key_rejected_not_panicked() {
        let f = NamedTempFile::new().unwrap();
        let seg = Segment::open(f.path()).unwrap();
        let pool = ArbitraryPool::open(&seg, "strs", 64, 0).unwrap();
        let strings = Box::leak(Box::new(Strings::new(pool)));
        let trie = Patricia::open(&seg, "trie", 64, 0, strings.key_fn()).unwrap();

        // "doc\0" and "doc" (no terminator) are a true byte-prefix pair,
        // the same shape a tag name and untagged text content produce
        // when interned into one shared table.
        let tagged = strings.put_exact(b"doc\0");
        trie.insert(tagged).unwrap();
        let bare = strings.put_exact(b"doc");
        let err = trie.insert(bare).unwrap_err();
        assert!(matches!(err, ParrotError::Dup));
    }

    #[test]
    fn in_order_is_sorted() {
        let f = NamedTempFile::new().unwrap();
        let seg = Segment::open(f.path()).unwrap();
        let pool = ArbitraryPool::open(&seg, "strs", 64, 0).unwrap();
        let strings = Box::leak(Box::new(Strings::new(pool)));
        let trie = Patricia::open(&seg, "trie", 64, 0, strings.key_fn()).unwrap();

        for s in ["banana\0", "apple\0", "ant\0", "cherry\0"] {
            let atom = strings.put(s);
            trie.insert(atom).unwrap();
        }
        let ordered: Vec<&[u8]> = trie.in_order().into_iter().map(|a| strings.key_fn()(a)).collect();
        let mut sorted = ordered.clone();
        sorted.sort();
        assert_eq!(ordered, sorted);
    }

    #[test]
    fn delete_removes_and_preserves_siblings() {
        let f = NamedTempFile::new().unwrap();
        let seg = Segment::open(f.path()).unwrap();
        let pool = ArbitraryPool::open(&seg, "strs", 64, 0).unwrap();
        let strings = Box::leak(Box::new(Strings::new(pool)));
        let trie = Patricia::open(&seg, "trie", 64, 0, strings.key_fn()).unwrap();

        let apple = strings.put("apple\0");
        let ant = strings.put("ant\0");
        let banana = strings.put("banana\0");
        trie.insert(apple).unwrap();
        trie.insert(ant).unwrap();
        trie.insert(banana).unwrap();

        let removed = trie.delete(b"ant\0").unwrap();
        assert_eq!(removed, ant);
        assert_eq!(trie.get(b"ant\0"), None);
        assert_eq!(trie.get(b"apple\0"), Some(apple));
        assert_eq!(trie.get(b"banana\0"), Some(banana));
    }

    #[test]
    fn find_next_and_prev_bracket_a_node() {
        let f = NamedTempFile::new().unwrap();
        let seg = Segment::open(f.path()).unwrap();
        let pool = ArbitraryPool::open(&seg, "strs", 64, 0).unwrap();
        let strings = Box::leak(Box::new(Strings::new(pool)));
        let trie = Patricia::open(&seg, "trie", 64, 0, strings.key_fn()).unwrap();

        let mut atoms = HashMap::new();
        for s in ["ant\0", "apple\0", "banana\0"] {
            let atom = strings.put(s);
            trie.insert(atom).unwrap();
            atoms.insert(s, atom);
        }
        let apple = atoms[&"apple\0"];

        let next = trie.find_next(apple).unwrap();
        assert_eq!(strings.key_fn()(next), b"banana\0");
        let prev = trie.find_prev(apple).unwrap();
        assert_eq!(strings.key_fn()(prev), b"ant\0");
    }

    /// `find_prev(find_next(n)) == n` for any node or null, and `null`
    /// brackets the ends: `find_next(null)` is the minimum, `find_prev(null)`
    /// is the maximum, and walking off either end lands back on `null`.
    #[test]
    fn find_next_and_prev_compose_to_identity_including_null() {
        let f = NamedTempFile::new().unwrap();
        let seg = Segment::open(f.path()).unwrap();
        let pool = ArbitraryPool::open(&seg, "strs", 64, 0).unwrap();
        let strings = Box::leak(Box::new(Strings::new(pool)));
        let trie = Patricia::open(&seg, "trie", 64, 0, strings.key_fn()).unwrap();

        let mut atoms = HashMap::new();
        for s in ["ant\0", "apple\0", "banana\0"] {
            let atom = strings.put(s);
            trie.insert(atom).unwrap();
            atoms.insert(s, atom);
        }
        let ant = atoms[&"ant\0"];
        let apple = atoms[&"apple\0"];
        let banana = atoms[&"banana\0"];

        assert_eq!(trie.find_next(None), Some(ant));
        assert_eq!(trie.find_prev(None), Some(banana));
        assert_eq!(trie.find_next(banana), None);
        assert_eq!(trie.find_prev(ant), None);

        for node in [ant, apple, banana] {
            assert_eq!(trie.find_prev(trie.find_next(node).unwrap_or(None)).unwrap_or(None), node);
        }
        assert_eq!(trie.find_prev(trie.find_next(None).unwrap()), None);
    }

    #[test]
    fn subtree_match_finds_shared_prefix_and_next_exhausts_it() {
        let f = NamedTempFile::new().unwrap();
        let seg = Segment::open(f.path()).unwrap();
        let pool = ArbitraryPool::open(&seg, "strs", 64, 0).unwrap();
        let strings = Box::leak(Box::new(Strings::new(pool)));
        let trie = Patricia::open(&seg, "trie", 64, 0, strings.key_fn()).unwrap();

        let apple = strings.put("apple\0");
        let ant = strings.put("ant\0");
        let banana = strings.put("banana\0");
        trie.insert(apple).unwrap();
        trie.insert(ant).unwrap();
        trie.insert(banana).unwrap();

        let first = trie.subtree_match(2 * 8, b"an").unwrap();
        assert_eq!(first, ant);
        assert_eq!(trie.subtree_next(first, 2 * 8), None);
    }

    #[test]
    fn delete_on_empty_trie_fails_not_found() {
        let f = NamedTempFile::new().unwrap();
        let seg = Segment::open(f.path()).unwrap();
        let pool = ArbitraryPool::open(&seg, "strs", 64, 0).unwrap();
        let strings = Box::leak(Box::new(Strings::new(pool)));
        let trie = Patricia::open(&seg, "trie", 64, 0, strings.key_fn()).unwrap();
        let err = trie.delete(b"nope\0").unwrap_err();
        assert!(matches!(err, ParrotError::NotFound));
    }
}
