//! Segment (mmap) allocator.
//!
//! A segment maps a single backing file into memory as a sequence of
//! fixed-size pages. Page 0 holds a small super-header; a chain of
//! directory pages map header names to `(type, page offset, byte length)`
//! entries. Every other pool in this crate borrows a `Segment` by shared
//! reference and asks it for a named header at open time.
//!
//! Mutation goes through an inner `UnsafeCell`, not `&mut self`: per the
//! concurrency model, a segment and everything built on it is used by one
//! caller at a time with no internal locking, so every pool (fixed,
//! arbitrary, string table, trie, bitmap, tree) can hold a plain shared
//! `&Segment` rather than fight the borrow checker over a single `&mut`.
//! This mirrors the ref-counted `Pool` this crate is descended from, whose
//! `alloc`/`release`/indexing all take `&self` and mutate through a raw
//! pointer into the backing buffer.

pub mod page;

use std::cell::UnsafeCell;
use std::fs::{File, OpenOptions};
use std::mem;
use std::path::Path;

use log::{debug, trace, warn};
use memmap2::MmapMut;

use crate::atom::{matom_from_raw, matom_to_raw, Matom};
use crate::error::{ParrotError, Result};

pub use page::{FlexibleMemory, Page, PAGE_SIZE};

const MAGIC: u32 = 0x5052_4154; // "PRAT", a nod to ParrotDB
const VERSION: u8 = 1;
#[cfg(target_endian = "little")]
const BYTE_ORDER_MARKER: u8 = 1;
#[cfg(target_endian = "big")]
const BYTE_ORDER_MARKER: u8 = 2;

/// Maximum length of a header name, not counting the NUL terminator.
/// The source this crate is modeled on bounds names at 32 bytes.
pub const MAX_NAME_LEN: usize = 32;

/// The kind of structure stored under a header, recorded so a later
/// `header()` call on the same name can be checked for a shape mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HeaderType {
    Segment = 0,
    FixedPool = 1,
    ArbitraryPool = 2,
    StringTable = 3,
    Patricia = 4,
    Tree = 5,
    Bitmap = 6,
    Opaque = 7,
}

#[repr(C)]
struct SuperHeader {
    magic: u32,
    version: u8,
    byte_order_marker: u8,
    _pad: [u8; 2],
    directory_head: u32, // page index of the first directory page, 0 = none yet
    page_count: u32,     // total pages currently backing the file
}

#[repr(C)]
#[derive(Clone, Copy)]
struct DirEntryRaw {
    name: [u8; MAX_NAME_LEN + 1],
    header_type: u8,
    flags: u8,
    _pad: [u8; 2],
    page_offset: u32,
    byte_length: u64,
}

const DIR_PAGE_HEADER_SIZE: usize = 8; // count: u32, next: u32
const DIR_ENTRY_SIZE: usize = mem::size_of::<DirEntryRaw>();
const DIR_ENTRIES_PER_PAGE: usize = (PAGE_SIZE - DIR_PAGE_HEADER_SIZE) / DIR_ENTRY_SIZE;

#[repr(C)]
struct DirPageHeader {
    count: u32,
    next: u32,
}

/// A live, named header: enough information for a pool to reconstruct its
/// view of its own storage after a reopen.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub matom: Matom,
    pub header_type: HeaderType,
    pub flags: u8,
    pub byte_length: u64,
}

pub struct Segment {
    file: File,
    mmap: UnsafeCell<MmapMut>,
}

impl Segment {
    /// Open (creating if necessary) the file at `path` as a segment.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Segment> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())?;
        let existing_len = file.metadata()?.len();
        if existing_len < PAGE_SIZE as u64 {
            file.set_len(PAGE_SIZE as u64)?;
        }
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let seg = Segment {
            file,
            mmap: UnsafeCell::new(mmap),
        };

        if existing_len >= PAGE_SIZE as u64 {
            if seg.super_header().magic != MAGIC {
                return Err(ParrotError::Shape {
                    name: "<segment>".into(),
                });
            }
            debug!(
                "reopened segment with {} pages",
                seg.super_header().page_count
            );
        } else {
            let sh = seg.super_header_mut();
            sh.magic = MAGIC;
            sh.version = VERSION;
            sh.byte_order_marker = BYTE_ORDER_MARKER;
            sh.directory_head = 0;
            sh.page_count = 1;
            debug!("initialized new segment");
        }
        Ok(seg)
    }

    fn mmap(&self) -> &MmapMut {
        unsafe { &*self.mmap.get() }
    }

    #[allow(clippy::mut_from_ref)]
    fn mmap_mut(&self) -> &mut MmapMut {
        unsafe { &mut *self.mmap.get() }
    }

    fn super_header(&self) -> &SuperHeader {
        self.page(0).transmute_page::<SuperHeader>()
    }

    #[allow(clippy::mut_from_ref)]
    fn super_header_mut(&self) -> &mut SuperHeader {
        self.page_mut(0).transmute_page_mut::<SuperHeader>()
    }

    #[inline]
    fn page_count(&self) -> u32 {
        self.super_header().page_count
    }

    /// Borrow a page for reading. Atoms are page indices, 0 being the
    /// super-header page, which is never handed out as a matom to a pool.
    pub fn page(&self, index: u32) -> &Page {
        let start = index as usize * PAGE_SIZE;
        &self.mmap()[start..start + PAGE_SIZE]
    }

    /// Borrow a page for writing. Takes `&self`: see the module docs for
    /// why this crate's pools share a segment this way.
    #[allow(clippy::mut_from_ref)]
    pub fn page_mut(&self, index: u32) -> &mut Page {
        let start = index as usize * PAGE_SIZE;
        &mut self.mmap_mut()[start..start + PAGE_SIZE]
    }

    /// Bump-allocate `n` contiguous pages, growing the backing file and
    /// remapping it. Returns the matom of the first page allocated.
    pub fn alloc_pages(&self, n: u32) -> Result<Matom> {
        assert!(n > 0, "alloc_pages called with n == 0");
        let first = self.page_count();
        let new_count = first
            .checked_add(n)
            .expect("segment grew past u32 page count");
        self.file.set_len(new_count as u64 * PAGE_SIZE as u64)?;
        // MmapMut doesn't grow in place; remap over the extended file.
        let remapped = unsafe { MmapMut::map_mut(&self.file)? };
        unsafe {
            *self.mmap.get() = remapped;
        }
        self.super_header_mut().page_count = new_count;
        trace!("allocated {} pages starting at {}", n, first);
        Ok(matom_from_raw(first))
    }

    /// Flush dirty pages to disk. `Segment::drop` calls this too, but
    /// callers that want a durability point before continuing can call it
    /// directly.
    pub fn flush(&self) -> Result<()> {
        self.mmap().flush()?;
        Ok(())
    }

    /// Look up or create a named header. Fails with `ESHAPE` if an entry
    /// with this name exists with a different type or declared size.
    pub fn header(
        &self,
        name: &str,
        header_type: HeaderType,
        flags: u8,
        byte_length: u64,
    ) -> Result<Header> {
        assert!(
            name.len() <= MAX_NAME_LEN,
            "header name {:?} exceeds {} bytes",
            name,
            MAX_NAME_LEN
        );
        if let Some(existing) = self.find_entry(name) {
            if existing.header_type != header_type as u8 || existing.byte_length != byte_length {
                warn!("header {:?} requested with a different shape", name);
                return Err(ParrotError::Shape { name: name.into() });
            }
            return Ok(Header {
                matom: matom_from_raw(existing.page_offset),
                header_type,
                flags: existing.flags,
                byte_length,
            });
        }

        let pages_needed = ((byte_length as usize + PAGE_SIZE - 1) / PAGE_SIZE).max(1) as u32;
        let matom = self.alloc_pages(pages_needed)?;
        self.insert_entry(name, header_type, flags, matom_to_raw(matom), byte_length)?;
        debug!("created header {:?} ({:?})", name, header_type);
        Ok(Header {
            matom,
            header_type,
            flags,
            byte_length,
        })
    }

    fn find_entry(&self, name: &str) -> Option<DirEntryRaw> {
        let mut page_idx = self.super_header().directory_head;
        while page_idx != 0 {
            let page = self.page(page_idx);
            let hdr = page.transmute_segment::<DirPageHeader>(0);
            let count = hdr.count as usize;
            let next = hdr.next;
            for i in 0..count {
                let offset = DIR_PAGE_HEADER_SIZE + i * DIR_ENTRY_SIZE;
                let entry = page.transmute_segment::<DirEntryRaw>(offset);
                if name_matches(&entry.name, name) {
                    return Some(*entry);
                }
            }
            page_idx = next;
        }
        None
    }

    fn insert_entry(
        &self,
        name: &str,
        header_type: HeaderType,
        flags: u8,
        page_offset: u32,
        byte_length: u64,
    ) -> Result<()> {
        let mut page_idx = self.super_header().directory_head;
        if page_idx == 0 {
            let new_dir = matom_to_raw(self.alloc_pages(1)?);
            let page = self.page_mut(new_dir);
            let hdr = page.transmute_segment_mut::<DirPageHeader>(0);
            hdr.count = 0;
            hdr.next = 0;
            self.super_header_mut().directory_head = new_dir;
            page_idx = new_dir;
        }

        loop {
            let (count, next) = {
                let page = self.page(page_idx);
                let hdr = page.transmute_segment::<DirPageHeader>(0);
                (hdr.count, hdr.next)
            };
            if (count as usize) < DIR_ENTRIES_PER_PAGE {
                let page = self.page_mut(page_idx);
                let offset = DIR_PAGE_HEADER_SIZE + count as usize * DIR_ENTRY_SIZE;
                let entry = page.transmute_segment_mut::<DirEntryRaw>(offset);
                write_name(&mut entry.name, name);
                entry.header_type = header_type as u8;
                entry.flags = flags;
                entry._pad = [0; 2];
                entry.page_offset = page_offset;
                entry.byte_length = byte_length;
                let hdr = page.transmute_segment_mut::<DirPageHeader>(0);
                hdr.count += 1;
                return Ok(());
            }
            if next == 0 {
                let new_dir = matom_to_raw(self.alloc_pages(1)?);
                {
                    let page = self.page_mut(new_dir);
                    let hdr = page.transmute_segment_mut::<DirPageHeader>(0);
                    hdr.count = 0;
                    hdr.next = 0;
                }
                let page = self.page_mut(page_idx);
                let hdr = page.transmute_segment_mut::<DirPageHeader>(0);
                hdr.next = new_dir;
                page_idx = new_dir;
            } else {
                page_idx = next;
            }
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if let Err(e) = self.mmap().flush() {
            warn!("failed to flush segment on drop: {}", e);
        }
    }
}

fn name_matches(raw: &[u8], name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.len() > raw.len() - 1 {
        return false;
    }
    &raw[..bytes.len()] == bytes && raw[bytes.len()] == 0
}

fn write_name(raw: &mut [u8; MAX_NAME_LEN + 1], name: &str) {
    let bytes = name.as_bytes();
    raw.fill(0);
    raw[..bytes.len()].copy_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn fresh_segment_has_magic() {
        let f = NamedTempFile::new().unwrap();
        let seg = Segment::open(f.path()).unwrap();
        assert_eq!(seg.super_header().magic, MAGIC);
        assert_eq!(seg.page_count(), 1);
    }

    #[test]
    fn header_round_trips_name() {
        let f = NamedTempFile::new().unwrap();
        let seg = Segment::open(f.path()).unwrap();
        let h1 = seg.header("root.info", HeaderType::FixedPool, 0, 64).unwrap();
        let h2 = seg.header("root.info", HeaderType::FixedPool, 0, 64).unwrap();
        assert_eq!(matom_to_raw(h1.matom), matom_to_raw(h2.matom));
    }

    #[test]
    fn header_rejects_shape_mismatch() {
        let f = NamedTempFile::new().unwrap();
        let seg = Segment::open(f.path()).unwrap();
        seg.header("root.info", HeaderType::FixedPool, 0, 64).unwrap();
        let err = seg
            .header("root.info", HeaderType::FixedPool, 0, 128)
            .unwrap_err();
        assert!(matches!(err, ParrotError::Shape { .. }));
    }

    #[test]
    fn header_rejects_type_mismatch() {
        let f = NamedTempFile::new().unwrap();
        let seg = Segment::open(f.path()).unwrap();
        seg.header("x", HeaderType::FixedPool, 0, 64).unwrap();
        let err = seg.header("x", HeaderType::ArbitraryPool, 0, 64).unwrap_err();
        assert!(matches!(err, ParrotError::Shape { .. }));
    }

    #[test]
    fn duplicate_names_across_types_rejected_not_silently_aliased() {
        let f = NamedTempFile::new().unwrap();
        let seg = Segment::open(f.path()).unwrap();
        seg.header("a", HeaderType::StringTable, 0, 4096).unwrap();
        assert!(seg.header("a", HeaderType::Patricia, 0, 4096).is_err());
    }

    #[test]
    fn directory_spans_multiple_pages() {
        let f = NamedTempFile::new().unwrap();
        let seg = Segment::open(f.path()).unwrap();
        for i in 0..(DIR_ENTRIES_PER_PAGE * 2 + 3) {
            let name = format!("h{i}");
            seg.header(&name, HeaderType::Opaque, 0, 8).unwrap();
        }
        for i in 0..(DIR_ENTRIES_PER_PAGE * 2 + 3) {
            let name = format!("h{i}");
            assert!(seg.find_entry(&name).is_some());
        }
    }

    #[test]
    fn reopen_preserves_headers() {
        let f = NamedTempFile::new().unwrap();
        let path = f.path().to_owned();
        {
            let seg = Segment::open(&path).unwrap();
            seg.header("root.info", HeaderType::FixedPool, 0, 64).unwrap();
            seg.flush().unwrap();
        }
        {
            let seg = Segment::open(&path).unwrap();
            let h = seg.header("root.info", HeaderType::FixedPool, 0, 64).unwrap();
            assert!(h.matom.is_some());
        }
    }
}
