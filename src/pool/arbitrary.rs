//! Variable-size allocator with power-of-two size classes.
//!
//! Every allocation lives on a page dedicated to one size class; the page
//! table (not a per-record header) records which class each page holds,
//! so `free` is a page-table lookup plus a free-list push — O(1), per the
//! design notes, without needing to smuggle a class tag into the record
//! bytes the way the byte-string format this crate's predecessor used
//! (`ByteStringEntry::entry_type`) did for its own, richer, purposes.

use log::trace;

use crate::atom::{atom_from_raw, atom_to_raw, Atom};
use crate::error::{ParrotError, Result};
use crate::segment::{FlexibleMemory, HeaderType, Segment, PAGE_SIZE};

use super::INIT_ZERO;

const CLASS_SIZES: [u32; 8] = [16, 32, 64, 128, 256, 512, 1024, 2048];
const NUM_CLASSES: usize = CLASS_SIZES.len();
const MIN_CLASS_SIZE: u32 = CLASS_SIZES[0];
/// Atom raw values are `page_num * SLOTS_PER_PAGE_STRIDE + slot + 1`; the
/// stride is fixed at the number of slots the smallest class packs into a
/// page so every page, regardless of its class, gets a disjoint range.
const SLOTS_PER_PAGE_STRIDE: u32 = PAGE_SIZE as u32 / MIN_CLASS_SIZE;

fn class_for_size(len: usize) -> usize {
    CLASS_SIZES
        .iter()
        .position(|&c| c as usize >= len)
        .unwrap_or_else(|| panic!("arbitrary pool allocation of {len} bytes exceeds the largest size class ({} bytes)", CLASS_SIZES[NUM_CLASSES - 1]))
}

#[repr(C)]
struct ArbitraryPoolInfo {
    num_pages: u32,
    free_heads: [u32; NUM_CLASSES],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct PageEntry {
    matom: u32,
    class: u8,
    _pad: [u8; 3],
}

const PAGE_ENTRY_SIZE: usize = std::mem::size_of::<PageEntry>();

/// A size-classed allocator over a segment.
pub struct ArbitraryPool<'seg> {
    segment: &'seg Segment,
    info_page: u32,
    page_table_start: u32,
    max_pages: u32,
    flags: u8,
}

impl<'seg> ArbitraryPool<'seg> {
    pub fn open(segment: &'seg Segment, name: &str, max_pages: u32, flags: u8) -> Result<ArbitraryPool<'seg>> {
        let info_header = segment.header(
            &format!("{name}.info"),
            HeaderType::ArbitraryPool,
            flags,
            std::mem::size_of::<ArbitraryPoolInfo>() as u64,
        )?;
        let info_page = atom_to_raw(info_header.matom);

        let pages_header = segment.header(
            &format!("{name}.pages"),
            HeaderType::Opaque,
            flags,
            max_pages as u64 * PAGE_ENTRY_SIZE as u64,
        )?;
        let page_table_start = atom_to_raw(pages_header.matom);

        let pool = ArbitraryPool {
            segment,
            info_page,
            page_table_start,
            max_pages,
            flags,
        };

        // A freshly allocated info page starts zeroed; `num_pages == 0`
        // with every free head also zero is indistinguishable from an
        // untouched pool, which is exactly the state we want to leave it
        // in, so there is nothing further to initialize here.
        Ok(pool)
    }

    fn info(&self) -> &ArbitraryPoolInfo {
        self.segment.page(self.info_page).transmute_page::<ArbitraryPoolInfo>()
    }

    #[allow(clippy::mut_from_ref)]
    fn info_mut(&self) -> &mut ArbitraryPoolInfo {
        self.segment
            .page_mut(self.info_page)
            .transmute_page_mut::<ArbitraryPoolInfo>()
    }

    fn page_table_slot(&self, page_num: u32) -> (u32, usize) {
        let byte_offset = page_num as usize * PAGE_ENTRY_SIZE;
        let abs_page = self.page_table_start + (byte_offset / PAGE_SIZE) as u32;
        (abs_page, byte_offset % PAGE_SIZE)
    }

    fn page_entry(&self, page_num: u32) -> PageEntry {
        let (abs_page, within) = self.page_table_slot(page_num);
        *self.segment.page(abs_page).transmute_segment::<PageEntry>(within)
    }

    fn set_page_entry(&self, page_num: u32, entry: PageEntry) {
        let (abs_page, within) = self.page_table_slot(page_num);
        *self
            .segment
            .page_mut(abs_page)
            .transmute_segment_mut::<PageEntry>(within) = entry;
    }

    fn locate(&self, raw: u32) -> Option<(u32, usize, u32)> {
        if raw == 0 {
            return None;
        }
        let idx0 = raw - 1;
        let page_num = idx0 / SLOTS_PER_PAGE_STRIDE;
        if page_num >= self.info().num_pages {
            return None;
        }
        let slot = idx0 % SLOTS_PER_PAGE_STRIDE;
        let entry = self.page_entry(page_num);
        let class_size = CLASS_SIZES[entry.class as usize];
        Some((entry.matom, slot as usize * class_size as usize, class_size))
    }

    fn link_at(&self, page_matom: u32, offset: usize) -> u32 {
        *self.segment.page(page_matom).transmute_segment::<u32>(offset)
    }

    fn set_link_at(&self, page_matom: u32, offset: usize, next: u32) {
        *self
            .segment
            .page_mut(page_matom)
            .transmute_segment_mut::<u32>(offset) = next;
    }

    fn grow(&self, class: usize) -> Result<()> {
        let page_num = self.info().num_pages;
        if page_num >= self.max_pages {
            return Err(ParrotError::Full { max_atoms: self.max_pages * SLOTS_PER_PAGE_STRIDE });
        }
        let data_matom = atom_to_raw(self.segment.alloc_pages(1)?);
        if self.flags & INIT_ZERO != 0 {
            self.segment.page_mut(data_matom).fill(0);
        }
        self.set_page_entry(
            page_num,
            PageEntry {
                matom: data_matom,
                class: class as u8,
                _pad: [0; 3],
            },
        );

        let class_size = CLASS_SIZES[class];
        let records_per_page = PAGE_SIZE as u32 / class_size;
        let first_raw = page_num * SLOTS_PER_PAGE_STRIDE + 1;
        for i in 0..records_per_page {
            let raw = first_raw + i;
            let next = if i + 1 < records_per_page { raw + 1 } else { 0 };
            self.set_link_at(data_matom, i as usize * class_size as usize, next);
        }

        let info = self.info_mut();
        info.num_pages += 1;
        info.free_heads[class] = first_raw;
        trace!("arbitrary pool grew class {class} by one page ({records_per_page} slots)");
        Ok(())
    }

    /// Allocate at least `len` bytes, returning an atom addressing a
    /// buffer of the chosen class's size (`>= len`). Panics if `len`
    /// exceeds the largest size class — a fixed shape constraint of this
    /// allocator, not an ordinary runtime failure.
    pub fn alloc(&self, len: usize) -> Result<Atom> {
        let class = class_for_size(len);
        if self.info().free_heads[class] == 0 {
            self.grow(class)?;
        }
        let head = self.info().free_heads[class];
        let (page_matom, offset, _) = self.locate(head).expect("free list head must resolve");
        let next = self.link_at(page_matom, offset);
        self.info_mut().free_heads[class] = next;
        Ok(atom_from_raw(head))
    }

    /// Release `atom` back to its size class's free list.
    pub fn free(&self, atom: Atom) {
        let raw = atom_to_raw(atom);
        assert_ne!(raw, 0, "free called on the null atom");
        let idx0 = raw - 1;
        let page_num = idx0 / SLOTS_PER_PAGE_STRIDE;
        let entry = self.page_entry(page_num);
        let class = entry.class as usize;
        let (page_matom, offset, _) = self.locate(raw).expect("free called on an atom never issued by this pool");
        let old_head = self.info().free_heads[class];
        self.set_link_at(page_matom, offset, old_head);
        self.info_mut().free_heads[class] = raw;
    }

    /// Borrow the full size-class buffer backing `atom` (at least as
    /// large as the `len` originally passed to `alloc`, possibly larger).
    ///
    /// Borrowed for `'seg` rather than `&self`, matching [`FixedPool::addr`]:
    /// the bytes live in the segment's mmap, so a key function closure can
    /// return them independent of this pool handle's lifetime.
    pub fn addr(&self, atom: Atom) -> Option<&'seg [u8]> {
        let raw = atom_to_raw(atom);
        let (page, offset, class_size) = self.locate(raw)?;
        Some(&self.segment.page(page)[offset..offset + class_size as usize])
    }

    #[allow(clippy::mut_from_ref)]
    pub fn addr_mut(&self, atom: Atom) -> Option<&'seg mut [u8]> {
        let raw = atom_to_raw(atom);
        let (page, offset, class_size) = self.locate(raw)?;
        Some(&mut self.segment.page_mut(page)[offset..offset + class_size as usize])
    }
}
