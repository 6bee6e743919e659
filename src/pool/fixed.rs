//! Fixed-size record pool: a paged array of same-size records, atom
//! addressed, with an intrusive free-list threaded through the records
//! themselves.
//!
//! This is the atom-addressed descendant of this crate's page-indexed
//! ref-counted `Pool`: where that pool kept its free list as an in-memory
//! `LinkedList<PageIndex>` (lost on process exit), this one embeds the
//! link in the first four bytes of each free record, so the free list
//! survives a segment close/reopen exactly like everything else here.

use log::{trace, warn};

use crate::atom::{atom_from_raw, atom_to_raw, Atom};
use crate::error::{ParrotError, Result};
use crate::segment::{FlexibleMemory, HeaderType, Segment, PAGE_SIZE};

use super::INIT_ZERO;

#[repr(C)]
struct FixedPoolInfo {
    record_size: u32,
    page_shift: u32,
    max_atoms: u32,
    free_head: u32, // raw atom value, 0 = empty
    pages_allocated: u32,
}

/// A paged allocator for fixed-size records, returning 32-bit atoms.
pub struct FixedPool<'seg> {
    segment: &'seg Segment,
    info_page: u32,
    page_table_start: u32,
    record_size: u32,
    page_shift: u32,
    max_atoms: u32,
    flags: u8,
}

impl<'seg> FixedPool<'seg> {
    /// Open (creating if necessary) a fixed pool named `name` within
    /// `segment`. Reopening with a different `record_size`/`page_shift`/
    /// `max_atoms` than the pool was created with fails with `ESHAPE`.
    pub fn open(
        segment: &'seg Segment,
        name: &str,
        page_shift: u32,
        record_size: u32,
        max_atoms: u32,
        flags: u8,
    ) -> Result<FixedPool<'seg>> {
        assert!(record_size >= 4, "fixed pool records must hold a free-list link (>= 4 bytes)");
        assert!(page_shift < 32, "page_shift out of range");

        let records_per_page = 1u32 << page_shift;
        let max_pages = max_atoms.div_ceil(records_per_page).max(1);

        let info_header = segment.header(
            &format!("{name}.info"),
            HeaderType::FixedPool,
            flags,
            std::mem::size_of::<FixedPoolInfo>() as u64,
        )?;
        let info_page = atom_to_raw(info_header.matom);

        let pages_header = segment.header(
            &format!("{name}.pages"),
            HeaderType::Opaque,
            flags,
            max_pages as u64 * 4,
        )?;
        let page_table_start = atom_to_raw(pages_header.matom);

        let pool = FixedPool {
            segment,
            info_page,
            page_table_start,
            record_size,
            page_shift,
            max_atoms,
            flags,
        };

        let info = pool.info();
        if info.record_size == 0 && info.page_shift == 0 && info.max_atoms == 0 {
            let info = pool.info_mut();
            info.record_size = record_size;
            info.page_shift = page_shift;
            info.max_atoms = max_atoms;
            info.free_head = 0;
            info.pages_allocated = 0;
            trace!("initialized fixed pool {name:?}: record_size={record_size} page_shift={page_shift} max_atoms={max_atoms}");
        } else if info.record_size != record_size || info.page_shift != page_shift || info.max_atoms != max_atoms {
            warn!("fixed pool {name:?} reopened with a different shape");
            return Err(ParrotError::Shape { name: name.into() });
        }

        Ok(pool)
    }

    fn info(&self) -> &FixedPoolInfo {
        self.segment.page(self.info_page).transmute_page::<FixedPoolInfo>()
    }

    #[allow(clippy::mut_from_ref)]
    fn info_mut(&self) -> &mut FixedPoolInfo {
        self.segment
            .page_mut(self.info_page)
            .transmute_page_mut::<FixedPoolInfo>()
    }

    #[inline]
    fn records_per_page(&self) -> u32 {
        1u32 << self.page_shift
    }

    fn page_table_slot(&self, page_num: u32) -> (u32, usize) {
        let byte_offset = page_num as usize * 4;
        let abs_page = self.page_table_start + (byte_offset / PAGE_SIZE) as u32;
        (abs_page, byte_offset % PAGE_SIZE)
    }

    fn data_page_matom(&self, page_num: u32) -> u32 {
        let (abs_page, within) = self.page_table_slot(page_num);
        *self.segment.page(abs_page).transmute_segment::<u32>(within)
    }

    fn set_data_page_matom(&self, page_num: u32, value: u32) {
        let (abs_page, within) = self.page_table_slot(page_num);
        *self
            .segment
            .page_mut(abs_page)
            .transmute_segment_mut::<u32>(within) = value;
    }

    /// Resolve a raw (1-based) record index to its backing page and
    /// in-page byte offset, or `None` if it is out of range. `addr` never
    /// walks the free list: it is pure two-level indexing.
    fn locate(&self, raw: u32) -> Option<(u32, usize)> {
        if raw == 0 {
            return None;
        }
        let idx0 = raw - 1;
        let records_per_page = self.records_per_page();
        let page_num = idx0 / records_per_page;
        if page_num >= self.info().pages_allocated {
            return None;
        }
        let slot = (idx0 % records_per_page) as usize;
        let data_page = self.data_page_matom(page_num);
        Some((data_page, slot * self.record_size as usize))
    }

    /// Return a read-only view of the record's bytes, or `None` if the
    /// atom is null or out of range. `addr(0)` (the null atom) always
    /// returns `None`.
    ///
    /// Borrowed for `'seg`, not `&self` — the bytes live in the segment's
    /// mmap, so callers (the Patricia trie's key function, in particular)
    /// can hold them independent of this pool handle's own lifetime.
    pub fn addr(&self, atom: Atom) -> Option<&'seg [u8]> {
        let raw = atom_to_raw(atom);
        let (page, offset) = self.locate(raw)?;
        let record_size = self.record_size as usize;
        Some(&self.segment.page(page)[offset..offset + record_size])
    }

    /// Mutable counterpart of [`FixedPool::addr`].
    #[allow(clippy::mut_from_ref)]
    pub fn addr_mut(&self, atom: Atom) -> Option<&'seg mut [u8]> {
        let raw = atom_to_raw(atom);
        let (page, offset) = self.locate(raw)?;
        let record_size = self.record_size as usize;
        Some(&mut self.segment.page_mut(page)[offset..offset + record_size])
    }

    fn link_at(&self, raw: u32) -> u32 {
        let (page, offset) = self.locate(raw).expect("link_at called on an unmapped record");
        *self.segment.page(page).transmute_segment::<u32>(offset)
    }

    fn set_link_at(&self, raw: u32, next: u32) {
        let (page, offset) = self.locate(raw).expect("set_link_at called on an unmapped record");
        *self.segment.page_mut(page).transmute_segment_mut::<u32>(offset) = next;
    }

    /// Grow the pool by one page, chaining its records onto the free list.
    /// Only called when the current free list is empty.
    fn grow(&self) -> Result<()> {
        let info = self.info();
        let records_per_page = self.records_per_page();
        if info.pages_allocated.saturating_mul(records_per_page) >= self.max_atoms {
            return Err(ParrotError::Full { max_atoms: self.max_atoms });
        }
        let page_num = info.pages_allocated;
        let data_matom = atom_to_raw(self.segment.alloc_pages(1)?);
        if self.flags & INIT_ZERO != 0 {
            self.segment.page_mut(data_matom).fill(0);
        }
        self.set_data_page_matom(page_num, data_matom);

        let first_raw = page_num * records_per_page + 1;
        for i in 0..records_per_page {
            let raw = first_raw + i;
            let next = if i + 1 < records_per_page { raw + 1 } else { 0 };
            self.set_link_at(raw, next);
        }
        let info = self.info_mut();
        info.pages_allocated += 1;
        info.free_head = first_raw;
        Ok(())
    }

    /// Allocate a record, returning the head of the free list. Grows the
    /// pool by one page if the free list is empty. Fails with `EFULL` if
    /// `max_atoms` has been reached.
    pub fn alloc(&self) -> Result<Atom> {
        if self.info().free_head == 0 {
            self.grow()?;
        }
        let head = self.info().free_head;
        let next = self.link_at(head);
        self.info_mut().free_head = next;
        Ok(atom_from_raw(head))
    }

    /// Push `atom` onto the head of the free list.
    pub fn free(&self, atom: Atom) {
        let raw = atom_to_raw(atom);
        assert_ne!(raw, 0, "free called on the null atom");
        assert!(
            self.locate(raw).is_some(),
            "free called on an atom never issued by this pool"
        );
        let old_head = self.info().free_head;
        self.set_link_at(raw, old_head);
        self.info_mut().free_head = raw;
    }

    pub fn record_size(&self) -> u32 {
        self.record_size
    }

    pub fn max_atoms(&self) -> u32 {
        self.max_atoms
    }
}
