//! The free-page allocator (spec.md §4.2).
//!
//! Grounded on `other_examples/a5d4ed77_DavisRayM-cryo__src-storage-pager.rs.rs`'s
//! `PagerMetadata { free_pages: Vec<usize>, pages: usize, root: usize }`
//! bookkeeping shape, adapted to a singly linked on-disk free list (rather
//! than an in-memory `Vec`) since spec.md §3 I6 requires the list itself
//! to survive a reopen, anchored at the Record-Manager Header's
//! `first_free_page`/`last_free_page` fields.

use crate::error::Result;
use crate::file::File;
use crate::paged_file::{pages_needed_for, PagedFile, NO_PAGE};

/// Manages the singly linked free list and end-of-file extension.
///
/// Every freed page-IO's own `next_page` link field is reused to chain it
/// into the free list (spec.md §4.2); no separate bookkeeping page is
/// needed for the list itself.
#[derive(Debug, Clone, Copy)]
pub struct FreeListAllocator {
    first_free: u64,
    last_free: u64,
    next_offset: u64,
}

impl FreeListAllocator {
    pub fn new(first_free: u64, last_free: u64, next_offset: u64) -> Self {
        Self {
            first_free,
            last_free,
            next_offset,
        }
    }

    pub fn first_free(&self) -> u64 {
        self.first_free
    }

    pub fn last_free(&self) -> u64 {
        self.last_free
    }

    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    /// Pops the head of the free list, or extends the file by one page.
    pub fn allocate_page<F: File>(&mut self, file: &PagedFile<F>) -> Result<u64> {
        if self.first_free == NO_PAGE {
            let offset = self.next_offset;
            self.next_offset += file.page_size() as u64;
            log::trace!("allocated page {} at end of file", offset);
            return Ok(offset);
        }

        let offset = self.first_free;
        self.first_free = file.read_next_page_link(offset)?;
        if self.first_free == NO_PAGE {
            self.last_free = NO_PAGE;
        }
        log::trace!("allocated page {} from free list", offset);
        Ok(offset)
    }

    /// Allocates enough page-IOs to hold `payload_len` bytes and returns
    /// their offsets in chain order (link fields are filled in by
    /// `PagedFile::write_record`, not here).
    pub fn allocate_chain<F: File>(
        &mut self,
        file: &PagedFile<F>,
        payload_len: usize,
    ) -> Result<Vec<u64>> {
        let n = pages_needed_for(file.page_size(), payload_len);
        (0..n).map(|_| self.allocate_page(file)).collect()
    }

    /// Prepends `offsets` to the free list, in the order given (so the
    /// first element of `offsets` becomes the new head).
    ///
    /// Per spec.md §4.2's retention policy, a caller with retention
    /// enabled should route freed pages into `copied-pages-tree` instead
    /// of calling this directly; this allocator only implements the
    /// "retention disabled" path and the sweeper's eventual release.
    pub fn free_pages<F: File>(&mut self, file: &PagedFile<F>, offsets: &[u64]) -> Result<()> {
        for &offset in offsets {
            let next = self.first_free;
            file.write_free_link(offset, next)?;
            self.first_free = offset;
            if self.last_free == NO_PAGE {
                self.last_free = offset;
            }
        }
        log::debug!("freed {} page(s), new head {}", offsets.len(), self.first_free);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::MemoryFile;

    fn paged_file() -> PagedFile<MemoryFile> {
        PagedFile::new(MemoryFile::new(), 512)
    }

    #[test]
    fn extends_file_when_list_empty() {
        let pf = paged_file();
        let mut alloc = FreeListAllocator::new(NO_PAGE, NO_PAGE, 512);

        let a = alloc.allocate_page(&pf).unwrap();
        let b = alloc.allocate_page(&pf).unwrap();

        assert_eq!(a, 512);
        assert_eq!(b, 1024);
    }

    #[test]
    fn reuses_freed_pages_lifo() {
        let pf = paged_file();
        let mut alloc = FreeListAllocator::new(NO_PAGE, NO_PAGE, 512);

        let a = alloc.allocate_page(&pf).unwrap();
        let b = alloc.allocate_page(&pf).unwrap();

        alloc.free_pages(&pf, &[a, b]).unwrap();
        assert_eq!(alloc.first_free(), b);

        let reused1 = alloc.allocate_page(&pf).unwrap();
        let reused2 = alloc.allocate_page(&pf).unwrap();

        assert_eq!(reused1, b);
        assert_eq!(reused2, a);
        assert_eq!(alloc.first_free(), NO_PAGE);
    }

    #[test]
    fn allocate_chain_sizes_correctly() {
        let pf = paged_file();
        let mut alloc = FreeListAllocator::new(NO_PAGE, NO_PAGE, 512);

        // 512 - 12 = 500 usable on first page; ask for 1200 bytes.
        let offsets = alloc.allocate_chain(&pf, 1200).unwrap();
        assert_eq!(offsets.len(), 1 + (1200 - 500_usize).div_ceil(512 - 8));
    }
}
