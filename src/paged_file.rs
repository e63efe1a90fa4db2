//! The paged file: addressable, durable page-IO storage (spec.md §4.1).
//!
//! A page-IO is a fixed-size physical block. The first block of a chain
//! reserves 12 bytes for `(next_page: u64, payload_size: u32)`; every
//! continuation block reserves only the 8-byte `next_page` link, giving
//! it 4 extra usable bytes (`P - 8` vs. `P - 12`), exactly as spec.md's
//! "Computing the logical offset" note describes.
//!
//! Grounded on `src/pager/mod.rs`'s `VersionedPager::read_page`/
//! `write_page`/`write_header`, and on the `zerocopy`-backed `Header`
//! struct in the orphaned `src/pager.rs` (`little_endian::{U32, U64}` +
//! `FromBytes`/`IntoBytes`), reused here for the two link/size fields that
//! appear at the front of every page-IO.

use crate::error::{Error, Result};
use crate::file::File;
use bytes::{Bytes, BytesMut};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, IntoBytes};

/// Sentinel terminating the free list and any `next_page` chain; the
/// all-ones bit pattern doubles as `i64`'s `-1` (spec.md §6).
pub const NO_PAGE: u64 = u64::MAX;

const FIRST_HEADER_LEN: usize = 12;
const CONT_HEADER_LEN: usize = 8;

pub(crate) fn first_page_capacity(page_size: u32) -> usize {
    page_size as usize - FIRST_HEADER_LEN
}

pub(crate) fn cont_page_capacity(page_size: u32) -> usize {
    page_size as usize - CONT_HEADER_LEN
}

/// Number of page-IOs needed to hold `payload_len` bytes of logical record.
pub(crate) fn pages_needed_for(page_size: u32, payload_len: usize) -> usize {
    let first_cap = first_page_capacity(page_size);
    if payload_len <= first_cap {
        return 1;
    }
    let rest = payload_len - first_cap;
    let cont_cap = cont_page_capacity(page_size);
    1 + rest.div_ceil(cont_cap)
}

fn read_next_page(block: &[u8]) -> u64 {
    U64::read_from_bytes(&block[0..8]).expect("8-byte slice").get()
}

fn write_next_page(block: &mut [u8], next: u64) {
    let v: U64 = next.into();
    block[0..8].copy_from_slice(v.as_bytes());
}

fn read_payload_size(block: &[u8]) -> u32 {
    U32::read_from_bytes(&block[8..12]).expect("4-byte slice").get()
}

fn write_payload_size(block: &mut [u8], size: u32) {
    let v: U32 = size.into();
    block[8..12].copy_from_slice(v.as_bytes());
}

/// Thin wrapper over a `File` that knows the engine's page size and
/// enforces the page-IO framing. This is the single linearization point
/// for commits (`commit_header`).
pub struct PagedFile<F> {
    file: F,
    page_size: u32,
}

impl<F: File> PagedFile<F> {
    pub fn new(file: F, page_size: u32) -> Self {
        Self { file, page_size }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn file_len(&self) -> Result<u64> {
        self.file.len()
    }

    /// Reads exactly `page_size` bytes at `offset`.
    pub fn read_block(&self, offset: u64) -> Result<BytesMut> {
        let file_len = self.file.len()?;
        if offset + self.page_size as u64 > file_len {
            return Err(Error::EndOfFile {
                offset,
                page_size: self.page_size,
            });
        }

        let mut buf = BytesMut::zeroed(self.page_size as usize);
        self.file.read_at(&mut buf[..], offset)?;
        Ok(buf)
    }

    /// Writes exactly `page_size` bytes at `offset`. Extending the file is
    /// implicit: the underlying `File::write_at` resizes as needed.
    pub fn write_block(&self, offset: u64, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len(), self.page_size as usize);
        self.file.write_at(data, offset)
    }

    /// Reads the reserved header region (the first `page_size` bytes).
    /// Callers treat a too-short file as "no header yet" via
    /// `Error::EndOfFile`.
    pub fn read_header_region(&self) -> Result<BytesMut> {
        self.read_block(0)
    }

    /// Writes the Record-Manager Header into the reserved region and
    /// issues a durability barrier. This single byte write is the point at
    /// which a new revision becomes visible (spec.md §4.1, §4.7).
    pub fn commit_header(&self, bytes: &[u8]) -> Result<()> {
        debug_assert!(
            bytes.len() <= self.page_size as usize,
            "header must fit in a single page"
        );
        let mut block = vec![0u8; self.page_size as usize];
        block[..bytes.len()].copy_from_slice(bytes);
        self.file.write_at(&block, 0)?;
        self.file.sync_data()?;
        log::info!("committed header ({} bytes)", bytes.len());
        Ok(())
    }

    /// Writes `payload` across the page-IOs at `offsets`, linking them in
    /// order and terminating the chain with `NO_PAGE`.
    pub fn write_record(&self, offsets: &[u64], payload: &[u8]) -> Result<()> {
        assert_eq!(
            offsets.len(),
            pages_needed_for(self.page_size, payload.len()),
            "offsets must match the chain length payload requires"
        );

        let mut cursor = 0usize;
        for (i, &offset) in offsets.iter().enumerate() {
            let mut block = vec![0u8; self.page_size as usize];
            let next = offsets.get(i + 1).copied().unwrap_or(NO_PAGE);
            write_next_page(&mut block, next);

            let take = if i == 0 {
                write_payload_size(&mut block, payload.len() as u32);
                let cap = first_page_capacity(self.page_size);
                let take = cap.min(payload.len() - cursor);
                block[FIRST_HEADER_LEN..FIRST_HEADER_LEN + take]
                    .copy_from_slice(&payload[cursor..cursor + take]);
                take
            } else {
                let cap = cont_page_capacity(self.page_size);
                let take = cap.min(payload.len() - cursor);
                block[CONT_HEADER_LEN..CONT_HEADER_LEN + take]
                    .copy_from_slice(&payload[cursor..cursor + take]);
                take
            };

            self.write_block(offset, &block)?;
            cursor += take;
        }

        debug_assert_eq!(cursor, payload.len());
        Ok(())
    }

    /// Follows `next_page` links from `first_offset` until the recorded
    /// payload size has been read or the chain terminates early (a
    /// corruption, surfaced as `Error::Corrupt`).
    pub fn read_record(&self, first_offset: u64) -> Result<Bytes> {
        let first_block = self.read_block(first_offset)?;
        let total_len = read_payload_size(&first_block) as usize;
        let mut out = BytesMut::with_capacity(total_len);

        let cap = first_page_capacity(self.page_size);
        let take = cap.min(total_len);
        out.extend_from_slice(&first_block[FIRST_HEADER_LEN..FIRST_HEADER_LEN + take]);

        let mut next = read_next_page(&first_block);
        while out.len() < total_len {
            if next == NO_PAGE {
                return Err(Error::corrupt(format!(
                    "page chain starting at {} ended after {} of {} bytes",
                    first_offset,
                    out.len(),
                    total_len
                )));
            }

            let block = self.read_block(next)?;
            let cap = cont_page_capacity(self.page_size);
            let take = cap.min(total_len - out.len());
            out.extend_from_slice(&block[CONT_HEADER_LEN..CONT_HEADER_LEN + take]);
            next = read_next_page(&block);
        }

        Ok(out.freeze())
    }

    /// Reads just the `next_page` link of the page-IO at `offset`, used by
    /// the free-list allocator without decoding a full logical record.
    pub(crate) fn read_next_page_link(&self, offset: u64) -> Result<u64> {
        let block = self.read_block(offset)?;
        Ok(read_next_page(&block))
    }

    /// Overwrites just the link fields of the page-IO at `offset`, used
    /// when prepending a page to the free list.
    pub(crate) fn write_free_link(&self, offset: u64, next: u64) -> Result<()> {
        let mut block = vec![0u8; self.page_size as usize];
        write_next_page(&mut block, next);
        self.write_block(offset, &block)
    }
}
