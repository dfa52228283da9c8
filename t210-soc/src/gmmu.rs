// SPDX-FileCopyrightText: 2025 t210 contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! GPU virtual address space manager (GMMU).
//!
//! Maps GPU virtual addresses onto host memory supplied by the caller. The
//! address space is a single range `[base, base + size)` that is always tiled
//! exactly by an ordered list of non-overlapping chunks, each of which is
//! unmapped, reserved or mapped to a host memory region.
//!
//! Every mutation inserts one chunk: the chunks it overlaps are truncated,
//! split or dropped so the tiling holds afterwards. Reads and writes walk the
//! chunk list from the chunk containing the start address and may cross any
//! number of chunk boundaries, since a contiguous GPU range can be backed by
//! discontiguous host regions.
//!
//! This does not model the SMMU that sits between the GMMU and physical
//! memory on the X1.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::RwLock;
use thiserror::Error;

use t210_common::{
    is_aligned, GpuVAddr, GPU_ADDRESS_SPACE_BASE, GPU_ADDRESS_SPACE_SIZE, GPU_PAGE_SIZE,
};

use crate::diagnostics::Diagnostics;

/// Small page size, for address spaces that are not managed in big pages.
pub const GPU_SMALL_PAGE_SIZE: u64 = 0x1000;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors returned by [`GraphicsMemoryManager`] operations.
///
/// `OutOfSpace`, `InvalidAlignment` and `ZeroSize` are recoverable and are
/// the cases where the hardware interface reports a zero address. The rest
/// are guest faults.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GmmuError {
    #[error("no unmapped region of 0x{size:X} bytes with alignment 0x{alignment:X}")]
    OutOfSpace { size: u64, alignment: u64 },

    #[error("0x{0:X} is not aligned to the GPU page size")]
    InvalidAlignment(u64),

    #[error("size must be non-zero")]
    ZeroSize,

    #[error("failed to insert chunk at 0x{va:X} (size 0x{size:X}) into the GPU address space")]
    AddressSpaceCorruption { va: GpuVAddr, size: u64 },

    #[error("failed to access GPU address space: address 0x{va:X}, size 0x{size:X}")]
    UnmappedAccess { va: GpuVAddr, size: u64 },

    #[error("access past the end of host memory: address 0x{va:X}, size 0x{size:X}")]
    HostBoundsExceeded { va: GpuVAddr, size: u64 },
}

/// Result alias for GMMU operations.
pub type GmmuResult<T> = Result<T, GmmuError>;

impl GmmuError {
    /// Whether the error is a guest fault rather than a failed request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AddressSpaceCorruption { .. }
                | Self::UnmappedAccess { .. }
                | Self::HostBoundsExceeded { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Host memory
// ---------------------------------------------------------------------------

/// A non-owning view of host memory that backs a mapped chunk.
///
/// The GMMU never owns or frees this memory. Whoever maps it guarantees it
/// stays valid for as long as any part of it remains mapped.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct HostSlice {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: a `HostSlice` is only dereferenced by the GMMU under the contract of
// `from_raw_parts`, which makes the memory valid from any thread.
unsafe impl Send for HostSlice {}
unsafe impl Sync for HostSlice {}

impl HostSlice {
    /// Create a view of `len` bytes starting at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes for as long as
    /// any chunk maps it, and the memory must not be accessed through Rust
    /// references concurrently with GMMU reads or writes of the same bytes.
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Length of the host region in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw pointer to the start of the region.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// The view starting `offset` bytes further in, clamped to the end.
    fn advance(self, offset: u64) -> Self {
        let offset = usize::try_from(offset).unwrap_or(usize::MAX).min(self.len);
        // SAFETY: `offset <= len`, so the result is in bounds or one past the end.
        let ptr = unsafe { self.ptr.add(offset) };
        Self {
            ptr,
            len: self.len - offset,
        }
    }
}

impl From<&'static mut [u8]> for HostSlice {
    fn from(slice: &'static mut [u8]) -> Self {
        let len = slice.len();
        Self {
            ptr: NonNull::from(slice).cast(),
            len,
        }
    }
}

impl fmt::Debug for HostSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostSlice({:p}, 0x{:X})", self.ptr, self.len)
    }
}

// ---------------------------------------------------------------------------
// Chunks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Unmapped,
    Reserved,
    /// Mapped, with host memory present.
    Mapped,
}

/// One contiguous run of the address space with a single state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub virtual_address: GpuVAddr,
    pub size: u64,
    /// Host memory backing the chunk, only present when mapped.
    pub host: Option<HostSlice>,
    pub state: ChunkState,
}

impl ChunkDescriptor {
    fn unmapped(virtual_address: GpuVAddr, size: u64) -> Self {
        Self {
            virtual_address,
            size,
            host: None,
            state: ChunkState::Unmapped,
        }
    }

    fn reserved(virtual_address: GpuVAddr, size: u64) -> Self {
        Self {
            virtual_address,
            size,
            host: None,
            state: ChunkState::Reserved,
        }
    }

    fn mapped(virtual_address: GpuVAddr, size: u64, host: HostSlice) -> Self {
        Self {
            virtual_address,
            size,
            host: Some(host),
            state: ChunkState::Mapped,
        }
    }

    /// One past the last address of the chunk.
    pub fn end(&self) -> GpuVAddr {
        self.virtual_address + self.size
    }

    pub fn contains(&self, address: GpuVAddr) -> bool {
        address >= self.virtual_address && address < self.end()
    }

    /// Whether `other` fits wholly within this chunk.
    pub fn can_contain(&self, other: &ChunkDescriptor) -> bool {
        other.virtual_address >= self.virtual_address && other.end() <= self.end()
    }

    /// The part of this chunk below `address`.
    fn prefix_until(&self, address: GpuVAddr) -> Self {
        Self {
            size: address - self.virtual_address,
            ..*self
        }
    }

    /// The part of this chunk from `address` on. A mapped chunk keeps pointing
    /// at the same host bytes for the addresses it still covers.
    fn suffix_from(&self, address: GpuVAddr) -> Self {
        let offset = address - self.virtual_address;
        Self {
            virtual_address: address,
            size: self.size - offset,
            host: self.host.map(|host| host.advance(offset)),
            state: self.state,
        }
    }
}

// ---------------------------------------------------------------------------
// Graphics memory manager
// ---------------------------------------------------------------------------

/// GPU virtual address space manager backed by a chunk list.
pub struct GraphicsMemoryManager {
    base: GpuVAddr,
    size: u64,
    page_size: u64,
    chunks: RwLock<Vec<ChunkDescriptor>>,
    diagnostics: Arc<dyn Diagnostics>,
}

impl GraphicsMemoryManager {
    /// Create an address space covering `[base, base + size)` managed in
    /// `page_size` granules. `base` should be non-zero so a zero address can
    /// never be a valid allocation.
    pub fn new(
        base: GpuVAddr,
        size: u64,
        page_size: u64,
        diagnostics: Arc<dyn Diagnostics>,
    ) -> Self {
        assert!(page_size.is_power_of_two(), "GPU page size must be a power of two");
        assert!(
            is_aligned(base, page_size) && is_aligned(size, page_size) && size != 0,
            "GPU address space must be page aligned and non-empty"
        );

        Self {
            base,
            size,
            page_size,
            // The initial chunk that every other chunk is split from.
            chunks: RwLock::new(vec![ChunkDescriptor::unmapped(base, size)]),
            diagnostics,
        }
    }

    /// The 1 TiB, 64 KiB-paged address space used by the GPU.
    pub fn with_defaults(diagnostics: Arc<dyn Diagnostics>) -> Self {
        Self::new(
            GPU_ADDRESS_SPACE_BASE,
            GPU_ADDRESS_SPACE_SIZE,
            GPU_PAGE_SIZE,
            diagnostics,
        )
    }

    pub fn base(&self) -> GpuVAddr {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Snapshot of the chunk list, in ascending address order.
    pub fn chunks(&self) -> Vec<ChunkDescriptor> {
        self.chunks.read().clone()
    }

    /// Reserve a region so it will not be chosen automatically when mapping.
    /// Returns the base address of the reserved region.
    pub fn reserve_space(&self, size: u64, alignment: u64) -> GmmuResult<GpuVAddr> {
        let size = self.page_align_size(size)?;
        let alignment = self.page_align_alignment(alignment)?;

        let mut chunks = self.chunks.write();
        let va = find_chunk(&chunks, ChunkState::Unmapped, size, alignment)
            .ok_or(GmmuError::OutOfSpace { size, alignment })?;
        let va = self.insert_or_fault(&mut chunks, ChunkDescriptor::reserved(va, size))?;

        log::trace!("gmmu: reserve 0x{:X}..0x{:X}", va, va + size);
        Ok(va)
    }

    /// Reserve a fixed region, overriding whatever was there.
    pub fn reserve_fixed(&self, va: GpuVAddr, size: u64) -> GmmuResult<GpuVAddr> {
        self.check_page_aligned(va)?;
        let size = self.page_align_size(size)?;

        let mut chunks = self.chunks.write();
        let va = self.insert_or_fault(&mut chunks, ChunkDescriptor::reserved(va, size))?;

        log::trace!("gmmu: reserve fixed 0x{:X}..0x{:X}", va, va + size);
        Ok(va)
    }

    /// Map host memory into an automatically chosen region.
    pub fn map_allocate(&self, host: HostSlice, size: u64) -> GmmuResult<GpuVAddr> {
        let size = self.page_align_size(size)?;

        let mut chunks = self.chunks.write();
        let va = find_chunk(&chunks, ChunkState::Unmapped, size, self.page_size).ok_or(
            GmmuError::OutOfSpace {
                size,
                alignment: self.page_size,
            },
        )?;
        let va = self.insert_or_fault(&mut chunks, ChunkDescriptor::mapped(va, size, host))?;

        log::trace!("gmmu: map 0x{:X}..0x{:X} -> {:?}", va, va + size, host);
        Ok(va)
    }

    /// Map host memory at a fixed address, overriding whatever was there.
    pub fn map_fixed(&self, va: GpuVAddr, host: HostSlice, size: u64) -> GmmuResult<GpuVAddr> {
        self.check_page_aligned(va)?;
        let size = self.page_align_size(size)?;

        let mut chunks = self.chunks.write();
        let va = self.insert_or_fault(&mut chunks, ChunkDescriptor::mapped(va, size, host))?;

        log::trace!("gmmu: map fixed 0x{:X}..0x{:X} -> {:?}", va, va + size, host);
        Ok(va)
    }

    /// Unmap every chunk in the given region. Returns whether it succeeded;
    /// a failed unmap leaves the address space untouched.
    pub fn unmap(&self, va: GpuVAddr, size: u64) -> bool {
        if self.check_page_aligned(va).is_err() {
            return false;
        }
        let Ok(size) = self.page_align_size(size) else {
            return false;
        };

        let mut chunks = self.chunks.write();
        match insert_chunk(&mut chunks, ChunkDescriptor::unmapped(va, size)) {
            Ok(_) => {
                log::trace!("gmmu: unmap 0x{:X}..0x{:X}", va, va + size);
                true
            }
            Err(e) => {
                log::warn!("gmmu: {}", e);
                false
            }
        }
    }

    /// Read `dst.len()` bytes starting at `va`.
    pub fn read(&self, dst: &mut [u8], va: GpuVAddr) -> GmmuResult<()> {
        let chunks = self.chunks.read();
        let segments = self.resolve_or_fault(&chunks, va, dst.len())?;

        let mut offset = 0;
        for (source, len) in segments {
            // SAFETY: `resolve` checked the segment lies within its host slice.
            unsafe {
                std::ptr::copy_nonoverlapping(source, dst[offset..offset + len].as_mut_ptr(), len);
            }
            offset += len;
        }
        Ok(())
    }

    /// Write `src` starting at `va`.
    pub fn write(&self, src: &[u8], va: GpuVAddr) -> GmmuResult<()> {
        // Host contents change but the chunk list does not, so a shared lock
        // is enough.
        let chunks = self.chunks.read();
        let segments = self.resolve_or_fault(&chunks, va, src.len())?;

        let mut offset = 0;
        for (destination, len) in segments {
            // SAFETY: `resolve` checked the segment lies within its host slice.
            unsafe {
                std::ptr::copy_nonoverlapping(src[offset..offset + len].as_ptr(), destination, len);
            }
            offset += len;
        }
        Ok(())
    }

    // ── Typed accessors ──────────────────────────────────────────────────

    pub fn read_u32(&self, va: GpuVAddr) -> GmmuResult<u32> {
        let mut buf = [0u8; 4];
        self.read(&mut buf, va)?;
        Ok(LittleEndian::read_u32(&buf))
    }

    pub fn read_u64(&self, va: GpuVAddr) -> GmmuResult<u64> {
        let mut buf = [0u8; 8];
        self.read(&mut buf, va)?;
        Ok(LittleEndian::read_u64(&buf))
    }

    pub fn write_u32(&self, value: u32, va: GpuVAddr) -> GmmuResult<()> {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, value);
        self.write(&buf, va)
    }

    pub fn write_u64(&self, value: u64, va: GpuVAddr) -> GmmuResult<()> {
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, value);
        self.write(&buf, va)
    }

    /// Read a run of little-endian 32-bit words, e.g. a pushbuffer.
    pub fn read_words(&self, dst: &mut [u32], va: GpuVAddr) -> GmmuResult<()> {
        let mut buf = vec![0u8; dst.len() * 4];
        self.read(&mut buf, va)?;
        LittleEndian::read_u32_into(&buf, dst);
        Ok(())
    }

    /// Read `count` words at `va` into a new buffer. The range is resolved
    /// before anything is allocated, so an unmapped or absurd length fails
    /// without touching host memory.
    pub fn read_words_to_vec(&self, va: GpuVAddr, count: usize) -> GmmuResult<Vec<u32>> {
        let size = count.checked_mul(4).ok_or(GmmuError::UnmappedAccess {
            va,
            size: u64::MAX,
        })?;
        let chunks = self.chunks.read();
        let segments = self.resolve_or_fault(&chunks, va, size)?;

        let mut bytes = Vec::with_capacity(size);
        for (source, len) in segments {
            // SAFETY: `resolve` checked the segment lies within its host slice.
            bytes.extend_from_slice(unsafe { std::slice::from_raw_parts(source, len) });
        }
        drop(chunks);

        let mut words = vec![0u32; count];
        LittleEndian::read_u32_into(&bytes, &mut words);
        Ok(words)
    }

    pub fn write_words(&self, src: &[u32], va: GpuVAddr) -> GmmuResult<()> {
        let mut buf = vec![0u8; src.len() * 4];
        LittleEndian::write_u32_into(src, &mut buf);
        self.write(&buf, va)
    }

    // ── Internal helpers ─────────────────────────────────────────────────

    fn page_align_size(&self, size: u64) -> GmmuResult<u64> {
        if size == 0 {
            return Err(GmmuError::ZeroSize);
        }
        let mask = self.page_size - 1;
        size.checked_add(mask)
            .map(|end| end & !mask)
            .ok_or(GmmuError::OutOfSpace {
                size,
                alignment: self.page_size,
            })
    }

    /// Zero means page alignment; anything else must be a power of two and is
    /// raised to at least the page size.
    fn page_align_alignment(&self, alignment: u64) -> GmmuResult<u64> {
        match alignment {
            0 => Ok(self.page_size),
            a if a.is_power_of_two() => Ok(a.max(self.page_size)),
            a => Err(GmmuError::InvalidAlignment(a)),
        }
    }

    fn check_page_aligned(&self, va: GpuVAddr) -> GmmuResult<()> {
        if is_aligned(va, self.page_size) {
            Ok(())
        } else {
            Err(GmmuError::InvalidAlignment(va))
        }
    }

    fn insert_or_fault(
        &self,
        chunks: &mut Vec<ChunkDescriptor>,
        chunk: ChunkDescriptor,
    ) -> GmmuResult<GpuVAddr> {
        insert_chunk(chunks, chunk).inspect_err(|e| self.diagnostics.guest_fault("gmmu", e))
    }

    fn resolve_or_fault(
        &self,
        chunks: &[ChunkDescriptor],
        va: GpuVAddr,
        size: usize,
    ) -> GmmuResult<Vec<(*mut u8, usize)>> {
        resolve(chunks, va, size).inspect_err(|e| self.diagnostics.guest_fault("gmmu", e))
    }
}

/// First fit: the lowest `alignment`-aligned address inside a chunk in
/// `desired_state` that leaves room for `size` bytes.
fn find_chunk(
    chunks: &[ChunkDescriptor],
    desired_state: ChunkState,
    size: u64,
    alignment: u64,
) -> Option<GpuVAddr> {
    chunks
        .iter()
        .filter(|chunk| chunk.state == desired_state)
        .find_map(|chunk| {
            let mask = alignment - 1;
            let start = chunk.virtual_address.checked_add(mask)? & !mask;
            let end = start.checked_add(size)?;
            (end <= chunk.end()).then_some(start)
        })
}

/// Insert `new_chunk`, truncating, splitting or dropping whatever it overlaps.
///
/// The run of chunks from the one holding the first byte of `new_chunk`
/// (head) to the one holding its last byte (tail) is replaced by the head's
/// leading remainder, `new_chunk`, and the tail's trailing remainder, with
/// empty remainders left out. When head and tail are the same chunk this
/// splits it in up to three. Nothing is modified on failure.
fn insert_chunk(
    chunks: &mut Vec<ChunkDescriptor>,
    new_chunk: ChunkDescriptor,
) -> GmmuResult<GpuVAddr> {
    let corruption = GmmuError::AddressSpaceCorruption {
        va: new_chunk.virtual_address,
        size: new_chunk.size,
    };
    let new_end = new_chunk
        .virtual_address
        .checked_add(new_chunk.size)
        .ok_or(corruption.clone())?;

    let head = chunks
        .partition_point(|chunk| chunk.virtual_address <= new_chunk.virtual_address)
        .checked_sub(1)
        .ok_or(corruption.clone())?;
    if !chunks[head].contains(new_chunk.virtual_address) {
        return Err(corruption);
    }
    let tail = chunks[head..]
        .iter()
        .position(|chunk| chunk.end() >= new_end)
        .map(|i| head + i)
        .ok_or(corruption)?;

    let head_chunk = chunks[head];
    let tail_chunk = chunks[tail];

    let mut replacement = Vec::with_capacity(3);
    if head_chunk.virtual_address < new_chunk.virtual_address {
        replacement.push(head_chunk.prefix_until(new_chunk.virtual_address));
    }
    let inserted = head + replacement.len();
    replacement.push(new_chunk);
    if tail_chunk.end() > new_end {
        replacement.push(tail_chunk.suffix_from(new_end));
    }

    chunks.splice(head..=tail, replacement);
    coalesce_unmapped(chunks, inserted);

    Ok(new_chunk.virtual_address)
}

/// Merge the unmapped chunk at `index` with unmapped neighbours so free space
/// does not fragment across repeated map/unmap cycles.
fn coalesce_unmapped(chunks: &mut Vec<ChunkDescriptor>, mut index: usize) {
    if chunks[index].state != ChunkState::Unmapped {
        return;
    }
    while index > 0 && chunks[index - 1].state == ChunkState::Unmapped {
        chunks[index - 1].size += chunks[index].size;
        chunks.remove(index);
        index -= 1;
    }
    while index + 1 < chunks.len() && chunks[index + 1].state == ChunkState::Unmapped {
        chunks[index].size += chunks[index + 1].size;
        chunks.remove(index + 1);
    }
}

/// Resolve `[va, va + size)` into host segments, failing if any byte is not
/// backed by mapped host memory.
fn resolve(
    chunks: &[ChunkDescriptor],
    va: GpuVAddr,
    size: usize,
) -> GmmuResult<Vec<(*mut u8, usize)>> {
    let mut segments = Vec::new();
    if size == 0 {
        return Ok(segments);
    }

    let fault = GmmuError::UnmappedAccess {
        va,
        size: size as u64,
    };
    let mut index = chunks
        .partition_point(|chunk| chunk.virtual_address <= va)
        .checked_sub(1)
        .ok_or(fault.clone())?;

    let mut address = va;
    let mut remaining = size;
    while remaining > 0 {
        let chunk = chunks.get(index).ok_or(fault.clone())?;
        if chunk.state != ChunkState::Mapped || !chunk.contains(address) {
            return Err(fault);
        }
        let host = chunk.host.ok_or(fault.clone())?;

        let offset = address - chunk.virtual_address;
        let len = (chunk.end() - address).min(remaining as u64) as usize;
        let in_bounds = usize::try_from(offset)
            .ok()
            .and_then(|offset| offset.checked_add(len))
            .is_some_and(|end| end <= host.len());
        if !in_bounds {
            return Err(GmmuError::HostBoundsExceeded {
                va,
                size: size as u64,
            });
        }

        // SAFETY: bounds were checked against the host slice just above.
        segments.push((unsafe { host.as_ptr().add(offset as usize) }, len));
        address += len as u64;
        remaining -= len;
        index += 1;
    }

    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::GuestProcess;

    const PAGE: u64 = GPU_PAGE_SIZE;

    fn gmmu() -> (GraphicsMemoryManager, Arc<GuestProcess>) {
        let guest = Arc::new(GuestProcess::new());
        (GraphicsMemoryManager::with_defaults(guest.clone()), guest)
    }

    fn host(buf: &mut [u8]) -> HostSlice {
        unsafe { HostSlice::from_raw_parts(NonNull::new(buf.as_mut_ptr()).unwrap(), buf.len()) }
    }

    /// Sorted, contiguous, non-empty chunks covering the whole space.
    fn assert_tiled(mm: &GraphicsMemoryManager) {
        let chunks = mm.chunks();
        assert!(!chunks.is_empty());
        assert_eq!(chunks[0].virtual_address, mm.base());
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].end(), pair[1].virtual_address, "gap or overlap: {:?}", pair);
        }
        for chunk in &chunks {
            assert!(chunk.size > 0, "empty chunk {:?}", chunk);
            assert_eq!(chunk.host.is_some(), chunk.state == ChunkState::Mapped);
        }
        assert_eq!(chunks.last().unwrap().end(), mm.base() + mm.size());
    }

    fn state_at(mm: &GraphicsMemoryManager, va: GpuVAddr) -> ChunkState {
        mm.chunks().into_iter().find(|c| c.contains(va)).unwrap().state
    }

    #[test]
    fn test_fresh_space_is_one_unmapped_chunk() {
        let (mm, _) = gmmu();
        let chunks = mm.chunks();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].virtual_address, GPU_ADDRESS_SPACE_BASE);
        assert_eq!(chunks[0].size, GPU_ADDRESS_SPACE_SIZE);
        assert_eq!(chunks[0].state, ChunkState::Unmapped);
    }

    #[test]
    fn test_reserve_space_first_fit() {
        let (mm, _) = gmmu();
        let a = mm.reserve_space(0x10000, 0x10000).unwrap();
        assert_eq!(a, 0x10_0000);
        let b = mm.reserve_space(0x8000, 0).unwrap();
        assert_eq!(b, a + PAGE);
        assert_eq!(state_at(&mm, a), ChunkState::Reserved);
        assert_eq!(state_at(&mm, b), ChunkState::Reserved);
        assert_tiled(&mm);
    }

    #[test]
    fn test_reserve_space_alignment() {
        let (mm, _) = gmmu();
        mm.reserve_space(PAGE, 0).unwrap();
        let aligned = mm.reserve_space(PAGE, 0x100_0000).unwrap();
        assert!(is_aligned(aligned, 0x100_0000));
        assert_tiled(&mm);
        assert_eq!(
            mm.reserve_space(PAGE, 0x3000),
            Err(GmmuError::InvalidAlignment(0x3000))
        );
    }

    #[test]
    fn test_small_page_map_splits_reservation() {
        let guest = Arc::new(GuestProcess::new());
        let mm = GraphicsMemoryManager::new(0x10_0000, 1 << 40, GPU_SMALL_PAGE_SIZE, guest);
        let mut buf = vec![0u8; 0x8000];

        let va = mm.reserve_space(0x10000, 0x10000).unwrap();
        assert_eq!(va, 0x10_0000);
        assert_eq!(mm.map_fixed(0x10_0000, host(&mut buf), 0x8000).unwrap(), 0x10_0000);

        let chunks = mm.chunks();
        assert_eq!(chunks[0].state, ChunkState::Mapped);
        assert_eq!(chunks[0].size, 0x8000);
        assert_eq!(chunks[1].virtual_address, 0x10_8000);
        assert_eq!(chunks[1].end(), 0x11_0000);
        assert_eq!(chunks[1].state, ChunkState::Reserved);
        assert_eq!(chunks[2].state, ChunkState::Unmapped);
        assert_tiled(&mm);
    }

    #[test]
    fn test_fixed_requests_must_be_page_aligned() {
        let (mm, _) = gmmu();
        let mut buf = vec![0u8; 0x100];
        assert_eq!(
            mm.reserve_fixed(0x10_1000, PAGE),
            Err(GmmuError::InvalidAlignment(0x10_1000))
        );
        assert_eq!(
            mm.map_fixed(0x10_0800, host(&mut buf), PAGE),
            Err(GmmuError::InvalidAlignment(0x10_0800))
        );
        assert!(!mm.unmap(0x10_0001, PAGE));
        assert_eq!(mm.chunks().len(), 1);
    }

    #[test]
    fn test_out_of_space() {
        let guest = Arc::new(GuestProcess::new());
        let mm = GraphicsMemoryManager::new(PAGE, 4 * PAGE, PAGE, guest.clone());
        assert_eq!(mm.reserve_space(2 * PAGE, 0).unwrap(), PAGE);
        assert_eq!(
            mm.reserve_space(3 * PAGE, 0),
            Err(GmmuError::OutOfSpace {
                size: 3 * PAGE,
                alignment: PAGE
            })
        );
        assert_eq!(mm.reserve_space(0, 0), Err(GmmuError::ZeroSize));
        // Recoverable failures never take the guest down.
        assert!(guest.is_guest_alive());
        assert_tiled(&mm);
    }

    #[test]
    fn test_oversized_requests_fail_recoverably() {
        let (mm, guest) = gmmu();
        let mut buf = vec![0u8; 0x100];
        for size in [u64::MAX, u64::MAX - 5] {
            assert!(matches!(
                mm.reserve_space(size, 0),
                Err(GmmuError::OutOfSpace { .. })
            ));
            assert!(matches!(
                mm.reserve_fixed(mm.base(), size),
                Err(GmmuError::OutOfSpace { .. })
            ));
            assert!(matches!(
                mm.map_allocate(host(&mut buf), size),
                Err(GmmuError::OutOfSpace { .. })
            ));
            assert!(matches!(
                mm.map_fixed(mm.base(), host(&mut buf), size),
                Err(GmmuError::OutOfSpace { .. })
            ));
            assert!(!mm.unmap(mm.base(), size));
        }
        assert!(guest.is_guest_alive());
        assert_eq!(mm.chunks().len(), 1);
        assert_tiled(&mm);
    }

    #[test]
    fn test_insert_outside_space_is_fatal() {
        let (mm, guest) = gmmu();
        let end = mm.base() + mm.size();
        assert!(matches!(
            mm.reserve_fixed(end - PAGE, 2 * PAGE),
            Err(GmmuError::AddressSpaceCorruption { .. })
        ));
        assert!(!guest.is_guest_alive());
        assert_tiled(&mm);
    }

    #[test]
    fn test_unmap_outside_space_fails_without_fault() {
        let (mm, guest) = gmmu();
        assert!(!mm.unmap(0, PAGE));
        assert!(guest.is_guest_alive());
        assert_tiled(&mm);
    }

    #[test]
    fn test_fixed_insert_spanning_many_chunks() {
        let (mm, _) = gmmu();
        let base = mm.base();
        for i in 0..6 {
            mm.reserve_fixed(base + i * 2 * PAGE, PAGE).unwrap();
        }
        assert_tiled(&mm);

        // Starts inside the second reservation's gap and ends inside the fifth.
        mm.reserve_fixed(base + 3 * PAGE, 6 * PAGE).unwrap();
        assert_tiled(&mm);
        for page in 3..9 {
            assert_eq!(state_at(&mm, base + page * PAGE), ChunkState::Reserved);
        }
        assert_eq!(state_at(&mm, base + PAGE), ChunkState::Unmapped);
        assert_eq!(state_at(&mm, base + 9 * PAGE), ChunkState::Unmapped);
    }

    #[test]
    fn test_tiling_survives_mixed_operations() {
        let (mm, _) = gmmu();
        let mut buf = vec![0u8; (16 * PAGE) as usize];
        let base = mm.base();

        // Deterministic pseudo-random op sequence over a 32-page window.
        let mut seed = 0x2545_F491u64;
        for _ in 0..200 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let page = (seed >> 33) % 32;
            let pages = 1 + (seed >> 40) % 8;
            let va = base + page * PAGE;
            match (seed >> 50) % 4 {
                0 => {
                    mm.reserve_fixed(va, pages * PAGE).unwrap();
                }
                1 => {
                    mm.map_fixed(va, host(&mut buf), pages * PAGE).unwrap();
                }
                2 => assert!(mm.unmap(va, pages * PAGE)),
                _ => {
                    mm.reserve_space(pages * PAGE, 0).unwrap();
                }
            }
            assert_tiled(&mm);
        }
    }

    #[test]
    fn test_map_unmap_restores_topology() {
        let (mm, _) = gmmu();
        let mut buf = vec![0u8; (4 * PAGE) as usize];
        let before = mm.chunks();

        let va = mm.map_allocate(host(&mut buf), 4 * PAGE).unwrap();
        assert_eq!(state_at(&mm, va), ChunkState::Mapped);
        assert!(mm.unmap(va, 4 * PAGE));

        assert_eq!(mm.chunks(), before);
    }

    #[test]
    fn test_write_read_round_trip_across_chunks() {
        let (mm, _) = gmmu();
        let mut first = vec![0u8; PAGE as usize];
        let mut second = vec![0u8; PAGE as usize];
        let va = mm.base();
        mm.map_fixed(va, host(&mut first), PAGE).unwrap();
        mm.map_fixed(va + PAGE, host(&mut second), PAGE).unwrap();

        let data: Vec<u8> = (0..64u8).collect();
        let start = va + PAGE - 32;
        mm.write(&data, start).unwrap();

        let mut back = vec![0u8; 64];
        mm.read(&mut back, start).unwrap();
        assert_eq!(back, data);

        // The GPU range is contiguous but the host halves are not.
        assert_eq!(&first[(PAGE - 32) as usize..], &data[..32]);
        assert_eq!(&second[..32], &data[32..]);
    }

    #[test]
    fn test_read_words_to_vec() {
        let (mm, guest) = gmmu();
        let mut buf = vec![0u8; PAGE as usize];
        let va = mm.map_allocate(host(&mut buf), PAGE).unwrap();
        mm.write_words(&[0x4000_000C, 0xCAFE], va).unwrap();

        assert_eq!(mm.read_words_to_vec(va, 2).unwrap(), vec![0x4000_000C, 0xCAFE]);
        assert!(guest.is_guest_alive());

        // Runs off the end of the mapping long before a buffer this size
        // would be allocated.
        assert!(matches!(
            mm.read_words_to_vec(va, u32::MAX as usize),
            Err(GmmuError::UnmappedAccess { .. })
        ));
        assert!(!guest.is_guest_alive());
    }

    #[test]
    fn test_split_mapping_keeps_host_offsets() {
        let (mm, _) = gmmu();
        let mut buf = vec![0u8; (3 * PAGE) as usize];
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = (i / PAGE as usize) as u8 + 1;
        }
        let va = mm.map_allocate(host(&mut buf), 3 * PAGE).unwrap();

        // Punch out the middle page; the tail must still see the third page.
        mm.reserve_fixed(va + PAGE, PAGE).unwrap();
        assert_tiled(&mm);

        let mut byte = [0u8; 1];
        mm.read(&mut byte, va + 2 * PAGE + 5).unwrap();
        assert_eq!(byte[0], 3);
        mm.read(&mut byte, va).unwrap();
        assert_eq!(byte[0], 1);
    }

    #[test]
    fn test_unmapped_access_faults_guest() {
        let (mm, guest) = gmmu();
        let mut buf = [0u8; 4];
        let va = mm.reserve_space(PAGE, 0).unwrap();

        assert_eq!(
            mm.read(&mut buf, va),
            Err(GmmuError::UnmappedAccess { va, size: 4 })
        );
        assert!(!guest.is_guest_alive());
    }

    #[test]
    fn test_access_running_into_unmapped_chunk_fails() {
        let (mm, _) = gmmu();
        let mut backing = vec![0u8; PAGE as usize];
        let va = mm.map_allocate(host(&mut backing), PAGE).unwrap();
        let data = [0xAAu8; 16];
        assert!(matches!(
            mm.write(&data, va + PAGE - 8),
            Err(GmmuError::UnmappedAccess { .. })
        ));
        // Nothing was written before the fault was detected.
        assert!(backing.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_host_bounds_exceeded() {
        let (mm, _) = gmmu();
        let mut small = vec![0u8; 0x100];
        let va = mm.map_allocate(host(&mut small), 0x100).unwrap();
        mm.write_u32(0x1234_5678, va + 0xFC).unwrap();
        assert!(matches!(
            mm.read_u32(va + 0x100),
            Err(GmmuError::HostBoundsExceeded { .. })
        ));
    }

    #[test]
    fn test_typed_accessors() {
        let (mm, _) = gmmu();
        let mut backing = memmap2::MmapMut::map_anon(PAGE as usize).unwrap();
        let va = mm.map_allocate(host(&mut backing), PAGE).unwrap();

        mm.write_u32(0xDEAD_BEEF, va).unwrap();
        mm.write_u64(0x0123_4567_89AB_CDEF, va + 8).unwrap();
        assert_eq!(mm.read_u32(va).unwrap(), 0xDEAD_BEEF);
        assert_eq!(mm.read_u64(va + 8).unwrap(), 0x0123_4567_89AB_CDEF);
        assert_eq!(&backing[..4], &[0xEF, 0xBE, 0xAD, 0xDE]);

        let words = [1u32, 2, 3, 0xFFFF_FFFF];
        mm.write_words(&words, va + 0x100).unwrap();
        let mut back = [0u32; 4];
        mm.read_words(&mut back, va + 0x100).unwrap();
        assert_eq!(back, words);
    }

    #[test]
    fn test_concurrent_reads_during_reservations() {
        let (mm, _) = gmmu();
        let mm = Arc::new(mm);
        let backing: &'static mut [u8] = Box::leak(vec![7u8; PAGE as usize].into_boxed_slice());
        let va = mm.map_allocate(HostSlice::from(backing), PAGE).unwrap();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let mm = mm.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        assert_eq!(mm.read_u32(va).unwrap(), 0x0707_0707);
                    }
                })
            })
            .collect();
        for _ in 0..100 {
            mm.reserve_space(PAGE, 0).unwrap();
        }
        for reader in readers {
            reader.join().unwrap();
        }
        assert_tiled(&mm);
    }
}
