// SPDX-FileCopyrightText: 2025 t210 contributors
// SPDX-License-Identifier: GPL-3.0-or-later

/// Virtual address in the GPU (GMMU) address space.
pub type GpuVAddr = u64;

/// Syncpoint index into the Host1x syncpoint array.
pub type SyncpointId = u32;

/// GPU page size (64 KiB, the big-page granularity of the GM20B GMMU).
pub const GPU_PAGE_SIZE: u64 = 1 << 16;

/// Base of the GPU address space. Non-zero so that a zero address never
/// names a valid allocation.
pub const GPU_ADDRESS_SPACE_BASE: GpuVAddr = 0x10_0000;

/// Size of the GPU address space (40-bit, 1 TiB).
pub const GPU_ADDRESS_SPACE_SIZE: u64 = 1 << 40;

/// Number of Host1x syncpoints on T210.
pub const SYNCPOINT_COUNT: usize = 192;

/// Number of Host1x channels with their own command FIFO.
pub const CHANNEL_COUNT: usize = 14;

/// Default capacity of a channel's gather queue, in gathers.
pub const GATHER_QUEUE_SIZE: usize = 0x200;

/// Align a value up to the given power-of-two alignment.
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    let mask = alignment - 1;
    (value + mask) & !mask
}

/// Align a value down to the given power-of-two alignment.
#[inline]
pub const fn align_down(value: u64, alignment: u64) -> u64 {
    value & !(alignment - 1)
}

/// Check if a value is a multiple of the given power-of-two alignment.
#[inline]
pub const fn is_aligned(value: u64, alignment: u64) -> bool {
    value & (alignment - 1) == 0
}

/// Check if a value is aligned to the GPU page size.
#[inline]
pub const fn is_gpu_page_aligned(value: u64) -> bool {
    is_aligned(value, GPU_PAGE_SIZE)
}
