// SPDX-FileCopyrightText: 2025 t210 contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::time::Duration;

use crate::types::{
    is_gpu_page_aligned, GpuVAddr, CHANNEL_COUNT, GATHER_QUEUE_SIZE, GPU_ADDRESS_SPACE_BASE,
    GPU_ADDRESS_SPACE_SIZE,
};

/// Emulation core settings, populated from the config INI.
#[derive(Debug, Clone)]
pub struct Settings {
    // Host1x
    pub channel_count: usize,
    pub gather_queue_size: usize,

    // Gmmu
    pub gmmu_base: GpuVAddr,
    pub gmmu_size: u64,

    // Debugging
    pub log_filter: String,
    /// Fence wait timeout in milliseconds, negative for no timeout.
    pub fence_timeout_ms: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            channel_count: CHANNEL_COUNT,
            gather_queue_size: GATHER_QUEUE_SIZE,
            gmmu_base: GPU_ADDRESS_SPACE_BASE,
            gmmu_size: GPU_ADDRESS_SPACE_SIZE,
            log_filter: "info".to_string(),
            fence_timeout_ms: -1,
        }
    }
}

impl Settings {
    /// The fence wait timeout, `None` meaning wait forever.
    pub fn fence_timeout(&self) -> Option<Duration> {
        if self.fence_timeout_ms < 0 {
            None
        } else {
            Some(Duration::from_millis(self.fence_timeout_ms as u64))
        }
    }

    /// Clamp values that would make the core unusable back to defaults.
    pub fn sanitize(&mut self) {
        if self.channel_count == 0 || self.channel_count > CHANNEL_COUNT {
            log::warn!(
                "settings: channel_count {} out of range, using {}",
                self.channel_count,
                CHANNEL_COUNT
            );
            self.channel_count = CHANNEL_COUNT;
        }
        if self.gather_queue_size == 0 {
            log::warn!("settings: gather_queue_size must be non-zero, using {}", GATHER_QUEUE_SIZE);
            self.gather_queue_size = GATHER_QUEUE_SIZE;
        }
        if self.gmmu_base == 0 || !is_gpu_page_aligned(self.gmmu_base) {
            log::warn!(
                "settings: gmmu_base 0x{:X} must be non-zero and page aligned, using 0x{:X}",
                self.gmmu_base,
                GPU_ADDRESS_SPACE_BASE
            );
            self.gmmu_base = GPU_ADDRESS_SPACE_BASE;
        }
        if self.gmmu_size == 0
            || !is_gpu_page_aligned(self.gmmu_size)
            || self.gmmu_base.checked_add(self.gmmu_size).is_none()
        {
            log::warn!(
                "settings: gmmu_size 0x{:X} is unusable, using 0x{:X}",
                self.gmmu_size,
                GPU_ADDRESS_SPACE_SIZE
            );
            self.gmmu_size = GPU_ADDRESS_SPACE_SIZE;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.channel_count, 14);
        assert_eq!(s.gmmu_base, 0x10_0000);
        assert_eq!(s.gmmu_size, 1 << 40);
        assert_eq!(s.fence_timeout(), None);
    }

    #[test]
    fn test_fence_timeout() {
        let s = Settings {
            fence_timeout_ms: 250,
            ..Settings::default()
        };
        assert_eq!(s.fence_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_sanitize() {
        let mut s = Settings {
            channel_count: 0,
            gather_queue_size: 0,
            gmmu_base: 0,
            gmmu_size: 0x1234,
            ..Settings::default()
        };
        s.sanitize();
        assert_eq!(s.channel_count, CHANNEL_COUNT);
        assert_eq!(s.gather_queue_size, GATHER_QUEUE_SIZE);
        assert_eq!(s.gmmu_base, GPU_ADDRESS_SPACE_BASE);
        assert_eq!(s.gmmu_size, GPU_ADDRESS_SPACE_SIZE);

        let mut s = Settings {
            gmmu_base: 0x12_3000,
            ..Settings::default()
        };
        s.sanitize();
        assert_eq!(s.gmmu_base, GPU_ADDRESS_SPACE_BASE);
    }
}
