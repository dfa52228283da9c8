// SPDX-FileCopyrightText: 2025 t210 contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Driver-side syncpoint allocation.
//!
//! Keeps a cached `[min, max]` window per hardware syncpoint: `max` is the
//! value the syncpoint will reach once all submitted work completes, `min` is
//! the value it had when last synchronised with Host1x.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use t210_common::SyncpointId;
use t210_soc::host1x::syncpoint::syncpoint_reached;
use t210_soc::host1x::SyncpointSet;

use crate::error::{NvdrvError, NvdrvResult};
use crate::fence::Fence;

/// Host1x client types, each with its own channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ChannelType {
    MsEnc = 0,
    Vic = 1,
    Gpu = 2,
    NvDec = 3,
    Display = 4,
    NvJpg = 5,
    TSec = 6,
}

impl ChannelType {
    pub const ALL: [ChannelType; 7] = [
        Self::MsEnc,
        Self::Vic,
        Self::Gpu,
        Self::NvDec,
        Self::Display,
        Self::NvJpg,
        Self::TSec,
    ];

    pub fn from_raw(v: u32) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }

    /// Constant syncpoint owned by this channel. GPU syncpoints are
    /// allocated per channel instead; the rest are unimplemented.
    pub fn syncpoint(self) -> Option<SyncpointId> {
        match self {
            Self::Vic => Some(0xC),
            Self::NvDec => Some(0x36),
            Self::NvJpg => Some(0x37),
            _ => None,
        }
    }

    /// Index of the Host1x channel serving this client.
    pub fn channel_index(self) -> usize {
        self as usize
    }
}

/// Vblank syncpoints run in continuous mode, so the display interface owns
/// their counters.
const VBLANK0_SYNCPOINT_ID: SyncpointId = 26;
const VBLANK1_SYNCPOINT_ID: SyncpointId = 27;

#[derive(Default)]
struct SyncpointInfo {
    counter_min: AtomicU32,
    counter_max: AtomicU32,
    interface_managed: AtomicBool,
    reserved: AtomicBool,
}

pub struct SyncpointManager {
    syncpoints: Arc<SyncpointSet>,
    infos: Box<[SyncpointInfo]>,
    reservation_lock: Mutex<()>,
}

impl SyncpointManager {
    pub fn new(syncpoints: Arc<SyncpointSet>) -> NvdrvResult<Self> {
        let infos = (0..syncpoints.len())
            .map(|_| SyncpointInfo::default())
            .collect();
        let manager = Self {
            syncpoints,
            infos,
            reservation_lock: Mutex::new(()),
        };

        {
            let _guard = manager.reservation_lock.lock();
            manager.reserve_syncpoint(VBLANK0_SYNCPOINT_ID, true)?;
            manager.reserve_syncpoint(VBLANK1_SYNCPOINT_ID, true)?;
            for id in ChannelType::ALL.iter().filter_map(|c| c.syncpoint()) {
                manager.reserve_syncpoint(id, false)?;
            }
        }

        Ok(manager)
    }

    fn info(&self, id: SyncpointId) -> NvdrvResult<&SyncpointInfo> {
        self.infos
            .get(id as usize)
            .ok_or(NvdrvError::InvalidSyncpoint(id))
    }

    fn reserved_info(&self, id: SyncpointId) -> NvdrvResult<&SyncpointInfo> {
        let info = self.info(id)?;
        if !info.reserved.load(Ordering::Acquire) {
            return Err(NvdrvError::UnreservedSyncpoint(id));
        }
        Ok(info)
    }

    /// Caller holds `reservation_lock`.
    fn reserve_syncpoint(&self, id: SyncpointId, client_managed: bool) -> NvdrvResult<SyncpointId> {
        let info = self.info(id)?;
        if info.reserved.load(Ordering::Acquire) {
            return Err(NvdrvError::SyncpointInUse(id));
        }
        info.interface_managed.store(client_managed, Ordering::Release);
        info.reserved.store(true, Ordering::Release);
        log::debug!("Reserved syncpoint {} (client managed: {})", id, client_managed);
        Ok(id)
    }

    /// Syncpoint 0 is never handed out.
    fn find_free_syncpoint(&self) -> NvdrvResult<SyncpointId> {
        (1..self.infos.len())
            .find(|&i| !self.infos[i].reserved.load(Ordering::Acquire))
            .map(|i| i as SyncpointId)
            .ok_or(NvdrvError::NoFreeSyncpoint)
    }

    pub fn allocate_syncpoint(&self, client_managed: bool) -> NvdrvResult<SyncpointId> {
        let _guard = self.reservation_lock.lock();
        let id = self.find_free_syncpoint()?;
        self.reserve_syncpoint(id, client_managed)
    }

    pub fn is_syncpoint_allocated(&self, id: SyncpointId) -> bool {
        self.infos
            .get(id as usize)
            .is_some_and(|info| info.reserved.load(Ordering::Acquire))
    }

    pub fn has_syncpoint_expired(&self, id: SyncpointId, threshold: u32) -> NvdrvResult<bool> {
        let info = self.reserved_info(id)?;
        let min = info.counter_min.load(Ordering::Acquire);

        // Interface-managed counters have no tracked maximum.
        if info.interface_managed.load(Ordering::Acquire) {
            Ok(syncpoint_reached(min, threshold))
        } else {
            let max = info.counter_max.load(Ordering::Acquire);
            Ok(max.wrapping_sub(threshold) >= min.wrapping_sub(threshold))
        }
    }

    pub fn is_fence_signalled(&self, fence: Fence) -> NvdrvResult<bool> {
        self.has_syncpoint_expired(fence.id, fence.threshold)
    }

    /// Raise the expected maximum by `amount`, returning the new maximum.
    pub fn increment_syncpoint_max_ext(&self, id: SyncpointId, amount: u32) -> NvdrvResult<u32> {
        let info = self.reserved_info(id)?;
        Ok(info
            .counter_max
            .fetch_add(amount, Ordering::AcqRel)
            .wrapping_add(amount))
    }

    pub fn read_syncpoint_min_value(&self, id: SyncpointId) -> NvdrvResult<u32> {
        Ok(self.reserved_info(id)?.counter_min.load(Ordering::Acquire))
    }

    /// Resynchronise the cached minimum with the host syncpoint.
    pub fn update_min(&self, id: SyncpointId) -> NvdrvResult<u32> {
        let info = self.reserved_info(id)?;
        let value = self
            .syncpoints
            .get(id)
            .ok_or(NvdrvError::InvalidSyncpoint(id))?
            .host
            .load();
        info.counter_min.store(value, Ordering::Release);
        Ok(value)
    }

    /// Fence that signals once the syncpoint reaches its current maximum.
    pub fn get_syncpoint_fence(&self, id: SyncpointId) -> NvdrvResult<Fence> {
        let info = self.reserved_info(id)?;
        Ok(Fence::new(id, info.counter_max.load(Ordering::Acquire)))
    }

    /// Block until `fence` signals or `timeout` passes (`None` waits forever).
    pub fn wait_fence(&self, fence: Fence, timeout: Option<Duration>) -> NvdrvResult<bool> {
        if self.is_fence_signalled(fence)? {
            return Ok(true);
        }

        let syncpoint = self
            .syncpoints
            .get(fence.id)
            .ok_or(NvdrvError::InvalidSyncpoint(fence.id))?;
        log::debug!(
            "Waiting on fence: syncpoint {}, threshold {}",
            fence.id,
            fence.threshold
        );
        let reached = syncpoint.host.wait(fence.threshold, timeout);
        self.update_min(fence.id)?;
        Ok(reached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn manager() -> (SyncpointManager, Arc<SyncpointSet>) {
        let syncpoints = Arc::new(SyncpointSet::new());
        (SyncpointManager::new(syncpoints.clone()).unwrap(), syncpoints)
    }

    #[test]
    fn test_initial_reservations() {
        let (manager, _) = manager();
        for id in [26, 27, 0xC, 0x36, 0x37] {
            assert!(manager.is_syncpoint_allocated(id), "syncpoint {id}");
        }
        assert!(!manager.is_syncpoint_allocated(0));
        assert!(!manager.is_syncpoint_allocated(1));
        assert!(!manager.is_syncpoint_allocated(192));
    }

    #[test]
    fn test_channel_syncpoints() {
        assert_eq!(ChannelType::Vic.syncpoint(), Some(0xC));
        assert_eq!(ChannelType::NvDec.syncpoint(), Some(0x36));
        assert_eq!(ChannelType::NvJpg.syncpoint(), Some(0x37));
        assert_eq!(ChannelType::Gpu.syncpoint(), None);
        assert_eq!(ChannelType::from_raw(3), Some(ChannelType::NvDec));
        assert_eq!(ChannelType::from_raw(7), None);
    }

    #[test]
    fn test_allocate_first_free() {
        let (manager, _) = manager();
        assert_eq!(manager.allocate_syncpoint(false).unwrap(), 1);
        assert_eq!(manager.allocate_syncpoint(true).unwrap(), 2);
        assert!(manager.is_syncpoint_allocated(2));
    }

    #[test]
    fn test_allocate_skips_reserved_and_exhausts() {
        let (manager, _) = manager();
        let ids: Vec<_> = (0..186)
            .map(|_| manager.allocate_syncpoint(false).unwrap())
            .collect();
        assert!(!ids.contains(&0));
        assert!(!ids.contains(&26));
        assert!(!ids.contains(&0x36));
        assert!(matches!(
            manager.allocate_syncpoint(false),
            Err(NvdrvError::NoFreeSyncpoint)
        ));
    }

    #[test]
    fn test_unreserved_access_is_rejected() {
        let (manager, _) = manager();
        assert!(matches!(
            manager.has_syncpoint_expired(5, 0),
            Err(NvdrvError::UnreservedSyncpoint(5))
        ));
        assert!(matches!(
            manager.increment_syncpoint_max_ext(5, 1),
            Err(NvdrvError::UnreservedSyncpoint(5))
        ));
        assert!(matches!(
            manager.get_syncpoint_fence(500),
            Err(NvdrvError::InvalidSyncpoint(500))
        ));
    }

    #[test]
    fn test_expiry_tracks_min_and_max() {
        let (manager, syncpoints) = manager();
        let id = manager.allocate_syncpoint(false).unwrap();

        assert_eq!(manager.increment_syncpoint_max_ext(id, 3).unwrap(), 3);
        let fence = manager.get_syncpoint_fence(id).unwrap();
        assert_eq!(fence, Fence::new(id, 3));
        assert!(!manager.is_fence_signalled(fence).unwrap());

        for _ in 0..3 {
            syncpoints.get(id).unwrap().increment();
        }
        // Not visible until the cached minimum is refreshed.
        assert!(!manager.is_fence_signalled(fence).unwrap());
        assert_eq!(manager.update_min(id).unwrap(), 3);
        assert_eq!(manager.read_syncpoint_min_value(id).unwrap(), 3);
        assert!(manager.is_fence_signalled(fence).unwrap());

        // Thresholds beyond max are treated as already expired.
        assert!(manager.has_syncpoint_expired(id, 10).unwrap());
    }

    #[test]
    fn test_interface_managed_expiry() {
        let (manager, syncpoints) = manager();
        assert!(!manager.has_syncpoint_expired(26, 1).unwrap());
        syncpoints.get(26).unwrap().increment();
        manager.update_min(26).unwrap();
        assert!(manager.has_syncpoint_expired(26, 1).unwrap());
        assert!(!manager.has_syncpoint_expired(26, 2).unwrap());
    }

    #[test]
    fn test_wait_fence() {
        let (manager, syncpoints) = manager();
        let id = manager.allocate_syncpoint(false).unwrap();
        manager.increment_syncpoint_max_ext(id, 1).unwrap();
        let fence = manager.get_syncpoint_fence(id).unwrap();

        assert!(!manager
            .wait_fence(fence, Some(Duration::from_millis(10)))
            .unwrap());

        let incrementer = {
            let syncpoints = syncpoints.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                syncpoints.get(id).unwrap().increment();
            })
        };
        assert!(manager.wait_fence(fence, None).unwrap());
        assert_eq!(manager.read_syncpoint_min_value(id).unwrap(), 1);
        incrementer.join().unwrap();
    }
}
