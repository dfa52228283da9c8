// SPDX-FileCopyrightText: 2025 t210 contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Pushbuffer files and the guest memory they are replayed from.

use std::path::Path;
use std::ptr::NonNull;

use anyhow::{bail, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use memmap2::MmapMut;
use t210_common::align_up;
use t210_nvdrv::CommandBuffer;
use t210_soc::{GraphicsMemoryManager, HostSlice};

/// Read a file of little-endian command words.
pub fn load_pushbuffer(path: &Path) -> Result<Vec<u32>> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read pushbuffer {}", path.display()))?;
    if bytes.is_empty() {
        bail!("Pushbuffer {} is empty", path.display());
    }
    if bytes.len() % 4 != 0 {
        bail!(
            "Pushbuffer {} is {} bytes, not a whole number of words",
            path.display(),
            bytes.len()
        );
    }

    let mut words = vec![0u32; bytes.len() / 4];
    LittleEndian::read_u32_into(&bytes, &mut words);
    Ok(words)
}

/// Anonymous host memory mapped into the GPU address space.
///
/// Must outlive the GMMU mapping; call [`GuestBuffer::unmap`] before dropping
/// it while the GMMU is still in use.
pub struct GuestBuffer {
    memory: MmapMut,
    gpu_va: u64,
    words: u32,
}

impl GuestBuffer {
    /// Copy `words` into fresh host memory and map it into `gmmu`.
    pub fn upload(gmmu: &GraphicsMemoryManager, words: &[u32]) -> Result<Self> {
        let byte_len = words.len() as u64 * 4;
        let mapped_len = align_up(byte_len, gmmu.page_size());
        let mut memory = MmapMut::map_anon(mapped_len as usize)
            .context("Failed to allocate pushbuffer memory")?;

        let ptr = NonNull::new(memory.as_mut_ptr()).context("Anonymous mapping returned null")?;
        // SAFETY: the mapping is owned by the returned GuestBuffer, which
        // unmaps it from the GMMU before the memory goes away.
        let host = unsafe { HostSlice::from_raw_parts(ptr, memory.len()) };
        let gpu_va = gmmu
            .map_allocate(host, mapped_len)
            .context("Failed to map pushbuffer into the GPU address space")?;
        gmmu.write_words(words, gpu_va)
            .context("Failed to write pushbuffer into GPU memory")?;

        Ok(Self {
            memory,
            gpu_va,
            words: words.len() as u32,
        })
    }

    pub fn command_buffer(&self) -> CommandBuffer {
        CommandBuffer {
            gpu_va: self.gpu_va,
            words: self.words,
        }
    }

    pub fn unmap(self, gmmu: &GraphicsMemoryManager) {
        if !gmmu.unmap(self.gpu_va, self.memory.len() as u64) {
            log::warn!("Failed to unmap pushbuffer at 0x{:X}", self.gpu_va);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;
    use t210_soc::GuestProcess;

    #[test]
    fn test_load_pushbuffer() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0x0C, 0x00, 0x00, 0x40, 0x01, 0x02, 0x03, 0x04])
            .unwrap();
        let words = load_pushbuffer(file.path()).unwrap();
        assert_eq!(words, vec![0x4000_000C, 0x0403_0201]);
    }

    #[test]
    fn test_load_pushbuffer_rejects_partial_words() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[1, 2, 3]).unwrap();
        assert!(load_pushbuffer(file.path()).is_err());

        let empty = tempfile::NamedTempFile::new().unwrap();
        assert!(load_pushbuffer(empty.path()).is_err());
    }

    #[test]
    fn test_upload_round_trip() {
        let gmmu = GraphicsMemoryManager::with_defaults(Arc::new(GuestProcess::new()));
        let words = [0x4000_000C, 0xDEAD_BEEF, 7];
        let buffer = GuestBuffer::upload(&gmmu, &words).unwrap();

        let cmd_buf = buffer.command_buffer();
        assert_eq!(cmd_buf.words, 3);
        let mut read_back = [0u32; 3];
        gmmu.read_words(&mut read_back, cmd_buf.gpu_va).unwrap();
        assert_eq!(read_back, words);

        buffer.unmap(&gmmu);
        assert!(gmmu.read_words(&mut read_back, cmd_buf.gpu_va).is_err());
    }
}
