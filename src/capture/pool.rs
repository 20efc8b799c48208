//! Fixed pool of memfd-backed frame buffers.
//!
//! Channels that do not hand out kernel buffers directly copy each frame into
//! one of these slots, so every buffer keeps a stable descriptor identity for
//! the lifetime of the stream.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;

use memmap2::MmapMut;
use nix::errno::Errno;
use tracing::debug;

use crate::capture::frame::BufferId;
use crate::error::{Error, Result};

struct PoolSlot {
    fd: Arc<OwnedFd>,
    map: MmapMut,
}

pub struct BufferPool {
    slots: Vec<PoolSlot>,
    capacity: usize,
}

impl BufferPool {
    /// Allocate `count` buffers of at least `frame_size` bytes each, rounded
    /// up to the page size.
    pub fn new(name: &str, count: usize, frame_size: usize) -> Result<Self> {
        if count == 0 || frame_size == 0 {
            return Err(Error::InvalidConfig(format!(
                "buffer pool needs a non-zero count and size (count={count}, size={frame_size})"
            )));
        }
        let page = page_size::get();
        let capacity = frame_size.div_ceil(page) * page;

        let slots = (0..count)
            .map(|i| -> Result<PoolSlot> {
                let file = memfd(&format!("{name}-{i}"))?;
                file.set_len(capacity as u64)?;
                // SAFETY: the memfd is private to this pool and never truncated
                // after mapping.
                let map = unsafe { MmapMut::map_mut(&file)? };
                Ok(PoolSlot {
                    fd: Arc::new(OwnedFd::from(file)),
                    map,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(count, capacity, "Allocated frame buffer pool {}", name);
        Ok(Self { slots, capacity })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Usable bytes per slot
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn fd(&self, slot: usize) -> Arc<OwnedFd> {
        Arc::clone(&self.slots[slot].fd)
    }

    pub fn slot_mut(&mut self, slot: usize) -> &mut [u8] {
        &mut self.slots[slot].map[..]
    }

    pub fn slot(&self, slot: usize) -> &[u8] {
        &self.slots[slot].map[..]
    }

    /// Slot index owning the buffer identity, if it belongs to this pool.
    pub fn slot_of(&self, id: BufferId) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.fd.as_raw_fd() == id.0)
    }
}

/// A single anonymous shared region of `size` bytes with a writable mapping.
pub(crate) fn shared_region(name: &str, size: usize) -> Result<(File, MmapMut)> {
    let file = memfd(name)?;
    file.set_len(size.max(1) as u64)?;
    // SAFETY: the memfd was just created and is never truncated after mapping.
    let map = unsafe { MmapMut::map_mut(&file)? };
    Ok((file, map))
}

fn memfd(name: &str) -> Result<File> {
    let name = CString::new(name)
        .map_err(|e| Error::InvalidConfig(format!("invalid buffer name: {e}")))?;
    // SAFETY: `name` is a valid NUL-terminated string for the duration of the call.
    let raw = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if raw < 0 {
        return Err(io::Error::from(Errno::last()).into());
    }
    // SAFETY: memfd_create returned a fresh descriptor we now own.
    Ok(unsafe { File::from_raw_fd(raw) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_page_aligned_and_distinct() {
        let mut pool = BufferPool::new("test-pool", 3, 100).unwrap();
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.capacity() % page_size::get(), 0);

        pool.slot_mut(1)[0] = 0xAB;
        assert_eq!(pool.slot(1)[0], 0xAB);
        assert_eq!(pool.slot(0)[0], 0);

        let id = BufferId(pool.fd(2).as_raw_fd());
        assert_eq!(pool.slot_of(id), Some(2));
        assert_eq!(pool.slot_of(BufferId(-1)), None);
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert!(BufferPool::new("empty", 0, 100).is_err());
    }
}
