//! Buffer to accelerator tensor bindings.
//!
//! Registering a memory region with the accelerator is expensive, so each
//! channel buffer is registered once and looked up by identity afterwards.
//! The table is sized to the channel's buffer count at graph build time and
//! never grows: a miss on a full table means the channel handed out more
//! distinct buffers than it announced.

use std::os::fd::{AsFd, OwnedFd};

use tracing::{debug, warn};

use crate::capture::frame::{BufferId, FrameBuffer};
use crate::error::{Error, Result};
use crate::infer::accelerator::{
    Accelerator, TensorDataType, TensorDescriptor, TensorId, TensorShape,
};

/// A buffer registered as an accelerator input tensor
#[derive(Debug)]
pub struct TensorBinding {
    pub buffer: BufferId,
    /// Our own reference to the buffer memory, kept open while registered
    pub fd: OwnedFd,
    pub offset: u64,
    pub byte_size: usize,
    pub shape: TensorShape,
    pub tensor: TensorId,
}

/// Result of a [`TensorBindingCache::bind`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bound {
    pub tensor: TensorId,
    pub hit: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BindingStats {
    pub hits: u64,
    pub misses: u64,
    pub len: usize,
    pub capacity: usize,
}

pub struct TensorBindingCache {
    slots: Box<[Option<TensorBinding>]>,
    len: usize,
    hits: u64,
    misses: u64,
}

enum Probe {
    Found(usize),
    Vacant(usize),
    Full,
}

impl TensorBindingCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            len: 0,
            hits: 0,
            misses: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn stats(&self) -> BindingStats {
        BindingStats {
            hits: self.hits,
            misses: self.misses,
            len: self.len,
            capacity: self.capacity(),
        }
    }

    pub fn get(&self, id: BufferId) -> Option<&TensorBinding> {
        match self.probe(id) {
            Probe::Found(idx) => self.slots[idx].as_ref(),
            Probe::Vacant(_) | Probe::Full => None,
        }
    }

    // Entries are never removed individually, so the first empty slot ends
    // a probe sequence.
    fn probe(&self, id: BufferId) -> Probe {
        let capacity = self.slots.len();
        let start = (id.0 as u32 as usize) % capacity;
        for i in 0..capacity {
            let idx = (start + i) % capacity;
            match &self.slots[idx] {
                Some(binding) if binding.buffer == id => return Probe::Found(idx),
                Some(_) => continue,
                None => return Probe::Vacant(idx),
            }
        }
        Probe::Full
    }

    /// Tensor for `buffer`, registering it with `accel` on first sight.
    pub fn bind<A: Accelerator + ?Sized>(
        &mut self,
        buffer: &FrameBuffer,
        accel: &mut A,
        shape: &TensorShape,
    ) -> Result<Bound> {
        let id = buffer.id();
        let idx = match self.probe(id) {
            Probe::Found(idx) => {
                if let Some(binding) = &self.slots[idx] {
                    self.hits += 1;
                    metrics::counter!("tensor_binding_hits_total").increment(1);
                    return Ok(Bound {
                        tensor: binding.tensor,
                        hit: true,
                    });
                }
                idx
            }
            Probe::Vacant(idx) => idx,
            Probe::Full => {
                return Err(Error::BindingTableFull {
                    capacity: self.capacity(),
                })
            }
        };

        let byte_size = shape.byte_size();
        if buffer.capacity < byte_size {
            return Err(Error::FormatUnsupported(format!(
                "buffer {} holds {} bytes, input layout needs {}",
                id, buffer.capacity, byte_size
            )));
        }
        let fd = buffer.fd.try_clone()?;
        let tensor = accel.register_tensor(&TensorDescriptor {
            fd: fd.as_fd(),
            offset: buffer.offset,
            byte_size,
            datatype: TensorDataType::Uint8,
            shape: *shape,
        })?;

        debug!(
            buffer = %id,
            tensor = tensor.0,
            slot = idx,
            "Registered buffer as input tensor"
        );
        self.slots[idx] = Some(TensorBinding {
            buffer: id,
            fd,
            offset: buffer.offset,
            byte_size,
            shape: *shape,
            tensor,
        });
        self.len += 1;
        self.misses += 1;
        metrics::counter!("tensor_binding_misses_total").increment(1);

        Ok(Bound { tensor, hit: false })
    }

    /// Release every tensor and close every duplicated descriptor. Returns the
    /// number of bindings dropped.
    pub fn clear<A: Accelerator + ?Sized>(&mut self, accel: &mut A) -> usize {
        let mut released = 0;
        for slot in self.slots.iter_mut() {
            if let Some(binding) = slot.take() {
                if let Err(e) = accel.release_tensor(binding.tensor) {
                    warn!("Failed to release tensor for {}: {}", binding.buffer, e);
                }
                released += 1;
            }
        }
        self.len = 0;
        released
    }
}
