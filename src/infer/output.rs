use std::os::fd::OwnedFd;
use std::time::Duration;

use memmap2::{Mmap, MmapOptions};

use crate::error::Result;
use crate::infer::accelerator::{OutputAllocation, TensorDataType, TensorId, TensorInfo};

/// Memory-mapped model output, readable after each successful inference
pub struct OutputTensor {
    pub tensor: TensorId,
    pub info: TensorInfo,
    /// Timestamp of the frame the current contents were computed from
    pub timestamp: Duration,
    pub sequence: u64,
    map: Mmap,
    _fd: OwnedFd,
}

impl OutputTensor {
    pub fn map(alloc: OutputAllocation) -> Result<Self> {
        // SAFETY: the accelerator only writes the region while a job runs,
        // and jobs run synchronously on the thread that owns this mapping.
        let map = unsafe { MmapOptions::new().len(alloc.byte_size).map(&alloc.fd)? };
        Ok(Self {
            tensor: alloc.tensor,
            info: alloc.info,
            timestamp: Duration::ZERO,
            sequence: 0,
            map,
            _fd: alloc.fd,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.map[..]
    }

    pub fn datatype(&self) -> TensorDataType {
        self.info.datatype
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Contents as native-endian `f32` values, `None` for other datatypes.
    pub fn f32_values(&self) -> Option<Vec<f32>> {
        if self.info.datatype != TensorDataType::Float32 {
            return None;
        }
        Some(
            self.map
                .chunks_exact(4)
                .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }
}

impl std::fmt::Debug for OutputTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputTensor")
            .field("tensor", &self.tensor)
            .field("datatype", &self.info.datatype)
            .field("len", &self.map.len())
            .field("sequence", &self.sequence)
            .finish()
    }
}
