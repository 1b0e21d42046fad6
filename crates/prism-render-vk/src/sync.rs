// SPDX-License-Identifier: CEPL-1.0
//! Frame synchronization set: per frame slot {image-available,
//! render-finished, in-flight fence}, plus the per-image owner table.

use anyhow::{Context, Result};
use ash::vk;

pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight: vk::Fence,
}

/// Fixed at `frames_in_flight` entries; not touched by swap-chain rebuilds.
pub struct FrameSyncSet {
    frames: Vec<FrameSync>,
}

impl FrameSyncSet {
    /// Fences start signaled so the first wait on each slot returns at once.
    pub unsafe fn new(device: &ash::Device, frames_in_flight: usize) -> Result<Self> {
        let sem_ci = vk::SemaphoreCreateInfo::default();
        let fence_ci = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: vk::FenceCreateFlags::SIGNALED,
            ..Default::default()
        };
        let mut set = Self {
            frames: Vec::with_capacity(frames_in_flight),
        };
        for _ in 0..frames_in_flight {
            let frame = (|| -> Result<FrameSync> {
                Ok(FrameSync {
                    image_available: device
                        .create_semaphore(&sem_ci, None)
                        .context("create_semaphore(image_available)")?,
                    render_finished: device
                        .create_semaphore(&sem_ci, None)
                        .context("create_semaphore(render_finished)")?,
                    in_flight: device
                        .create_fence(&fence_ci, None)
                        .context("create_fence(in_flight)")?,
                })
            })();
            match frame {
                Ok(f) => set.frames.push(f),
                Err(e) => {
                    set.destroy(device);
                    return Err(e);
                }
            }
        }
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn get(&self, slot: usize) -> &FrameSync {
        &self.frames[slot]
    }

    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for f in self.frames.drain(..) {
            device.destroy_fence(f.in_flight, None);
            device.destroy_semaphore(f.render_finished, None);
            device.destroy_semaphore(f.image_available, None);
        }
    }
}

/// Which frame slot's fence last submitted work into each swap-chain image.
/// Sized by image count, not frames in flight.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageOwners {
    owners: Vec<Option<usize>>,
}

impl ImageOwners {
    pub fn new(image_count: usize) -> Self {
        Self {
            owners: vec![None; image_count],
        }
    }

    /// Forget every owner. Only valid once the device is idle.
    pub fn reset(&mut self, image_count: usize) {
        self.owners.clear();
        self.owners.resize(image_count, None);
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn owner(&self, image: usize) -> Option<usize> {
        self.owners.get(image).copied().flatten()
    }

    /// The slot whose fence must be waited before `slot` may use `image`.
    /// `None` when unowned or already owned by `slot` (whose fence the
    /// throttle step has waited on).
    pub fn blocking_owner(&self, image: usize, slot: usize) -> Option<usize> {
        self.owner(image).filter(|&owner| owner != slot)
    }

    pub fn assign(&mut self, image: usize, slot: usize) {
        if let Some(o) = self.owners.get_mut(image) {
            *o = Some(slot);
        }
    }
}
