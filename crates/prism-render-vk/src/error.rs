// SPDX-License-Identifier: CEPL-1.0
//! Named unrecoverable conditions. Everything the frame loop returns as `Err`
//! is fatal; these variants let callers tell the interesting cases apart
//! (`err.downcast_ref::<FatalError>()`).

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FatalError {
    #[error("no adapter exposes a graphics+present queue family and VK_KHR_swapchain")]
    NoSuitableAdapter,

    #[error("surface reports zero formats")]
    NoSurfaceFormats,

    #[error("surface reports zero present modes")]
    NoPresentModes,

    #[error("present mode {0:?} unavailable and strict present mode is set")]
    PresentModeUnavailable(vk::PresentModeKHR),

    #[error("no memory type in {type_bits:#b} with {required:?}")]
    NoMemoryType {
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    },

    #[error("shader {path}: {source}")]
    ShaderRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("shader {path}: read {read} of {expected} bytes")]
    ShaderTruncated {
        path: PathBuf,
        read: usize,
        expected: usize,
    },

    #[error("shader {name}: {len} bytes is not a whole number of SPIR-V words")]
    ShaderMisaligned { name: String, len: usize },

    #[error("swap chain still stale after rebuild")]
    StaleAfterRebuild,

    #[error("frame requested with no live swap chain")]
    NoLiveSwapchain,
}

/// Cleanup steps for a constructor that creates several Vulkan objects in a
/// row. Each object registers its destroy step right after creation; an
/// early `?` drops the guard, which runs the steps newest-first. Call
/// [`Unwind::disarm`] once construction has succeeded.
#[derive(Default)]
pub struct Unwind<'a> {
    steps: Vec<Box<dyn FnOnce() + 'a>>,
}

impl<'a> Unwind<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: impl FnOnce() + 'a) {
        self.steps.push(Box::new(step));
    }

    /// Keep everything that was created.
    pub fn disarm(mut self) {
        self.steps.clear();
    }
}

impl Drop for Unwind<'_> {
    fn drop(&mut self) {
        if !self.steps.is_empty() {
            tracing::debug!("unwinding {} partially created objects", self.steps.len());
        }
        while let Some(step) = self.steps.pop() {
            step();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{bail, Result};
    use std::cell::RefCell;

    // Three objects, the third fails to create: the first two are destroyed
    // in reverse creation order and nothing else runs.
    fn build(log: &RefCell<Vec<&'static str>>, fail_at: Option<usize>) -> Result<()> {
        let mut unwind = Unwind::new();
        for (i, name) in ["instance", "surface", "device"].into_iter().enumerate() {
            if fail_at == Some(i) {
                bail!("create {name} failed");
            }
            log.borrow_mut().push(name);
            unwind.push(move || log.borrow_mut().push(name));
        }
        unwind.disarm();
        Ok(())
    }

    #[test]
    fn test_failed_construction_unwinds_newest_first() {
        let log = RefCell::new(Vec::new());
        assert!(build(&log, Some(2)).is_err());
        assert_eq!(
            *log.borrow(),
            vec!["instance", "surface", "surface", "instance"]
        );
    }

    #[test]
    fn test_failure_on_first_step_runs_nothing() {
        let log = RefCell::new(Vec::new());
        assert!(build(&log, Some(0)).is_err());
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_disarm_keeps_everything() {
        let log = RefCell::new(Vec::new());
        build(&log, None).unwrap();
        assert_eq!(*log.borrow(), vec!["instance", "surface", "device"]);
    }
}
