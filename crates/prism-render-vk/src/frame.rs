// SPDX-License-Identifier: CEPL-1.0
//! Frame loop: throttle, acquire, image guard, update, record, submit,
//! present. Generic over [`FrameBackend`] so the ordering rules can be
//! checked without a GPU.

use anyhow::Result;
use prism_render::{FrameInput, FrameOutcome, RecordMode, RenderSize};
use tracing::{debug, info, warn};

use crate::error::FatalError;
use crate::swapchain::{ChainManager, ChainState};
use crate::sync::ImageOwners;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquired {
    Image(usize),
    /// Out of date or suboptimal. Nothing is left pending on the frame slot:
    /// its fence is signaled and its image-available semaphore unsignaled.
    Stale,
    TimedOut,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presented {
    Shown,
    Stale,
}

/// GPU-side operations the loop sequences. `slot` is a frame-in-flight
/// index in `0..frames_in_flight`, `image` a swap-chain image index.
pub trait FrameBackend {
    type Chain;

    /// `Ok(None)` when the surface has a zero extent.
    fn build_chain(&mut self, old: Option<&Self::Chain>, generation: u64) -> Result<Option<Self::Chain>>;
    /// Only called after [`FrameBackend::wait_idle`].
    fn destroy_chain(&mut self, chain: Self::Chain);
    fn image_count(&self, chain: &Self::Chain) -> usize;

    fn wait_fence(&mut self, slot: usize) -> Result<()>;
    fn acquire(&mut self, chain: &Self::Chain, slot: usize) -> Result<Acquired>;
    fn update(&mut self, chain: &mut Self::Chain, image: usize, input: &FrameInput) -> Result<()>;
    fn record(&mut self, chain: &mut Self::Chain, image: usize, input: &FrameInput) -> Result<()>;
    /// Resets the slot's fence, then submits.
    fn submit(&mut self, chain: &Self::Chain, slot: usize, image: usize) -> Result<()>;
    fn present(&mut self, chain: &Self::Chain, slot: usize, image: usize) -> Result<Presented>;
    fn wait_idle(&mut self) -> Result<()>;
}

pub struct FrameLoop<B: FrameBackend> {
    backend: B,
    chains: ChainManager<B::Chain>,
    owners: ImageOwners,
    frames_in_flight: usize,
    current_frame: usize,
    record_mode: RecordMode,
    minimized: bool,
}

impl<B: FrameBackend> FrameLoop<B> {
    pub fn new(backend: B, frames_in_flight: usize, record_mode: RecordMode) -> Self {
        Self {
            backend,
            chains: ChainManager::new(),
            owners: ImageOwners::default(),
            frames_in_flight: frames_in_flight.max(1),
            current_frame: 0,
            record_mode,
            minimized: false,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn state(&self) -> ChainState {
        self.chains.state()
    }

    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    pub fn set_minimized(&mut self, minimized: bool) {
        if self.minimized != minimized {
            debug!("minimized = {minimized}");
        }
        self.minimized = minimized;
    }

    /// Geometry changed: the next frame rebuilds before acquiring. A zero
    /// area skips frames until a later resize brings it back, whatever
    /// minimized state the loop was in before.
    pub fn notify_resized(&mut self, size: RenderSize) {
        self.set_minimized(size.is_empty());
        self.request_rebuild("resize");
    }

    pub fn request_rebuild(&mut self, reason: &str) {
        if self.chains.mark_stale() {
            debug!("{reason}: swap chain marked stale");
        }
    }

    /// One iteration. Transient staleness is handled here; any `Err` is fatal.
    pub fn draw_frame(&mut self, input: &FrameInput) -> Result<FrameOutcome> {
        if self.minimized {
            return Ok(FrameOutcome::Skipped);
        }
        if self.chains.state() == ChainState::Destroyed {
            return Err(FatalError::NoLiveSwapchain.into());
        }
        if self.chains.needs_rebuild() && !self.rebuild()? {
            return Ok(FrameOutcome::Skipped);
        }

        let slot = self.current_frame;

        // 1. throttle
        self.backend.wait_fence(slot)?;

        // 2. acquire (rebuild + one retry on stale)
        let Some(image) = self.acquire(slot)? else {
            return Ok(FrameOutcome::Skipped);
        };

        // 3. image guard
        if let Some(owner) = self.owners.blocking_owner(image, slot) {
            self.backend.wait_fence(owner)?;
        }
        self.owners.assign(image, slot);

        let chain = self
            .chains
            .live_mut()
            .ok_or(FatalError::NoLiveSwapchain)?;

        // 4-5. per-frame data and commands
        self.backend.update(chain, image, input)?;
        if self.record_mode == RecordMode::PerFrame {
            self.backend.record(chain, image, input)?;
        }

        // 6. submit
        self.backend.submit(chain, slot, image)?;

        // 7. present
        if self.backend.present(chain, slot, image)? == Presented::Stale {
            info!("present reported a stale swap chain, rebuilding next frame");
            self.chains.mark_stale();
        }

        // 8. advance
        self.current_frame = (self.current_frame + 1) % self.frames_in_flight;
        Ok(FrameOutcome::Presented)
    }

    fn acquire(&mut self, slot: usize) -> Result<Option<usize>> {
        let chain = self.chains.live().ok_or(FatalError::NoLiveSwapchain)?;
        match self.backend.acquire(chain, slot)? {
            Acquired::Image(i) => return Ok(Some(i)),
            Acquired::TimedOut => {
                debug!("acquire timed out, skipping frame");
                return Ok(None);
            }
            Acquired::Stale => {}
        }

        info!("acquire reported a stale swap chain, rebuilding");
        self.chains.mark_stale();
        if !self.rebuild()? {
            return Ok(None);
        }

        let chain = self.chains.live().ok_or(FatalError::NoLiveSwapchain)?;
        match self.backend.acquire(chain, slot)? {
            Acquired::Image(i) => Ok(Some(i)),
            Acquired::TimedOut => Ok(None),
            Acquired::Stale => Err(FatalError::StaleAfterRebuild.into()),
        }
    }

    /// Builds a new chain, installs it as live, then retires the old one once
    /// the device is idle. `Ok(false)` when the surface has no area.
    pub fn rebuild(&mut self) -> Result<bool> {
        if !self.chains.begin_rebuild() {
            return Ok(self.chains.state() == ChainState::Live);
        }
        let generation = self.chains.generation() + 1;
        let Some(chain) = self
            .backend
            .build_chain(self.chains.current(), generation)?
        else {
            self.chains.defer_rebuild();
            return Ok(false);
        };

        let images = self.backend.image_count(&chain);
        if let Some(old) = self.chains.install(chain) {
            self.backend.wait_idle()?;
            self.backend.destroy_chain(old);
        }
        // every fence that owned an old image has retired by now
        self.owners.reset(images);
        Ok(true)
    }

    /// Drain the queue, then destroy the live chain. Idempotent.
    pub fn shutdown(&mut self) -> Result<()> {
        self.backend.wait_idle()?;
        if let Some(chain) = self.chains.retire() {
            self.backend.destroy_chain(chain);
            info!("swap chain torn down");
        }
        Ok(())
    }
}

impl<B: FrameBackend> Drop for FrameLoop<B> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("frame loop shutdown: {e:#}");
        }
    }
}
