// SPDX-License-Identifier: CEPL-1.0
//! Vulkan renderer: device resolution, resource allocation, pipeline
//! building, swap-chain management and the frame loop.

use anyhow::Result;
use prism_render::{
    FrameInput, FrameOutcome, RecordMode, RenderSettings, RenderSize, Renderer, TextureData,
};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::info;

pub mod backend;
pub mod context;
pub mod error;
pub mod frame;
pub mod memory;
pub mod pipeline;
pub mod scene;
pub mod swapchain;
pub mod sync;

pub use backend::VkBackend;
pub use error::FatalError;
pub use frame::{Acquired, FrameBackend, FrameLoop, Presented};
pub use swapchain::ChainState;

pub struct VkRenderer {
    // owns the backend; dropping it tears down the chain, then the device
    frames: FrameLoop<VkBackend>,
    record_mode: RecordMode,
    hidden_batches: u32,
}

impl VkRenderer {
    // Prerecorded command buffers bake the clear color and batch mask.
    fn invalidate_recorded(&mut self, reason: &str) {
        if self.record_mode == RecordMode::Prerecorded {
            self.frames.request_rebuild(reason);
        }
    }
}

impl Renderer for VkRenderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        settings: &RenderSettings,
        texture: &TextureData,
    ) -> Result<Self> {
        let backend = unsafe { VkBackend::new(window, display, size, settings, texture)? };
        let mut frames = FrameLoop::new(backend, settings.frames_in_flight(), settings.record_mode);
        if size.is_empty() {
            frames.set_minimized(true);
        } else {
            frames.rebuild()?;
        }
        info!("vk renderer up ({}x{})", size.width, size.height);
        Ok(Self {
            frames,
            record_mode: settings.record_mode,
            hidden_batches: 0,
        })
    }

    fn resize(&mut self, size: RenderSize) -> Result<()> {
        self.frames.backend_mut().set_window_extent(size);
        self.frames.notify_resized(size);
        Ok(())
    }

    fn set_minimized(&mut self, minimized: bool) {
        self.frames.set_minimized(minimized);
    }

    fn render(&mut self, input: &FrameInput) -> Result<FrameOutcome> {
        if input.hidden_batches != self.hidden_batches {
            self.hidden_batches = input.hidden_batches;
            self.frames
                .backend_mut()
                .set_hidden_batches(input.hidden_batches);
            self.invalidate_recorded("batch visibility");
        }
        self.frames.draw_frame(input)
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.frames.backend_mut().set_clear_color(rgba);
        self.invalidate_recorded("clear color");
    }

    fn shutdown(&mut self) -> Result<()> {
        self.frames.shutdown()
    }
}
