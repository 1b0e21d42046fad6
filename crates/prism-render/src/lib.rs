// SPDX-License-Identifier: CEPL-1.0
use anyhow::{ensure, Result};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::path::PathBuf;
use std::time::Duration;

/// Frames the CPU may record ahead of the GPU unless configured otherwise.
pub const DEFAULT_FRAMES_IN_FLIGHT: usize = 2;
pub const MAX_FRAMES_IN_FLIGHT: usize = 4;
/// Largest texture edge every Vulkan 1.0 device accepts (`maxImageDimension2D`).
pub const MAX_TEXTURE_SIZE: u32 = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PresentPreference {
    #[default]
    Mailbox, // non-blocking, no tearing
    Fifo,      // vsync, always available
    Immediate, // may tear
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RecordMode {
    /// Re-record the acquired image's command buffer every frame.
    #[default]
    PerFrame,
    /// Record every command buffer once when the swap chain is built.
    Prerecorded,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RenderSettings {
    pub clear_color: [f32; 4],
    pub frames_in_flight: usize,
    pub present: PresentPreference,
    /// Fail instead of falling back to FIFO when `present` is unavailable.
    pub strict_present_mode: bool,
    pub acquire_timeout: Duration,
    pub record_mode: RecordMode,
    /// Directory holding `quad.vert.spv` / `quad.frag.spv`; embedded SPIR-V when `None`.
    pub shader_dir: Option<PathBuf>,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            clear_color: [0.02, 0.02, 0.04, 1.0],
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            present: PresentPreference::Mailbox,
            strict_present_mode: false,
            acquire_timeout: Duration::from_secs(1),
            record_mode: RecordMode::PerFrame,
            shader_dir: None,
        }
    }
}

impl RenderSettings {
    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight.clamp(1, MAX_FRAMES_IN_FLIGHT)
    }
}

/// Tightly packed RGBA8 pixels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl TextureData {
    pub fn new(width: u32, height: u32, rgba: Vec<u8>) -> Result<Self> {
        ensure!(width > 0 && height > 0, "texture must not be empty ({width}x{height})");
        ensure!(
            width <= MAX_TEXTURE_SIZE && height <= MAX_TEXTURE_SIZE,
            "texture {width}x{height} exceeds {MAX_TEXTURE_SIZE}x{MAX_TEXTURE_SIZE}"
        );
        let expected = width as usize * height as usize * 4;
        ensure!(
            rgba.len() == expected,
            "texture {width}x{height} needs {expected} bytes, got {}",
            rgba.len()
        );
        Ok(Self { width, height, rgba })
    }

    /// `size` is clamped to `1..=MAX_TEXTURE_SIZE`.
    pub fn checkerboard(size: u32, cell: u32) -> Self {
        let size = size.clamp(1, MAX_TEXTURE_SIZE);
        let cell = cell.max(1);
        let mut rgba = Vec::with_capacity(size as usize * size as usize * 4);
        for y in 0..size {
            for x in 0..size {
                let light = ((x / cell) + (y / cell)) % 2 == 0;
                let v = if light { 0xe0 } else { 0x30 };
                rgba.extend_from_slice(&[v, v, v, 0xff]);
            }
        }
        Self {
            width: size,
            height: size,
            rgba,
        }
    }

    pub fn byte_len(&self) -> usize {
        self.rgba.len()
    }
}

/// Per-frame values the app hands to the renderer.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FrameInput {
    pub seconds: f32,
    /// Pointer in NDC while it is inside the window.
    pub pointer: Option<[f32; 2]>,
    /// Bit `i` set = draw batch `i` is hidden.
    pub hidden_batches: u32,
}

impl FrameInput {
    pub fn batch_visible(&self, index: usize) -> bool {
        index >= 32 || self.hidden_batches & (1 << index) == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented,
    /// Nothing was submitted (minimized, zero extent, acquire timeout).
    Skipped,
}

pub trait Renderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        settings: &RenderSettings,
        texture: &TextureData,
    ) -> Result<Self>
    where
        Self: Sized;

    fn resize(&mut self, size: RenderSize) -> Result<()>;
    fn set_minimized(&mut self, minimized: bool);
    fn render(&mut self, input: &FrameInput) -> Result<FrameOutcome>;
    fn set_clear_color(&mut self, rgba: [f32; 4]);
    /// Block until the GPU has finished everything submitted so far.
    fn shutdown(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_size_is_empty() {
        assert!(RenderSize { width: 0, height: 10 }.is_empty());
        assert!(RenderSize { width: 10, height: 0 }.is_empty());
        assert!(!RenderSize { width: 1, height: 1 }.is_empty());
    }

    #[test]
    fn test_frames_in_flight_is_clamped() {
        let mut s = RenderSettings::default();
        assert_eq!(s.frames_in_flight(), 2);
        s.frames_in_flight = 0;
        assert_eq!(s.frames_in_flight(), 1);
        s.frames_in_flight = 99;
        assert_eq!(s.frames_in_flight(), MAX_FRAMES_IN_FLIGHT);
    }

    #[test]
    fn test_checkerboard_layout() {
        let t = TextureData::checkerboard(4, 2);
        assert_eq!(t.byte_len(), 4 * 4 * 4);
        // (0,0) light, (2,0) dark, (2,2) light
        assert_eq!(t.rgba[0], 0xe0);
        assert_eq!(t.rgba[2 * 4], 0x30);
        assert_eq!(t.rgba[(2 * 4 + 2) * 4], 0xe0);
        assert_eq!(t.rgba[3], 0xff);
    }

    #[test]
    fn test_texture_new_checks_length() {
        assert!(TextureData::new(2, 2, vec![0; 16]).is_ok());
        assert!(TextureData::new(2, 2, vec![0; 15]).is_err());
        assert!(TextureData::new(0, 2, vec![]).is_err());
        let wide = MAX_TEXTURE_SIZE + 1;
        assert!(TextureData::new(wide, 1, vec![0; wide as usize * 4]).is_err());
    }

    #[test]
    fn test_hidden_batches_mask() {
        let input = FrameInput {
            hidden_batches: 0b10,
            ..Default::default()
        };
        assert!(input.batch_visible(0));
        assert!(!input.batch_visible(1));
        assert!(input.batch_visible(40));
    }
}
