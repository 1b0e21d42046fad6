// SPDX-License-Identifier: CEPL-1.0
//! Scene controls driven by [`PlatformEvent`]s.
//!
//! `1` / `2` toggle the draw batches, `Space` pauses the spin, `Escape`
//! quits, and the pointer nudges the model while it is inside the window.

use prism_math::pointer_to_ndc;
use prism_platform::winit::keyboard::KeyCode;
use prism_platform::{LoopControl, PlatformEvent};
use prism_render::{FrameInput, RenderSize};
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct SceneControls {
    paused: bool,
    seconds: f32,
    hidden_batches: u32,
    pointer: Option<[f32; 2]>,
}

impl SceneControls {
    pub fn handle(&mut self, event: &PlatformEvent, size: RenderSize) -> LoopControl {
        match *event {
            PlatformEvent::Close => return LoopControl::Shutdown,
            PlatformEvent::KeyDown(KeyCode::Escape) => {
                info!("escape pressed, shutting down");
                return LoopControl::Shutdown;
            }
            PlatformEvent::KeyDown(KeyCode::Space) => {
                self.paused = !self.paused;
                info!("animation {}", if self.paused { "paused" } else { "resumed" });
            }
            PlatformEvent::KeyDown(KeyCode::Digit1) => self.toggle_batch(0),
            PlatformEvent::KeyDown(KeyCode::Digit2) => self.toggle_batch(1),
            PlatformEvent::MouseMove { x, y } => {
                self.pointer = Some(pointer_to_ndc(x, y, size.width, size.height).to_array());
            }
            PlatformEvent::MouseLeave => self.pointer = None,
            PlatformEvent::MouseButton { button, pressed } => {
                debug!("mouse {button:?} pressed={pressed}");
            }
            _ => {}
        }
        LoopControl::Continue
    }

    fn toggle_batch(&mut self, index: u32) {
        self.hidden_batches ^= 1 << index;
        let visible = self.hidden_batches & (1 << index) == 0;
        info!("batch {} {}", index + 1, if visible { "shown" } else { "hidden" });
    }

    /// Advances the animation clock unless paused.
    pub fn tick(&mut self, dt: f32) {
        if !self.paused {
            self.seconds += dt;
        }
    }

    pub fn frame_input(&self) -> FrameInput {
        FrameInput {
            seconds: self.seconds,
            pointer: self.pointer,
            hidden_batches: self.hidden_batches,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: RenderSize = RenderSize {
        width: 200,
        height: 100,
    };

    #[test]
    fn test_close_and_escape_shut_down() {
        let mut c = SceneControls::default();
        assert_eq!(c.handle(&PlatformEvent::Close, SIZE), LoopControl::Shutdown);
        assert_eq!(
            c.handle(&PlatformEvent::KeyDown(KeyCode::Escape), SIZE),
            LoopControl::Shutdown
        );
        assert_eq!(
            c.handle(&PlatformEvent::KeyDown(KeyCode::KeyA), SIZE),
            LoopControl::Continue
        );
    }

    #[test]
    fn test_digit_keys_toggle_batches() {
        let mut c = SceneControls::default();
        c.handle(&PlatformEvent::KeyDown(KeyCode::Digit2), SIZE);
        let input = c.frame_input();
        assert!(input.batch_visible(0));
        assert!(!input.batch_visible(1));
        c.handle(&PlatformEvent::KeyDown(KeyCode::Digit2), SIZE);
        assert_eq!(c.frame_input().hidden_batches, 0);
    }

    #[test]
    fn test_space_pauses_clock() {
        let mut c = SceneControls::default();
        c.tick(0.5);
        c.handle(&PlatformEvent::KeyDown(KeyCode::Space), SIZE);
        c.tick(1.0);
        assert_eq!(c.frame_input().seconds, 0.5);
        c.handle(&PlatformEvent::KeyDown(KeyCode::Space), SIZE);
        c.tick(0.25);
        assert_eq!(c.frame_input().seconds, 0.75);
    }

    #[test]
    fn test_pointer_tracks_and_leaves() {
        let mut c = SceneControls::default();
        c.handle(&PlatformEvent::MouseMove { x: 200.0, y: 0.0 }, SIZE);
        assert_eq!(c.frame_input().pointer, Some([1.0, 1.0]));
        c.handle(&PlatformEvent::MouseMove { x: 100.0, y: 50.0 }, SIZE);
        assert_eq!(c.frame_input().pointer, Some([0.0, 0.0]));
        c.handle(&PlatformEvent::MouseLeave, SIZE);
        assert_eq!(c.frame_input().pointer, None);
    }
}
