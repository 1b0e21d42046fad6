// SPDX-License-Identifier: CEPL-1.0
//! Window-system glue: winit re-export plus the small tagged event vocabulary
//! the renderer loop consumes.

pub use winit;

use tracing::debug;
use winit::dpi::LogicalSize;
use winit::event::{ElementState, KeyEvent, MouseButton, WindowEvent};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{Window, WindowAttributes};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PlatformEvent {
    Close,
    Resize { width: u32, height: u32 },
    Minimize,
    Restore,
    MouseMove { x: f32, y: f32 },
    MouseButton { button: MouseButton, pressed: bool },
    MouseLeave,
    KeyDown(KeyCode),
}

/// Returned by event handling in place of a shared "running" flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Shutdown,
}

pub fn window_attributes(title: &str, width: u32, height: u32) -> WindowAttributes {
    Window::default_attributes()
        .with_title(title)
        .with_inner_size(LogicalSize::new(width.max(1), height.max(1)))
}

/// Folds winit's events into [`PlatformEvent`]s, synthesising
/// `Minimize`/`Restore` from zero-size resizes and occlusion.
#[derive(Debug, Default)]
pub struct EventTranslator {
    minimized: bool,
}

impl EventTranslator {
    /// Starts minimized when the window was created with no area, so the
    /// first real resize reports `Restore`.
    pub fn for_size(width: u32, height: u32) -> Self {
        Self {
            minimized: width == 0 || height == 0,
        }
    }

    pub fn is_minimized(&self) -> bool {
        self.minimized
    }

    pub fn translate(&mut self, event: &WindowEvent) -> Vec<PlatformEvent> {
        match event {
            WindowEvent::CloseRequested | WindowEvent::Destroyed => vec![PlatformEvent::Close],
            WindowEvent::Resized(size) => {
                if size.width == 0 || size.height == 0 {
                    self.minimize().into_iter().collect()
                } else {
                    let mut out: Vec<_> = self.restore().into_iter().collect();
                    out.push(PlatformEvent::Resize {
                        width: size.width,
                        height: size.height,
                    });
                    out
                }
            }
            WindowEvent::Occluded(true) => self.minimize().into_iter().collect(),
            WindowEvent::Occluded(false) => self.restore().into_iter().collect(),
            WindowEvent::CursorMoved { position, .. } => vec![PlatformEvent::MouseMove {
                x: position.x as f32,
                y: position.y as f32,
            }],
            WindowEvent::CursorLeft { .. } => vec![PlatformEvent::MouseLeave],
            WindowEvent::MouseInput { state, button, .. } => vec![PlatformEvent::MouseButton {
                button: *button,
                pressed: *state == ElementState::Pressed,
            }],
            WindowEvent::KeyboardInput { event, .. } => {
                key_down(event).map(PlatformEvent::KeyDown).into_iter().collect()
            }
            _ => Vec::new(),
        }
    }

    fn minimize(&mut self) -> Option<PlatformEvent> {
        if self.minimized {
            return None;
        }
        self.minimized = true;
        debug!("platform: minimized");
        Some(PlatformEvent::Minimize)
    }

    fn restore(&mut self) -> Option<PlatformEvent> {
        if !self.minimized {
            return None;
        }
        self.minimized = false;
        debug!("platform: restored");
        Some(PlatformEvent::Restore)
    }
}

/// First press of a physical key; auto-repeat and releases are ignored.
pub fn key_down(event: &KeyEvent) -> Option<KeyCode> {
    if event.state != ElementState::Pressed || event.repeat {
        return None;
    }
    match event.physical_key {
        PhysicalKey::Code(code) => Some(code),
        PhysicalKey::Unidentified(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use winit::dpi::{PhysicalPosition, PhysicalSize};
    use winit::event::DeviceId;

    fn resized(w: u32, h: u32) -> WindowEvent {
        WindowEvent::Resized(PhysicalSize::new(w, h))
    }

    #[test]
    fn test_close_requested() {
        let mut t = EventTranslator::default();
        assert_eq!(
            t.translate(&WindowEvent::CloseRequested),
            vec![PlatformEvent::Close]
        );
    }

    #[test]
    fn test_zero_resize_minimizes_once() {
        let mut t = EventTranslator::default();
        assert_eq!(t.translate(&resized(0, 0)), vec![PlatformEvent::Minimize]);
        assert!(t.is_minimized());
        assert!(t.translate(&resized(0, 0)).is_empty());
    }

    #[test]
    fn test_resize_after_minimize_restores_first() {
        let mut t = EventTranslator::default();
        t.translate(&resized(0, 0));
        assert_eq!(
            t.translate(&resized(800, 600)),
            vec![
                PlatformEvent::Restore,
                PlatformEvent::Resize {
                    width: 800,
                    height: 600
                }
            ]
        );
        assert!(!t.is_minimized());
    }

    #[test]
    fn test_zero_sized_window_restores_on_first_resize() {
        let mut t = EventTranslator::for_size(0, 0);
        assert!(t.is_minimized());
        assert_eq!(
            t.translate(&resized(800, 600)),
            vec![
                PlatformEvent::Restore,
                PlatformEvent::Resize {
                    width: 800,
                    height: 600
                }
            ]
        );
        assert!(!EventTranslator::for_size(800, 600).is_minimized());
    }

    #[test]
    fn test_occlusion_maps_to_minimize_restore() {
        let mut t = EventTranslator::default();
        assert_eq!(
            t.translate(&WindowEvent::Occluded(true)),
            vec![PlatformEvent::Minimize]
        );
        assert_eq!(
            t.translate(&WindowEvent::Occluded(false)),
            vec![PlatformEvent::Restore]
        );
        assert!(t.translate(&WindowEvent::Occluded(false)).is_empty());
    }

    #[test]
    fn test_mouse_events() {
        let mut t = EventTranslator::default();
        let device_id = unsafe { DeviceId::dummy() };
        assert_eq!(
            t.translate(&WindowEvent::CursorMoved {
                device_id,
                position: PhysicalPosition::new(10.0, 20.0),
            }),
            vec![PlatformEvent::MouseMove { x: 10.0, y: 20.0 }]
        );
        assert_eq!(
            t.translate(&WindowEvent::MouseInput {
                device_id,
                state: ElementState::Pressed,
                button: MouseButton::Left,
            }),
            vec![PlatformEvent::MouseButton {
                button: MouseButton::Left,
                pressed: true
            }]
        );
        assert_eq!(
            t.translate(&WindowEvent::CursorLeft { device_id }),
            vec![PlatformEvent::MouseLeave]
        );
    }

    #[test]
    fn test_unrelated_events_are_dropped() {
        let mut t = EventTranslator::default();
        assert!(t.translate(&WindowEvent::Focused(true)).is_empty());
    }
}
