// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use anyhow::Result;
use clap::Parser;
use prism_core::init_tracing;
use prism_platform::{window_attributes, EventTranslator, LoopControl, PlatformEvent};
use prism_render::{FrameOutcome, RenderSize, RenderSettings, Renderer, TextureData};
use prism_render_vk::VkRenderer;
use std::time::Instant;
use tracing::{debug, error, info};

use prism_platform::winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Window, WindowId},
};

mod config;
mod input;

use config::{AppCfg, Args};
use input::SceneControls;

struct App {
    cfg: AppCfg,
    settings: RenderSettings,
    texture: TextureData,

    window: Option<Window>,
    renderer: Option<VkRenderer>,
    render_size: RenderSize,
    translator: EventTranslator,
    controls: SceneControls,

    exiting: bool,
    failure: Option<anyhow::Error>,
    last_tick: Instant,
    frames: u32,
    last_fps_instant: Instant,
}

impl App {
    fn new(cfg: AppCfg, texture: TextureData) -> Self {
        let settings = cfg.render_settings();
        let now = Instant::now();
        Self {
            render_size: RenderSize {
                width: cfg.window.width,
                height: cfg.window.height,
            },
            cfg,
            settings,
            texture,
            window: None,
            renderer: None,
            translator: EventTranslator::default(),
            controls: SceneControls::default(),
            exiting: false,
            failure: None,
            last_tick: now,
            frames: 0,
            last_fps_instant: now,
        }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let w = &self.cfg.window;
        let window = event_loop.create_window(window_attributes(&w.title, w.width, w.height))?;
        let size = window.inner_size();
        self.render_size = RenderSize {
            width: size.width,
            height: size.height,
        };
        self.translator = EventTranslator::for_size(size.width, size.height);

        let renderer = VkRenderer::new(
            &window,
            &window,
            self.render_size,
            &self.settings,
            &self.texture,
        )?;
        self.window = Some(window);
        self.renderer = Some(renderer);
        Ok(())
    }

    fn dispatch(&mut self, event: PlatformEvent) -> LoopControl {
        let Some(renderer) = self.renderer.as_mut() else {
            return LoopControl::Continue;
        };
        match event {
            PlatformEvent::Resize { width, height } => {
                self.render_size = RenderSize { width, height };
                debug!("resize {width}x{height}");
                if let Err(e) = renderer.resize(self.render_size) {
                    self.failure = Some(e);
                    return LoopControl::Shutdown;
                }
            }
            PlatformEvent::Minimize => {
                info!("minimized, rendering paused");
                renderer.set_minimized(true);
            }
            PlatformEvent::Restore => {
                info!("restored");
                renderer.set_minimized(false);
                self.last_tick = Instant::now();
            }
            other => return self.controls.handle(&other, self.render_size),
        }
        LoopControl::Continue
    }

    fn draw(&mut self) -> LoopControl {
        let Some(renderer) = self.renderer.as_mut() else {
            return LoopControl::Continue;
        };
        let now = Instant::now();
        self.controls
            .tick(now.duration_since(self.last_tick).as_secs_f32());
        self.last_tick = now;

        match renderer.render(&self.controls.frame_input()) {
            Ok(FrameOutcome::Presented) => {
                self.frames = self.frames.saturating_add(1);
                LoopControl::Continue
            }
            Ok(FrameOutcome::Skipped) => LoopControl::Continue,
            Err(e) => {
                self.failure = Some(e);
                LoopControl::Shutdown
            }
        }
    }

    // Drain the GPU, drop the renderer (reverse-order teardown), then the window.
    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }
        self.exiting = true;
        if let Some(failure) = &self.failure {
            error!("fatal: {failure:#}");
        }
        if let Some(mut renderer) = self.renderer.take() {
            if let Err(e) = renderer.shutdown() {
                error!("shutdown drain failed: {e:#}");
            }
        }
        self.window = None;
        info!("shutdown complete");
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() || self.exiting {
            return;
        }
        if let Err(e) = self.init(event_loop) {
            self.failure = Some(e.context("renderer init"));
            self.shutdown(event_loop);
            return;
        }
        event_loop.set_control_flow(ControlFlow::Poll);
        if let Some(w) = &self.window {
            w.request_redraw();
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        match &self.window {
            Some(window) if window.id() == window_id => {}
            _ => return,
        }

        let mut control = LoopControl::Continue;
        if let WindowEvent::RedrawRequested = event {
            if !self.exiting {
                control = self.draw();
            }
        } else {
            for pe in self.translator.translate(&event) {
                control = self.dispatch(pe);
                if control == LoopControl::Shutdown {
                    break;
                }
            }
        }

        if control == LoopControl::Shutdown {
            self.shutdown(event_loop);
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }

        if self.translator.is_minimized() {
            event_loop.set_control_flow(ControlFlow::Wait);
            self.frames = 0;
            return;
        }
        event_loop.set_control_flow(ControlFlow::Poll);
        if let Some(w) = &self.window {
            w.request_redraw();
        }

        let now = Instant::now();
        if now.duration_since(self.last_fps_instant).as_secs_f32() >= 1.0 {
            info!("fps ~ {}", self.frames);
            self.frames = 0;
            self.last_fps_instant = now;
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut cfg = AppCfg::load(&args.config);
    cfg.apply_args(&args);
    let texture = cfg.texture()?;

    let event_loop: EventLoop<()> = EventLoop::new()?;
    let mut app = App::new(cfg, texture);
    event_loop.run_app(&mut app)?;

    // fatal errors leave a non-zero exit status
    match app.failure.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
