// SPDX-License-Identifier: CEPL-1.0
//! `prism.toml` + command-line overrides, folded into [`RenderSettings`].

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use prism_render::{PresentPreference, RecordMode, RenderSettings, TextureData, MAX_TEXTURE_SIZE};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_CONFIG_PATH: &str = "prism.toml";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Config file (TOML)
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Frames the CPU may run ahead of the GPU (1..=4)
    #[arg(long)]
    pub frames_in_flight: Option<usize>,

    /// Preferred present mode
    #[arg(long, value_enum)]
    pub present_mode: Option<PresentModeCfg>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum PresentModeCfg {
    #[default]
    Mailbox,
    Fifo,
    Immediate,
}

impl From<PresentModeCfg> for PresentPreference {
    fn from(m: PresentModeCfg) -> Self {
        match m {
            PresentModeCfg::Mailbox => PresentPreference::Mailbox,
            PresentModeCfg::Fifo => PresentPreference::Fifo,
            PresentModeCfg::Immediate => PresentPreference::Immediate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordModeCfg {
    #[default]
    PerFrame,
    Prerecorded,
}

impl From<RecordModeCfg> for RecordMode {
    fn from(m: RecordModeCfg) -> Self {
        match m {
            RecordModeCfg::PerFrame => RecordMode::PerFrame,
            RecordModeCfg::Prerecorded => RecordMode::Prerecorded,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WindowCfg {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowCfg {
    fn default() -> Self {
        Self {
            title: "prism".to_string(),
            width: 1280,
            height: 720,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RenderCfg {
    pub clear_color: [f32; 4],
    pub frames_in_flight: usize,
    pub present_mode: PresentModeCfg,
    pub strict_present_mode: bool,
    pub acquire_timeout_ms: u64,
    pub record_mode: RecordModeCfg,
    pub shader_dir: Option<PathBuf>,
    pub texture: Option<PathBuf>,
    pub texture_size: u32,
}

impl Default for RenderCfg {
    fn default() -> Self {
        let defaults = RenderSettings::default();
        Self {
            clear_color: defaults.clear_color,
            frames_in_flight: defaults.frames_in_flight,
            present_mode: PresentModeCfg::Mailbox,
            strict_present_mode: false,
            acquire_timeout_ms: 1000,
            record_mode: RecordModeCfg::PerFrame,
            shader_dir: None,
            texture: None,
            texture_size: 256,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AppCfg {
    pub window: WindowCfg,
    pub render: RenderCfg,
}

impl AppCfg {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Missing file: defaults. Malformed file: warning, then defaults.
    pub fn load(path: &Path) -> Self {
        let text = match fs::read_to_string(path) {
            Ok(s) => s,
            Err(_) => {
                info!("no config at {}, using defaults", path.display());
                return Self::default();
            }
        };
        match Self::parse(&text) {
            Ok(cfg) => {
                info!("config loaded from {}", path.display());
                cfg
            }
            Err(e) => {
                warn!("ignoring malformed {}: {e}", path.display());
                Self::default()
            }
        }
    }

    pub fn apply_args(&mut self, args: &Args) {
        if let Some(n) = args.frames_in_flight {
            self.render.frames_in_flight = n;
        }
        if let Some(m) = args.present_mode {
            self.render.present_mode = m;
        }
    }

    pub fn render_settings(&self) -> RenderSettings {
        let r = &self.render;
        let settings = RenderSettings {
            clear_color: r.clear_color,
            frames_in_flight: r.frames_in_flight,
            present: r.present_mode.into(),
            strict_present_mode: r.strict_present_mode,
            acquire_timeout: Duration::from_millis(r.acquire_timeout_ms),
            record_mode: r.record_mode.into(),
            shader_dir: r.shader_dir.clone(),
        };
        if settings.frames_in_flight() != r.frames_in_flight {
            warn!(
                "frames_in_flight = {} out of range, using {}",
                r.frames_in_flight,
                settings.frames_in_flight()
            );
        }
        settings
    }

    /// Edge of the procedural texture, kept within what every device accepts.
    pub fn checkerboard_size(&self) -> u32 {
        let wanted = self.render.texture_size;
        let size = wanted.clamp(1, MAX_TEXTURE_SIZE);
        if size != wanted {
            warn!("texture_size = {wanted} out of range, using {size}");
        }
        size
    }

    /// PNG from `render.texture`, else a procedural checkerboard.
    pub fn texture(&self) -> Result<TextureData> {
        let Some(path) = self.render.texture.as_deref() else {
            let size = self.checkerboard_size();
            return Ok(TextureData::checkerboard(size, (size / 8).max(1)));
        };
        let img = image::open(path)
            .with_context(|| format!("open texture {}", path.display()))?
            .into_rgba8();
        let (width, height) = img.dimensions();
        info!("texture {}: {width}x{height}", path.display());
        TextureData::new(width, height, img.into_raw())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_all_defaults() {
        let cfg = AppCfg::parse("").unwrap();
        assert_eq!(cfg, AppCfg::default());
        assert_eq!(cfg.window.width, 1280);
        assert_eq!(cfg.window.height, 720);
        assert_eq!(cfg.render.frames_in_flight, 2);
        assert_eq!(cfg.render.acquire_timeout_ms, 1000);
        assert_eq!(cfg.render.texture_size, 256);
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let cfg = AppCfg::parse(
            r#"
            [window]
            title = "demo"

            [render]
            present_mode = "fifo"
            record_mode = "prerecorded"
            strict_present_mode = true
            clear_color = [1.0, 0.0, 0.0, 1.0]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.window.title, "demo");
        assert_eq!(cfg.window.width, 1280);
        assert_eq!(cfg.render.present_mode, PresentModeCfg::Fifo);
        assert_eq!(cfg.render.record_mode, RecordModeCfg::Prerecorded);
        assert!(cfg.render.strict_present_mode);

        let s = cfg.render_settings();
        assert_eq!(s.present, PresentPreference::Fifo);
        assert_eq!(s.record_mode, RecordMode::Prerecorded);
        assert_eq!(s.clear_color, [1.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        assert!(AppCfg::parse("[render]\npresent_mode = \"vsync-ish\"").is_err());
        assert!(AppCfg::parse("[window\n").is_err());
    }

    #[test]
    fn test_missing_file_loads_defaults() {
        let cfg = AppCfg::load(Path::new("/nonexistent/prism.toml"));
        assert_eq!(cfg, AppCfg::default());
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut cfg = AppCfg::parse("[render]\nframes_in_flight = 3\npresent_mode = \"immediate\"").unwrap();
        let args = Args::parse_from(["prism", "--frames-in-flight", "1", "--present-mode", "fifo"]);
        cfg.apply_args(&args);
        assert_eq!(cfg.render.frames_in_flight, 1);
        assert_eq!(cfg.render.present_mode, PresentModeCfg::Fifo);
    }

    #[test]
    fn test_cli_absent_keeps_file_values() {
        let mut cfg = AppCfg::parse("[render]\nframes_in_flight = 3").unwrap();
        cfg.apply_args(&Args::parse_from(["prism"]));
        assert_eq!(cfg.render.frames_in_flight, 3);
        assert_eq!(cfg.render.present_mode, PresentModeCfg::Mailbox);
    }

    #[test]
    fn test_settings_clamp_frames_in_flight() {
        let mut cfg = AppCfg::default();
        cfg.render.frames_in_flight = 9;
        assert_eq!(cfg.render_settings().frames_in_flight(), 4);
    }

    #[test]
    fn test_default_texture_is_checkerboard() {
        let mut cfg = AppCfg::default();
        cfg.render.texture_size = 16;
        let tex = cfg.texture().unwrap();
        assert_eq!((tex.width, tex.height), (16, 16));
        assert_eq!(tex.byte_len(), 16 * 16 * 4);
    }

    #[test]
    fn test_texture_size_is_clamped() {
        let mut cfg = AppCfg::parse("[render]\ntexture_size = 100000").unwrap();
        assert_eq!(cfg.checkerboard_size(), MAX_TEXTURE_SIZE);
        cfg.render.texture_size = 0;
        assert_eq!(cfg.checkerboard_size(), 1);
        cfg.render.texture_size = 512;
        assert_eq!(cfg.checkerboard_size(), 512);
    }

    #[test]
    fn test_missing_texture_file_is_an_error() {
        let mut cfg = AppCfg::default();
        cfg.render.texture = Some(PathBuf::from("/nonexistent/texture.png"));
        assert!(cfg.texture().is_err());
    }
}
