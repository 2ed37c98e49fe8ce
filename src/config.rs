use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::acquisition::LoopConfig;
use crate::frame::ColorSpace;
use crate::source::SourceConfig;

const DEFAULT_URI: &str = "stub://camera";
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_FRAME_RATE: u32 = 30;
const DEFAULT_DISPLAY_SPACE: ColorSpace = ColorSpace::Bgra;
const DEFAULT_RATE_WINDOW: usize = crate::rate::DEFAULT_RATE_WINDOW;
const DEFAULT_HEALTH_LOG_SECS: u64 = 5;
const DEFAULT_QUEUE_DEPTH: usize = 2;

#[derive(Debug, Deserialize, Default)]
struct ViewerConfigFile {
    source: Option<SourceConfigFile>,
    display: Option<DisplayConfigFile>,
    pacing: Option<PacingConfigFile>,
    diagnostics: Option<DiagnosticsConfigFile>,
    sink: Option<SinkConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    uri: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    frame_rate: Option<u32>,
    frame_limit: Option<u64>,
    jitter_us: Option<u64>,
    pixel_format: Option<ColorSpace>,
}

#[derive(Debug, Deserialize, Default)]
struct DisplayConfigFile {
    color_space: Option<ColorSpace>,
}

#[derive(Debug, Deserialize, Default)]
struct PacingConfigFile {
    lag_warn_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DiagnosticsConfigFile {
    rate_window: Option<usize>,
    health_log_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SinkConfigFile {
    queue_depth: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ViewerConfig {
    pub source: SourceConfig,
    pub display_space: ColorSpace,
    pub lag_warn_ms: Option<u64>,
    pub rate_window: usize,
    pub health_log_interval: Duration,
    pub queue_depth: usize,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        // Infallible: every field of an empty file falls back to a default.
        Self::from_file(ViewerConfigFile::default())
    }
}

impl ViewerConfig {
    /// Defaults, then the file named by `STREAM_PACER_CONFIG`, then env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("STREAM_PACER_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ViewerConfigFile) -> Self {
        let src = file.source.unwrap_or_default();
        let source = SourceConfig {
            uri: src.uri.unwrap_or_else(|| DEFAULT_URI.to_string()),
            width: src.width.unwrap_or(DEFAULT_WIDTH),
            height: src.height.unwrap_or(DEFAULT_HEIGHT),
            frame_rate: src.frame_rate.unwrap_or(DEFAULT_FRAME_RATE),
            frame_limit: src.frame_limit,
            jitter_us: src.jitter_us.unwrap_or(0),
            pixel_format: src.pixel_format.unwrap_or(ColorSpace::Bgr),
        };
        let diagnostics = file.diagnostics.unwrap_or_default();
        Self {
            source,
            display_space: file
                .display
                .and_then(|display| display.color_space)
                .unwrap_or(DEFAULT_DISPLAY_SPACE),
            lag_warn_ms: file.pacing.and_then(|pacing| pacing.lag_warn_ms),
            rate_window: diagnostics.rate_window.unwrap_or(DEFAULT_RATE_WINDOW),
            health_log_interval: Duration::from_secs(
                diagnostics
                    .health_log_secs
                    .unwrap_or(DEFAULT_HEALTH_LOG_SECS),
            ),
            queue_depth: file
                .sink
                .and_then(|sink| sink.queue_depth)
                .unwrap_or(DEFAULT_QUEUE_DEPTH),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(uri) = std::env::var("STREAM_PACER_URI") {
            if !uri.trim().is_empty() {
                self.source.uri = uri;
            }
        }
        if let Ok(space) = std::env::var("STREAM_PACER_COLOR_SPACE") {
            if !space.trim().is_empty() {
                self.display_space = space
                    .parse::<ColorSpace>()
                    .context("invalid STREAM_PACER_COLOR_SPACE")?;
            }
        }
        if let Ok(lag) = std::env::var("STREAM_PACER_LAG_WARN_MS") {
            let ms: u64 = lag.parse().with_context(|| {
                format!(
                    "STREAM_PACER_LAG_WARN_MS must be an integer number of milliseconds (got {:?})",
                    lag
                )
            })?;
            self.lag_warn_ms = Some(ms);
        }
        if let Ok(depth) = std::env::var("STREAM_PACER_QUEUE_DEPTH") {
            self.queue_depth = depth.parse().with_context(|| {
                format!(
                    "STREAM_PACER_QUEUE_DEPTH must be a positive integer (got {:?})",
                    depth
                )
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.uri.trim().is_empty() {
            return Err(anyhow!("source uri must not be empty"));
        }
        if self.source.frame_rate == 0 {
            return Err(anyhow!("source frame_rate must be greater than zero"));
        }
        if self.rate_window < 2 {
            return Err(anyhow!("diagnostics rate_window must be at least 2"));
        }
        if self.health_log_interval.is_zero() {
            return Err(anyhow!("diagnostics health_log_secs must be at least 1"));
        }
        if self.queue_depth == 0 {
            return Err(anyhow!("sink queue_depth must be at least 1"));
        }
        if !self.display_space.is_display_space() {
            return Err(anyhow!(
                "display color_space must be gray, bgr or bgra (got {})",
                self.display_space
            ));
        }
        Ok(())
    }

    /// Settings for the acquisition loop derived from this config.
    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            display_space: self.display_space,
            expected_interval_ms: 1_000 / self.source.frame_rate.max(1) as u64,
            lag_warn_ms: self.lag_warn_ms,
            rate_window: self.rate_window,
        }
    }
}

fn read_config_file(path: &Path) -> Result<ViewerConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let cfg = serde_json::from_str(&raw)
        .with_context(|| format!("invalid config file {}", path.display()))?;
    Ok(cfg)
}
