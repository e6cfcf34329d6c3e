pub mod error;
pub mod frame;
pub mod output;
pub mod pack;
pub mod vanc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::frame::SourceCodec;

pub use error::OutputError;

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Fixed rational frame duration: `num / den` seconds per frame.
///
/// Timestamps are integer frame counts against this base; the device's
/// "schedule at time T with scale S" operation takes `pts * num` at scale
/// `den`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBase {
    pub num: i64,
    pub den: i64,
}

impl TimeBase {
    pub const fn new(num: i64, den: i64) -> Self {
        Self { num, den }
    }

    /// Device time for a presentation timestamp, in `1/den` ticks.
    pub fn to_device_time(&self, pts: i64) -> i64 {
        pts * self.num
    }

    pub fn scale(&self) -> i64 {
        self.den
    }
}

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub video: VideoConfig,
    pub audio: Option<AudioConfig>,
    pub pipeline: PipelineConfig,
}

/// Output video mode, fixed for the lifetime of the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
    pub time_base: TimeBase,
    pub interlaced: bool,
    pub codec: SourceCodec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Startup buffering period, in seconds, before playback begins.
    pub preroll_seconds: f64,
    /// Producer channel depth in the demo binary.
    pub channel_capacity: usize,
    /// Number of synthetic frames the demo producer emits.
    pub frame_count: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            video: VideoConfig {
                width: 1280,
                height: 720,
                time_base: TimeBase::new(1, 50),
                interlaced: false,
                codec: SourceCodec::PackedWire,
            },
            audio: None,
            pipeline: PipelineConfig {
                preroll_seconds: 0.5,
                channel_capacity: 8,
                frame_count: 250,
            },
        }
    }
}
