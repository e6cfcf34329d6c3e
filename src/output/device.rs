//! Device capability contract, plus the software playout device used by the
//! demo binary and the concurrency tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use crate::error::{OutputError, Result};
use crate::output::frame::{OutputFrame, WireFormat};
use crate::TimeBase;

/// How the device disposed of a scheduled frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionResult {
    Completed,
    DisplayedLate,
    Dropped,
    Flushed,
}

/// Receiver for completion notifications. Runs on the device's own context;
/// implementations must not call back into the device.
pub trait FrameCompletion: Send + Sync {
    fn frame_completed(&self, frame: Arc<OutputFrame>, result: CompletionResult);
}

/// Fixed capability contract over the vendor output surface. Never
/// reimplemented here - hardware backends wrap the vendor SDK, software
/// backends stand in for it.
pub trait OutputDevice: Send + Sync {
    fn enable_video(
        &self,
        width: u32,
        height: u32,
        time_base: TimeBase,
        format: WireFormat,
        with_ancillary: bool,
    ) -> Result<()>;
    fn disable_video(&self) -> Result<()>;
    fn enable_audio(&self, sample_rate: u32, channels: u32) -> Result<()>;
    fn disable_audio(&self) -> Result<()>;
    fn begin_audio_preroll(&self) -> Result<()>;
    fn end_audio_preroll(&self) -> Result<()>;
    /// Whether the output can carry ancillary lines alongside the picture.
    fn supports_ancillary(&self) -> bool;
    fn set_completion_handler(&self, handler: Arc<dyn FrameCompletion>);
    /// Queue a frame for display at `display_time` (in `1/scale` ticks).
    /// Asynchronous: completion arrives through the registered handler.
    fn schedule_frame(
        &self,
        frame: Arc<OutputFrame>,
        display_time: i64,
        duration: i64,
        scale: i64,
    ) -> Result<()>;
    fn schedule_audio(&self, samples: Bytes, sample_count: u32, pts: i64) -> Result<()>;
    /// Diagnostics only.
    fn buffered_frames(&self) -> u32;
    fn buffered_audio_samples(&self) -> u32;
    fn start_playback(&self, start_time: i64, scale: i64) -> Result<()>;
    /// Stop scheduled output. Blocks until the device confirms; every frame
    /// still held is completed (flushed) before this returns. Returns the
    /// actual stop time.
    fn stop_playback(&self, stop_time: i64, scale: i64) -> Result<i64>;
}

struct SimState {
    video_enabled: bool,
    audio_enabled: bool,
    audio_prerolling: bool,
    playing: bool,
    frame_duration: Duration,
    queue: VecDeque<Arc<OutputFrame>>,
    handler: Option<Arc<dyn FrameCompletion>>,
    buffered_audio: u32,
    samples_per_frame: u32,
}

/// Software output device pacing completions at the configured frame rate.
/// Stands in for the hardware behind the same capability contract.
pub struct SimulatedOutput {
    state: Arc<Mutex<SimState>>,
    ticker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl SimulatedOutput {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(SimState {
                video_enabled: false,
                audio_enabled: false,
                audio_prerolling: false,
                playing: false,
                frame_duration: Duration::from_millis(20),
                queue: VecDeque::new(),
                handler: None,
                buffered_audio: 0,
                samples_per_frame: 0,
            })),
            ticker: Mutex::new(None),
        })
    }

    fn complete_one(state: &Mutex<SimState>) -> bool {
        let (frame, handler, period) = {
            let mut s = state.lock().unwrap();
            if !s.playing {
                return false;
            }
            let frame = s.queue.pop_front();
            s.buffered_audio = s.buffered_audio.saturating_sub(s.samples_per_frame);
            (frame, s.handler.clone(), s.frame_duration)
        };
        thread::sleep(period);
        // Handler runs outside the device lock, mirroring a callback context.
        if let (Some(frame), Some(handler)) = (frame, handler) {
            handler.frame_completed(frame, CompletionResult::Completed);
        }
        true
    }
}

impl OutputDevice for SimulatedOutput {
    fn enable_video(
        &self,
        width: u32,
        height: u32,
        time_base: TimeBase,
        format: WireFormat,
        with_ancillary: bool,
    ) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        s.video_enabled = true;
        s.frame_duration =
            Duration::from_secs_f64(time_base.num as f64 / time_base.den as f64);
        s.samples_per_frame = (48_000 * time_base.num / time_base.den) as u32;
        debug!(width, height, ?format, with_ancillary, "video output enabled");
        Ok(())
    }

    fn disable_video(&self) -> Result<()> {
        self.state.lock().unwrap().video_enabled = false;
        Ok(())
    }

    fn enable_audio(&self, sample_rate: u32, channels: u32) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        s.audio_enabled = true;
        debug!(sample_rate, channels, "audio output enabled");
        Ok(())
    }

    fn disable_audio(&self) -> Result<()> {
        self.state.lock().unwrap().audio_enabled = false;
        Ok(())
    }

    fn begin_audio_preroll(&self) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        if !s.audio_enabled {
            return Err(OutputError::device("begin_audio_preroll", "audio disabled"));
        }
        s.audio_prerolling = true;
        Ok(())
    }

    fn end_audio_preroll(&self) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        if !s.audio_prerolling {
            return Err(OutputError::device("end_audio_preroll", "not prerolling"));
        }
        s.audio_prerolling = false;
        Ok(())
    }

    fn supports_ancillary(&self) -> bool {
        true
    }

    fn set_completion_handler(&self, handler: Arc<dyn FrameCompletion>) {
        self.state.lock().unwrap().handler = Some(handler);
    }

    fn schedule_frame(
        &self,
        frame: Arc<OutputFrame>,
        display_time: i64,
        _duration: i64,
        _scale: i64,
    ) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        if !s.video_enabled {
            return Err(OutputError::device("schedule_frame", "video disabled"));
        }
        debug!(
            display_time,
            buffered = s.queue.len(),
            ancillary = frame.ancillary().is_some(),
            "frame scheduled"
        );
        s.queue.push_back(frame);
        Ok(())
    }

    fn schedule_audio(&self, _samples: Bytes, sample_count: u32, _pts: i64) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        if !s.audio_enabled {
            return Err(OutputError::device("schedule_audio", "audio disabled"));
        }
        s.buffered_audio += sample_count;
        Ok(())
    }

    fn buffered_frames(&self) -> u32 {
        self.state.lock().unwrap().queue.len() as u32
    }

    fn buffered_audio_samples(&self) -> u32 {
        self.state.lock().unwrap().buffered_audio
    }

    fn start_playback(&self, start_time: i64, _scale: i64) -> Result<()> {
        {
            let mut s = self.state.lock().unwrap();
            if s.playing {
                return Err(OutputError::device("start_playback", "already playing"));
            }
            s.playing = true;
        }
        debug!(start_time, "scheduled playback started");
        let state = Arc::clone(&self.state);
        let handle = thread::spawn(move || while Self::complete_one(&state) {});
        *self.ticker.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn stop_playback(&self, stop_time: i64, _scale: i64) -> Result<i64> {
        let (flushed, handler) = {
            let mut s = self.state.lock().unwrap();
            s.playing = false;
            let flushed: Vec<_> = s.queue.drain(..).collect();
            (flushed, s.handler.clone())
        };
        if let Some(handle) = self.ticker.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handler) = handler {
            for frame in flushed {
                handler.frame_completed(frame, CompletionResult::Flushed);
            }
        }
        debug!(stop_time, "scheduled playback stopped");
        Ok(stop_time)
    }
}
