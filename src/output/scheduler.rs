//! Frame scheduling against the output device: bounded buffering,
//! backpressure, preroll and timestamp-ordered submission.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use bytes::Bytes;
use crossbeam::utils::CachePadded;
use tracing::{debug, info, warn};

use crate::error::{OutputError, Result};
use crate::frame::{PackedUnit, Picture, PictureFormat, SourceCodec};
use crate::output::device::{CompletionResult, FrameCompletion, OutputDevice};
use crate::output::frame::{OutputFrame, WireFormat};
use crate::vanc::AncillaryEncoder;
use crate::{AudioConfig, VideoConfig};

/// Upper bound on buffered frames; device onboard memory is finite.
const MAX_FRAME_BUFFER: usize = 60;
/// Buffered-frame counts at or below this after startup log a soft warning.
const LOW_WATER_FRAMES: u32 = 2;

/// Scheduler lifecycle. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    Idle,
    Configured,
    Prerolling,
    Playing,
    Stopped,
}

/// Bounded slot counter: one mutex-protected count plus a condvar, a bounded
/// semaphore in disguise. Producers block in `acquire`; the completion
/// context only increments and broadcasts.
struct SlotGate {
    capacity: usize,
    available: Mutex<usize>,
    cond: Condvar,
}

impl SlotGate {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            available: Mutex::new(capacity),
            cond: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut n = self.available.lock().unwrap();
        while *n == 0 {
            n = self.cond.wait(n).unwrap();
        }
        *n -= 1;
    }

    fn release(&self) {
        let mut n = self.available.lock().unwrap();
        *n += 1;
        self.cond.notify_all();
    }

    fn available(&self) -> usize {
        *self.available.lock().unwrap()
    }

    /// Block until every slot has been returned.
    fn wait_drained(&self) {
        let mut n = self.available.lock().unwrap();
        while *n < self.capacity {
            n = self.cond.wait(n).unwrap();
        }
    }
}

#[derive(Default)]
struct Stats {
    scheduled: AtomicU64,
    completed: AtomicU64,
    dropped: AtomicU64,
}

/// State shared with the device completion context.
struct Shared {
    slots: SlotGate,
    stats: CachePadded<Stats>,
}

/// Bridges device completions back into the slot gate. Runs on the device's
/// context and never calls back into the device.
struct CompletionRelay {
    shared: Arc<Shared>,
}

impl FrameCompletion for CompletionRelay {
    fn frame_completed(&self, frame: Arc<OutputFrame>, result: CompletionResult) {
        if result != CompletionResult::Completed {
            metrics::counter!("frames_not_cleanly_completed").increment(1);
        }
        self.shared.stats.completed.fetch_add(1, Ordering::Relaxed);
        // Release exactly one slot and wake every waiting submitter; the
        // device's frame reference drops with `frame`.
        self.shared.slots.release();
        drop(frame);
    }
}

/// Orchestrates the frame lifecycle against the device: bounded buffering
/// with cooperative backpressure, one-shot preroll-to-playback transition,
/// in-order submission, drain on stop.
pub struct OutputScheduler {
    device: Arc<dyn OutputDevice>,
    state: OutputState,
    video: Option<VideoConfig>,
    audio: Option<AudioConfig>,
    vanc: Option<AncillaryEncoder>,
    shared: Option<Arc<Shared>>,
    frames_preroll: u64,
    frames_scheduled: u64,
    playback_started: bool,
    last_pts: i64,
}

impl OutputScheduler {
    pub fn new(device: Arc<dyn OutputDevice>) -> Self {
        Self {
            device,
            state: OutputState::Idle,
            video: None,
            audio: None,
            vanc: None,
            shared: None,
            frames_preroll: 0,
            frames_scheduled: 0,
            playback_started: false,
            last_pts: 0,
        }
    }

    /// Fix the device mode and buffering parameters: `Idle -> Configured`.
    pub fn configure(
        &mut self,
        video: VideoConfig,
        audio: Option<AudioConfig>,
        preroll_seconds: f64,
    ) -> Result<()> {
        if self.state != OutputState::Idle {
            return Err(OutputError::Precondition(format!(
                "configure called in state {:?}",
                self.state
            )));
        }
        if video.width % 2 != 0 {
            return Err(OutputError::Precondition(format!(
                "output width must be even, got {}",
                video.width
            )));
        }
        if let Some(a) = &audio {
            if a.sample_rate != 48_000 {
                return Err(OutputError::Precondition(format!(
                    "only 48 kHz audio is supported, got {}",
                    a.sample_rate
                )));
            }
            if !matches!(a.channels, 2 | 8 | 16) {
                return Err(OutputError::Precondition(format!(
                    "only 2, 8 or 16 audio channels are supported, got {}",
                    a.channels
                )));
            }
        }

        let wire = match video.codec {
            SourceCodec::PackedWire => WireFormat::Packed10,
            SourceCodec::WrappedNative => WireFormat::Native8,
        };
        // Ancillary emission only exists on the packed wire format, and only
        // when the device can carry it.
        let vanc = if video.codec == SourceCodec::PackedWire && self.device.supports_ancillary() {
            Some(AncillaryEncoder::new(&video)?)
        } else {
            None
        };

        self.device
            .enable_video(video.width, video.height, video.time_base, wire, vanc.is_some())?;
        if let Some(a) = &audio {
            self.device.enable_audio(a.sample_rate, a.channels)?;
            self.device.begin_audio_preroll()?;
        }

        // Preroll frame count at the mode's rate; NTSC-style scales carry a
        // factor 1000 in the denominator.
        let mut frames_preroll = (video.time_base.den as f64 * preroll_seconds) as u64;
        if video.time_base.den > 1000 {
            frames_preroll /= 1000;
        }
        let capacity = ((frames_preroll as usize) * 2).clamp(1, MAX_FRAME_BUFFER);

        let shared = Arc::new(Shared {
            slots: SlotGate::new(capacity),
            stats: CachePadded::new(Stats::default()),
        });
        self.device.set_completion_handler(Arc::new(CompletionRelay {
            shared: Arc::clone(&shared),
        }));

        info!(
            width = video.width,
            height = video.height,
            frames_preroll,
            capacity,
            audio = audio.is_some(),
            "output configured"
        );
        self.video = Some(video);
        self.audio = audio;
        self.vanc = vanc;
        self.shared = Some(shared);
        self.frames_preroll = frames_preroll;
        self.state = OutputState::Configured;
        Ok(())
    }

    pub fn state(&self) -> OutputState {
        self.state
    }

    /// Slots currently free; equals `capacity - in_flight`.
    pub fn available_slots(&self) -> usize {
        self.shared.as_ref().map_or(0, |s| s.slots.available())
    }

    pub fn capacity(&self) -> usize {
        self.shared.as_ref().map_or(0, |s| s.slots.capacity)
    }

    /// Submit one packed wire unit. Blocks while the buffer is full; frames
    /// reach the device in call order.
    pub fn submit_packed(&mut self, unit: PackedUnit) -> Result<()> {
        let Some(video) = &self.video else {
            return Err(OutputError::Precondition("scheduler not configured".into()));
        };
        if video.codec != SourceCodec::PackedWire {
            return Err(OutputError::Precondition(
                "scheduler is configured for wrapped-native output".into(),
            ));
        }
        let ancillary = match &mut self.vanc {
            Some(enc) => enc.encode(&unit.side_data)?,
            None => None,
        };
        let pts = unit.pts;
        let frame = Arc::new(OutputFrame::from_packed(unit, ancillary));
        self.submit(frame, pts)
    }

    /// Submit one native picture as-is. Format and dimensions must match the
    /// configured mode exactly.
    pub fn submit_wrapped(&mut self, pic: &Picture) -> Result<()> {
        let Some(video) = &self.video else {
            return Err(OutputError::Precondition("scheduler not configured".into()));
        };
        if video.codec != SourceCodec::WrappedNative {
            return Err(OutputError::Precondition(
                "scheduler is configured for packed wire output".into(),
            ));
        }
        if pic.meta.format != PictureFormat::Uyvy422
            || pic.meta.width != video.width
            || pic.meta.height != video.height
        {
            return Err(OutputError::Precondition(format!(
                "picture {}x{} {:?} does not match the configured mode",
                pic.meta.width, pic.meta.height, pic.meta.format
            )));
        }
        let frame = Arc::new(OutputFrame::from_wrapped(pic)?);
        self.submit(frame, pic.meta.pts)
    }

    fn submit(&mut self, frame: Arc<OutputFrame>, pts: i64) -> Result<()> {
        match self.state {
            OutputState::Configured => self.state = OutputState::Prerolling,
            OutputState::Prerolling | OutputState::Playing => {}
            s => {
                return Err(OutputError::Precondition(format!(
                    "submit called in state {s:?}"
                )))
            }
        }
        let Some(video) = self.video.clone() else {
            return Err(OutputError::Precondition("scheduler not configured".into()));
        };
        let Some(shared) = self.shared.clone() else {
            return Err(OutputError::Precondition("scheduler not configured".into()));
        };
        self.last_pts = self.last_pts.max(pts);

        // Cooperative backpressure: wait for a free slot, holding no device
        // lock while suspended.
        let wait_start = Instant::now();
        shared.slots.acquire();
        metrics::histogram!("submit_wait_us").record(wait_start.elapsed().as_micros() as f64);

        let tb = video.time_base;
        if let Err(e) = self
            .device
            .schedule_frame(Arc::clone(&frame), tb.to_device_time(pts), tb.num, tb.den)
        {
            // Synchronous rejection: reclaim the slot, drop the frame, no
            // retry - a retry would break the monotonic timing guarantee.
            shared.slots.release();
            shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("frames_rejected").increment(1);
            return Err(e);
        }
        drop(frame);
        self.frames_scheduled += 1;
        shared.stats.scheduled.fetch_add(1, Ordering::Relaxed);

        let buffered = self.device.buffered_frames();
        debug!(buffered, "buffered video frames");
        metrics::gauge!("buffered_frames").set(buffered as f64);
        if pts > 2 && buffered <= LOW_WATER_FRAMES {
            warn!(
                buffered,
                "not enough buffered video frames, output may misbehave"
            );
            metrics::counter!("low_water_events").increment(1);
        }

        if !self.playback_started && self.frames_scheduled > self.frames_preroll {
            self.start_playback()?;
        }
        Ok(())
    }

    /// `Prerolling -> Playing`, exactly once.
    fn start_playback(&mut self) -> Result<()> {
        if self.audio.is_some() {
            debug!("ending audio preroll");
            self.device.end_audio_preroll()?;
        }
        let Some(video) = &self.video else {
            return Err(OutputError::Precondition("scheduler not configured".into()));
        };
        debug!("starting scheduled playback");
        self.device.start_playback(0, video.time_base.den)?;
        self.playback_started = true;
        self.state = OutputState::Playing;
        info!(frames = self.frames_scheduled, "playback started");
        Ok(())
    }

    /// Schedule interleaved 16-bit audio samples at `pts` (sample-rate
    /// ticks).
    pub fn submit_audio(&mut self, samples: Bytes, pts: i64) -> Result<()> {
        let Some(audio) = &self.audio else {
            return Err(OutputError::Precondition("no audio stream configured".into()));
        };
        let sample_count = samples.len() as u32 / (audio.channels * 2);
        let buffered = self.device.buffered_audio_samples();
        if pts > 1 && buffered == 0 {
            warn!("no buffered audio, output may misbehave");
        }
        self.last_pts = self.last_pts.max(pts);
        self.device.schedule_audio(samples, sample_count, pts)
    }

    /// `Playing -> Stopped`: stop the device at the last scheduled
    /// timestamp, disable outputs, and drain every held frame. Terminal.
    pub fn stop(&mut self) -> Result<()> {
        if self.state == OutputState::Stopped {
            return Ok(());
        }
        if self.playback_started || self.frames_scheduled > 0 {
            let Some(video) = &self.video else {
                return Err(OutputError::Precondition("scheduler not configured".into()));
            };
            let tb = video.time_base;
            let actual = self
                .device
                .stop_playback(tb.to_device_time(self.last_pts), tb.den)?;
            debug!(actual, "device confirmed stop");
            self.device.disable_video()?;
            if self.audio.is_some() {
                self.device.disable_audio()?;
            }
        }
        if let Some(shared) = &self.shared {
            shared.slots.wait_drained();
            info!(
                scheduled = shared.stats.scheduled.load(Ordering::Relaxed),
                completed = shared.stats.completed.load(Ordering::Relaxed),
                dropped = shared.stats.dropped.load(Ordering::Relaxed),
                "output stopped"
            );
        }
        self.state = OutputState::Stopped;
        Ok(())
    }
}

impl Drop for OutputScheduler {
    fn drop(&mut self) {
        if self.state != OutputState::Stopped {
            if let Err(e) = self.stop() {
                warn!(error = %e, "stop on drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TimeBase;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    /// Manually-stepped device: completions fire when the test says so.
    #[derive(Default)]
    struct MockInner {
        queue: VecDeque<Arc<OutputFrame>>,
        handler: Option<Arc<dyn FrameCompletion>>,
        fail_next_schedule: bool,
        starts: u32,
        stops: u32,
        audio_preroll_ended: bool,
    }

    #[derive(Default)]
    struct MockDevice {
        inner: Mutex<MockInner>,
    }

    impl MockDevice {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn complete_next(&self, result: CompletionResult) {
            let (frame, handler) = {
                let mut inner = self.inner.lock().unwrap();
                (inner.queue.pop_front(), inner.handler.clone())
            };
            if let (Some(frame), Some(handler)) = (frame, handler) {
                handler.frame_completed(frame, result);
            }
        }

        fn fail_next(&self) {
            self.inner.lock().unwrap().fail_next_schedule = true;
        }

        fn starts(&self) -> u32 {
            self.inner.lock().unwrap().starts
        }
    }

    impl OutputDevice for MockDevice {
        fn enable_video(
            &self,
            _width: u32,
            _height: u32,
            _tb: TimeBase,
            _format: WireFormat,
            _with_ancillary: bool,
        ) -> Result<()> {
            Ok(())
        }
        fn disable_video(&self) -> Result<()> {
            Ok(())
        }
        fn enable_audio(&self, _rate: u32, _channels: u32) -> Result<()> {
            Ok(())
        }
        fn disable_audio(&self) -> Result<()> {
            Ok(())
        }
        fn begin_audio_preroll(&self) -> Result<()> {
            Ok(())
        }
        fn end_audio_preroll(&self) -> Result<()> {
            self.inner.lock().unwrap().audio_preroll_ended = true;
            Ok(())
        }
        fn supports_ancillary(&self) -> bool {
            true
        }
        fn set_completion_handler(&self, handler: Arc<dyn FrameCompletion>) {
            self.inner.lock().unwrap().handler = Some(handler);
        }
        fn schedule_frame(
            &self,
            frame: Arc<OutputFrame>,
            _display_time: i64,
            _duration: i64,
            _scale: i64,
        ) -> Result<()> {
            let mut inner = self.inner.lock().unwrap();
            if inner.fail_next_schedule {
                inner.fail_next_schedule = false;
                return Err(OutputError::device("schedule_frame", "injected failure"));
            }
            inner.queue.push_back(frame);
            Ok(())
        }
        fn schedule_audio(&self, _samples: Bytes, _count: u32, _pts: i64) -> Result<()> {
            Ok(())
        }
        fn buffered_frames(&self) -> u32 {
            self.inner.lock().unwrap().queue.len() as u32
        }
        fn buffered_audio_samples(&self) -> u32 {
            1024
        }
        fn start_playback(&self, _start: i64, _scale: i64) -> Result<()> {
            self.inner.lock().unwrap().starts += 1;
            Ok(())
        }
        fn stop_playback(&self, stop_time: i64, _scale: i64) -> Result<i64> {
            let (flushed, handler) = {
                let mut inner = self.inner.lock().unwrap();
                inner.stops += 1;
                let flushed: Vec<_> = inner.queue.drain(..).collect();
                (flushed, inner.handler.clone())
            };
            if let Some(handler) = handler {
                for frame in flushed {
                    handler.frame_completed(frame, CompletionResult::Flushed);
                }
            }
            Ok(stop_time)
        }
    }

    fn video_config() -> VideoConfig {
        VideoConfig {
            width: 48,
            height: 2,
            time_base: TimeBase::new(1, 25),
            interlaced: false,
            codec: SourceCodec::PackedWire,
        }
    }

    fn unit(pts: i64) -> PackedUnit {
        PackedUnit {
            data: Bytes::from(vec![0u8; 128 * 2]),
            width: 48,
            height: 2,
            pts,
            side_data: vec![],
        }
    }

    /// preroll 0.08 s at 1/25 -> threshold 2 frames, capacity 4.
    fn configured(device: Arc<MockDevice>) -> OutputScheduler {
        let mut sched = OutputScheduler::new(device);
        sched.configure(video_config(), None, 0.08).unwrap();
        sched
    }

    #[test]
    fn capacity_is_twice_the_preroll() {
        let sched = configured(MockDevice::new());
        assert_eq!(sched.capacity(), 4);
        assert_eq!(sched.available_slots(), 4);
        assert_eq!(sched.state(), OutputState::Configured);
    }

    #[test]
    fn slot_accounting_tracks_submissions_and_completions() {
        let device = MockDevice::new();
        let mut sched = configured(Arc::clone(&device));
        for pts in 0..3 {
            sched.submit_packed(unit(pts)).unwrap();
        }
        assert_eq!(sched.available_slots(), 4 - 3);
        device.complete_next(CompletionResult::Completed);
        assert_eq!(sched.available_slots(), 4 - 3 + 1);
        device.complete_next(CompletionResult::Completed);
        assert_eq!(sched.available_slots(), 3);
    }

    #[test]
    fn submit_blocks_only_past_capacity() {
        let device = MockDevice::new();
        let mut sched = configured(Arc::clone(&device));
        // Up to capacity: never blocks.
        for pts in 0..4 {
            sched.submit_packed(unit(pts)).unwrap();
        }
        assert_eq!(sched.available_slots(), 0);

        let unblocked = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&unblocked);
        let handle = thread::spawn(move || {
            let mut sched = sched;
            sched.submit_packed(unit(4)).unwrap();
            flag.store(true, Ordering::SeqCst);
            sched
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!unblocked.load(Ordering::SeqCst), "5th submit must block");

        // One completion releases one slot and wakes the submitter.
        device.complete_next(CompletionResult::Completed);
        let sched = handle.join().unwrap();
        assert!(unblocked.load(Ordering::SeqCst));
        assert_eq!(sched.available_slots(), 0);
    }

    #[test]
    fn preroll_transition_fires_exactly_once() {
        let device = MockDevice::new();
        let mut sched = configured(Arc::clone(&device));
        sched.submit_packed(unit(0)).unwrap();
        assert_eq!(sched.state(), OutputState::Prerolling);
        sched.submit_packed(unit(1)).unwrap();
        assert_eq!(sched.state(), OutputState::Prerolling);
        assert_eq!(device.starts(), 0);

        // Third frame exceeds the threshold of 2.
        sched.submit_packed(unit(2)).unwrap();
        assert_eq!(sched.state(), OutputState::Playing);
        assert_eq!(device.starts(), 1);

        device.complete_next(CompletionResult::Completed);
        sched.submit_packed(unit(3)).unwrap();
        assert_eq!(device.starts(), 1, "no retrigger past the threshold");
    }

    #[test]
    fn audio_preroll_gates_playback_start() {
        let device = MockDevice::new();
        let mut sched = OutputScheduler::new(Arc::clone(&device) as Arc<dyn OutputDevice>);
        sched
            .configure(
                video_config(),
                Some(AudioConfig {
                    sample_rate: 48_000,
                    channels: 2,
                }),
                0.08,
            )
            .unwrap();
        for pts in 0..3 {
            sched.submit_packed(unit(pts)).unwrap();
        }
        let inner = device.inner.lock().unwrap();
        assert!(inner.audio_preroll_ended);
        assert_eq!(inner.starts, 1);
    }

    #[test]
    fn device_rejection_reclaims_the_slot() {
        let device = MockDevice::new();
        let mut sched = configured(Arc::clone(&device));
        device.fail_next();
        let err = sched.submit_packed(unit(0)).unwrap_err();
        assert!(matches!(err, OutputError::Device { .. }));
        assert_eq!(sched.available_slots(), 4, "slot returned on rejection");
        // Pipeline continues with the next frame.
        sched.submit_packed(unit(1)).unwrap();
        assert_eq!(sched.available_slots(), 3);
    }

    #[test]
    fn invalid_audio_modes_are_rejected_at_configure() {
        let mut sched = OutputScheduler::new(MockDevice::new());
        let err = sched
            .configure(
                video_config(),
                Some(AudioConfig {
                    sample_rate: 44_100,
                    channels: 2,
                }),
                0.08,
            )
            .unwrap_err();
        assert!(matches!(err, OutputError::Precondition(_)));

        let mut sched = OutputScheduler::new(MockDevice::new());
        let err = sched
            .configure(
                video_config(),
                Some(AudioConfig {
                    sample_rate: 48_000,
                    channels: 3,
                }),
                0.08,
            )
            .unwrap_err();
        assert!(matches!(err, OutputError::Precondition(_)));
    }

    #[test]
    fn odd_width_never_reaches_the_device() {
        let mut sched = OutputScheduler::new(MockDevice::new());
        let mut video = video_config();
        video.width = 47;
        assert!(matches!(
            sched.configure(video, None, 0.08),
            Err(OutputError::Precondition(_))
        ));
        assert_eq!(sched.state(), OutputState::Idle);
    }

    #[test]
    fn wrapped_mode_validates_dimensions() {
        let device = MockDevice::new();
        let mut sched = OutputScheduler::new(device);
        let mut video = video_config();
        video.codec = SourceCodec::WrappedNative;
        sched.configure(video, None, 0.08).unwrap();

        let pic = Picture {
            meta: crate::frame::PictureMeta {
                width: 96,
                height: 2,
                format: PictureFormat::Uyvy422,
                interlaced: false,
                pts: 0,
            },
            data: crate::frame::PictureData::Planes8(vec![Bytes::from(vec![0u8; 96 * 2 * 2])]),
            side_data: vec![],
        };
        assert!(matches!(
            sched.submit_wrapped(&pic),
            Err(OutputError::Precondition(_))
        ));
    }

    #[test]
    fn stop_drains_every_held_frame() {
        let device = MockDevice::new();
        let mut sched = configured(Arc::clone(&device));
        for pts in 0..3 {
            sched.submit_packed(unit(pts)).unwrap();
        }
        sched.stop().unwrap();
        assert_eq!(sched.state(), OutputState::Stopped);
        assert_eq!(sched.available_slots(), sched.capacity());
        assert_eq!(device.inner.lock().unwrap().stops, 1);
        // Terminal: stopping again is a no-op.
        sched.stop().unwrap();
        assert_eq!(device.inner.lock().unwrap().stops, 1);
    }
}
