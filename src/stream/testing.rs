//! Scripted source and recording listeners shared by the unit tests.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::core::SourceError;
use crate::playback::on_pull_loop_thread;
use crate::stream::{AudioFormatDescriptor, ImageStreamListener, MediaHandle, NativeMediaSource, StreamListener};

/// Polls `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
}

struct ScriptState {
    next_handle: u64,
    opened: Vec<PathBuf>,
    open_error: Option<i32>,
    has_video: bool,
    has_audio: bool,
    video_script: VecDeque<u32>,
    audio_script: VecDeque<bool>,
    stop_after_script: bool,
    fail_video_after_script: bool,
    stop_flag: Option<Arc<AtomicBool>>,
    calls: Vec<String>,
    speed: f32,
    play_sound: bool,
    width: u32,
    height: u32,
    current_time: f64,
    codec: String,
    sample_rate: f32,
    sample_size_bits: u16,
    channels: u16,
    frame_size: u32,
    pull_delay: Option<Duration>,
}

/// Native source double driven by per-medium scripts. Once a script runs out
/// the source reports "no data" after a short sleep, like an idle decoder.
pub struct ScriptedSource {
    state: Mutex<ScriptState>,
    open_blocked: Mutex<bool>,
    open_released: Condvar,
    stop_blocked: Mutex<bool>,
    stop_released: Condvar,
    pulls_in_flight: AtomicUsize,
    closed_during_pull: AtomicBool,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ScriptState {
                next_handle: 1,
                opened: Vec::new(),
                open_error: None,
                has_video: true,
                has_audio: true,
                video_script: VecDeque::new(),
                audio_script: VecDeque::new(),
                stop_after_script: false,
                fail_video_after_script: false,
                stop_flag: None,
                calls: Vec::new(),
                speed: 1.0,
                play_sound: false,
                width: 4,
                height: 2,
                current_time: 0.0,
                codec: "pcm_s16le".to_string(),
                sample_rate: 44100.0,
                sample_size_bits: 16,
                channels: 1,
                frame_size: 2,
                pull_delay: None,
            }),
            open_blocked: Mutex::new(false),
            open_released: Condvar::new(),
            stop_blocked: Mutex::new(false),
            stop_released: Condvar::new(),
            pulls_in_flight: AtomicUsize::new(0),
            closed_during_pull: AtomicBool::new(false),
        }
    }

    pub fn script_video(&self, frames: &[u32]) {
        self.state.lock().unwrap().video_script.extend(frames.iter().copied());
    }

    pub fn script_audio(&self, chunks: &[bool]) {
        self.state.lock().unwrap().audio_script.extend(chunks.iter().copied());
    }

    /// Sets the stop flag together with the last scripted unit.
    pub fn stop_after_script(&self, enabled: bool) {
        self.state.lock().unwrap().stop_after_script = enabled;
    }

    pub fn set_stop_flag(&self, flag: Arc<AtomicBool>) {
        self.state.lock().unwrap().stop_flag = Some(flag);
    }

    pub fn fail_video_after_script(&self, enabled: bool) {
        self.state.lock().unwrap().fail_video_after_script = enabled;
    }

    pub fn set_media(&self, video: bool, audio: bool) {
        let mut state = self.state.lock().unwrap();
        state.has_video = video;
        state.has_audio = audio;
    }

    pub fn set_open_error(&self, code: i32) {
        self.state.lock().unwrap().open_error = Some(code);
    }

    pub fn set_audio_params(&self, codec: &str, channels: u16, sample_size_bits: u16, frame_size: u32) {
        let mut state = self.state.lock().unwrap();
        state.codec = codec.to_string();
        state.channels = channels;
        state.sample_size_bits = sample_size_bits;
        state.frame_size = frame_size;
    }

    /// Makes every pull block for `delay` before answering, like a decoder
    /// stuck on a slow read.
    pub fn set_pull_delay(&self, delay: Duration) {
        self.state.lock().unwrap().pull_delay = Some(delay);
    }

    pub fn pulls_in_flight(&self) -> usize {
        self.pulls_in_flight.load(Ordering::SeqCst)
    }

    /// Whether `close` was called while a pull was still running.
    pub fn closed_during_pull(&self) -> bool {
        self.closed_during_pull.load(Ordering::SeqCst)
    }

    pub fn set_current_time(&self, time: f64) {
        self.state.lock().unwrap().current_time = time;
    }

    /// Makes `open` wait until `release_open` is called.
    pub fn block_open(&self) {
        *self.open_blocked.lock().unwrap() = true;
    }

    pub fn release_open(&self) {
        *self.open_blocked.lock().unwrap() = false;
        self.open_released.notify_all();
    }

    /// Makes `stop` record the call and then wait until `release_stop`.
    pub fn block_stop(&self) {
        *self.stop_blocked.lock().unwrap() = true;
    }

    pub fn release_stop(&self) {
        *self.stop_blocked.lock().unwrap() = false;
        self.stop_released.notify_all();
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().unwrap().opened.len()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self, name: &str) -> usize {
        self.state.lock().unwrap().calls.iter().filter(|c| c.as_str() == name).count()
    }

    pub fn play_sound(&self) -> bool {
        self.state.lock().unwrap().play_sound
    }

    fn record(&self, call: &str) {
        self.state.lock().unwrap().calls.push(call.to_string());
    }

    /// Pops the next scripted value; raises the stop flag when it was the last.
    fn next_scripted<T>(state: &mut ScriptState, pick: impl FnOnce(&mut ScriptState) -> Option<T>) -> Option<T> {
        let value = pick(state)?;
        let exhausted = state.video_script.is_empty() && state.audio_script.is_empty();
        if exhausted && state.stop_after_script {
            if let Some(flag) = &state.stop_flag {
                flag.store(true, Ordering::SeqCst);
            }
        }
        Some(value)
    }

    fn idle() {
        thread::sleep(Duration::from_millis(1));
    }

    /// Counts the pull as in flight while `pull` runs, after the optional delay.
    fn tracked_pull<T>(&self, pull: impl FnOnce() -> T) -> T {
        self.pulls_in_flight.fetch_add(1, Ordering::SeqCst);
        let delay = self.state.lock().unwrap().pull_delay;
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        let result = pull();
        self.pulls_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl NativeMediaSource for ScriptedSource {
    fn open(&self, path: &Path, _version: &str, _audio_format: &AudioFormatDescriptor) -> Result<MediaHandle, i32> {
        {
            let mut blocked = self.open_blocked.lock().unwrap();
            while *blocked {
                blocked = self.open_released.wait(blocked).unwrap();
            }
        }

        let mut state = self.state.lock().unwrap();
        state.opened.push(path.to_path_buf());
        if let Some(code) = state.open_error {
            return Err(code);
        }
        let handle = MediaHandle(state.next_handle);
        state.next_handle += 1;
        Ok(handle)
    }

    fn has_video_stream(&self, _handle: MediaHandle) -> bool {
        self.state.lock().unwrap().has_video
    }

    fn has_audio_stream(&self, _handle: MediaHandle) -> bool {
        self.state.lock().unwrap().has_audio
    }

    fn play(&self, _handle: MediaHandle) {
        self.record("play");
    }

    fn pause(&self, _handle: MediaHandle) {
        self.record("pause");
    }

    fn stop(&self, _handle: MediaHandle) {
        self.record("stop");
        let mut blocked = self.stop_blocked.lock().unwrap();
        while *blocked {
            blocked = self.stop_released.wait(blocked).unwrap();
        }
    }

    fn close(&self, _handle: MediaHandle) {
        if self.pulls_in_flight() > 0 {
            self.closed_during_pull.store(true, Ordering::SeqCst);
        }
        self.record("close");
    }

    fn seek(&self, _handle: MediaHandle, time: f64) {
        let mut state = self.state.lock().unwrap();
        state.current_time = time;
        state.calls.push("seek".to_string());
    }

    fn reset(&self, _handle: MediaHandle) {
        let mut state = self.state.lock().unwrap();
        state.current_time = 0.0;
        state.calls.push("reset".to_string());
    }

    fn set_speed(&self, _handle: MediaHandle, speed: f32) {
        let mut state = self.state.lock().unwrap();
        state.speed = speed;
        state.calls.push("set_speed".to_string());
    }

    fn speed(&self, _handle: MediaHandle) -> f32 {
        self.state.lock().unwrap().speed
    }

    fn set_play_sound(&self, _handle: MediaHandle, play_sound: bool) -> bool {
        let mut state = self.state.lock().unwrap();
        std::mem::replace(&mut state.play_sound, play_sound)
    }

    fn set_audio_sync_delay(&self, _handle: MediaHandle, _delay_ms: i64) {
        self.record("set_audio_sync_delay");
    }

    fn set_view(&self, _handle: MediaHandle, _x0: u32, _y0: u32, width: u32, height: u32) -> bool {
        let mut state = self.state.lock().unwrap();
        state.width = width;
        state.height = height;
        state.calls.push("set_view".to_string());
        true
    }

    fn pull_next_video_frame(&self, _handle: MediaHandle) -> Result<u32, SourceError> {
        self.tracked_pull(|| {
            let mut state = self.state.lock().unwrap();
            if let Some(frames) = Self::next_scripted(&mut state, |s| s.video_script.pop_front()) {
                return Ok(frames);
            }
            if state.fail_video_after_script {
                return Err(SourceError::Native("decoder crashed".to_string()));
            }
            drop(state);
            Self::idle();
            Ok(0)
        })
    }

    fn read_image(&self, _handle: MediaHandle, buffer: &mut [u8]) -> usize {
        buffer.fill(0x7f);
        buffer.len()
    }

    fn width(&self, _handle: MediaHandle) -> u32 {
        self.state.lock().unwrap().width
    }

    fn height(&self, _handle: MediaHandle) -> u32 {
        self.state.lock().unwrap().height
    }

    fn color_channels(&self, _handle: MediaHandle) -> u32 {
        3
    }

    fn pull_next_audio_chunk(&self, _handle: MediaHandle) -> Result<bool, SourceError> {
        self.tracked_pull(|| {
            let mut state = self.state.lock().unwrap();
            if let Some(chunk) = Self::next_scripted(&mut state, |s| s.audio_script.pop_front()) {
                return Ok(chunk);
            }
            drop(state);
            Self::idle();
            Ok(false)
        })
    }

    fn read_audio(&self, _handle: MediaHandle, buffer: &mut [u8]) -> usize {
        buffer.fill(0);
        buffer.len()
    }

    fn sample_rate(&self, _handle: MediaHandle) -> f32 {
        self.state.lock().unwrap().sample_rate
    }

    fn sample_size_bits(&self, _handle: MediaHandle) -> u16 {
        self.state.lock().unwrap().sample_size_bits
    }

    fn audio_channels(&self, _handle: MediaHandle) -> u16 {
        self.state.lock().unwrap().channels
    }

    fn frame_size(&self, _handle: MediaHandle) -> u32 {
        self.state.lock().unwrap().frame_size
    }

    fn frame_rate(&self, _handle: MediaHandle) -> f32 {
        self.state.lock().unwrap().sample_rate
    }

    fn codec_name(&self, _handle: MediaHandle) -> String {
        self.state.lock().unwrap().codec.clone()
    }

    fn start_time(&self, _handle: MediaHandle) -> f64 {
        0.0
    }

    fn end_time(&self, _handle: MediaHandle) -> f64 {
        10.0
    }

    fn duration(&self, _handle: MediaHandle) -> f64 {
        10.0
    }

    fn current_time(&self, _handle: MediaHandle) -> f64 {
        self.state.lock().unwrap().current_time
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Opened,
    Started,
    NewImageSize(u32, u32),
    /// Payload length.
    Data(usize),
    Stopped,
    Closed,
}

/// Listener that records every callback in order.
pub struct RecordingListener {
    events: Mutex<Vec<Event>>,
    fail_data: bool,
    started_on_loop_thread: Mutex<Option<bool>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            fail_data: false,
            started_on_loop_thread: Mutex::new(None),
        })
    }

    /// Records like `new` but rejects every data unit.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            fail_data: true,
            started_on_loop_thread: Mutex::new(None),
        })
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn data_count(&self) -> usize {
        self.data_lengths().len()
    }

    pub fn data_lengths(&self) -> Vec<usize> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                Event::Data(len) => Some(*len),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, event: &Event) -> usize {
        self.events.lock().unwrap().iter().filter(|e| *e == event).count()
    }

    pub fn started_on_loop_thread(&self) -> Option<bool> {
        *self.started_on_loop_thread.lock().unwrap()
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl StreamListener for RecordingListener {
    fn stream_opened(&self) -> anyhow::Result<()> {
        self.push(Event::Opened);
        Ok(())
    }

    fn stream_data(&self, data: &[u8]) -> anyhow::Result<()> {
        self.push(Event::Data(data.len()));
        if self.fail_data {
            anyhow::bail!("sink rejected {} bytes", data.len());
        }
        Ok(())
    }

    fn stream_started(&self) -> anyhow::Result<()> {
        *self.started_on_loop_thread.lock().unwrap() = Some(on_pull_loop_thread());
        self.push(Event::Started);
        Ok(())
    }

    fn stream_stopped(&self) -> anyhow::Result<()> {
        self.push(Event::Stopped);
        Ok(())
    }

    fn stream_closed(&self) -> anyhow::Result<()> {
        self.push(Event::Closed);
        Ok(())
    }
}

impl ImageStreamListener for RecordingListener {
    fn stream_new_image_size(&self, width: u32, height: u32) -> anyhow::Result<()> {
        self.push(Event::NewImageSize(width, height));
        Ok(())
    }
}
