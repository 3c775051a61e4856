use std::collections::HashMap;
use std::f64::consts::TAU;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::core::SourceError;
use crate::stream::{AudioEncoding, AudioFormatDescriptor, MediaHandle, NativeMediaSource};

const TONE_HZ: f64 = 440.0;
const AUDIO_CHUNK_MILLIS: u64 = 100;
const MIN_PACING_SPEED: f64 = 1e-3;
/// Returned by `open` for an empty path.
pub const ERROR_NO_SUCH_FILE: i32 = -2;

/// Shape of the generated stream.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticConfig {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub duration: f64,
    pub has_video: bool,
    pub has_audio: bool,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            fps: 25.0,
            duration: 60.0,
            has_video: true,
            has_audio: true,
        }
    }
}

struct View {
    x0: u32,
    y0: u32,
    width: u32,
    height: u32,
}

struct SyntheticStream {
    format: AudioFormatDescriptor,
    playing: bool,
    play_sound: bool,
    speed: f32,
    /// Playback position in seconds.
    position: f64,
    frame_index: u64,
    video_clock: Instant,
    audio_clock: Instant,
    audio_phase: f64,
    sync_delay_ms: i64,
    view: View,
    chunk: Vec<u8>,
}

/// Deterministic stand-in for a decoder: gradient frames and a sine tone,
/// paced in real time by sleeping inside the pull calls.
pub struct SyntheticSource {
    config: SyntheticConfig,
    streams: Mutex<HashMap<MediaHandle, SyntheticStream>>,
    next_handle: Mutex<u64>,
}

impl SyntheticSource {
    /// A frame rate that is not a positive finite number falls back to the
    /// default rate.
    pub fn new(mut config: SyntheticConfig) -> Self {
        if !config.fps.is_finite() || config.fps <= 0.0 {
            let fallback = SyntheticConfig::default().fps;
            log::warn!("Synthetic source: invalid frame rate {}, using {}", config.fps, fallback);
            config.fps = fallback;
        }
        Self {
            config,
            streams: Mutex::new(HashMap::new()),
            next_handle: Mutex::new(1),
        }
    }

    fn streams(&self) -> MutexGuard<'_, HashMap<MediaHandle, SyntheticStream>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` on the stream, or returns `default` for an unknown handle.
    fn with_stream<T>(&self, handle: MediaHandle, default: T, f: impl FnOnce(&mut SyntheticStream) -> T) -> T {
        match self.streams().get_mut(&handle) {
            Some(stream) => f(stream),
            None => {
                log::warn!("Synthetic source: unknown handle {}", handle);
                default
            }
        }
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.config.fps)
    }

    fn pixel(&self, x: u32, y: u32, frame_index: u64) -> [u8; 3] {
        let shift = frame_index as u32;
        [
            ((x.wrapping_add(shift)) % 256) as u8,
            (y % 256) as u8,
            (frame_index % 256) as u8,
        ]
    }

    /// Fills `stream.chunk` with the next slice of the tone.
    fn render_chunk(stream: &mut SyntheticStream) {
        let format = &stream.format;
        let samples = (format.sample_rate as u64 * AUDIO_CHUNK_MILLIS / 1000) as usize;
        let channels = usize::from(format.channels);
        let step = TAU * TONE_HZ / f64::from(format.sample_rate);

        stream.chunk.clear();
        for _ in 0..samples {
            let value = (stream.audio_phase.sin() * 0.25) as f32;
            stream.audio_phase = (stream.audio_phase + step) % TAU;
            for _ in 0..channels {
                match (&format.encoding, format.sample_size_bits) {
                    (AudioEncoding::PcmUnsigned, 8) => stream.chunk.push((value * 127.0 + 128.0) as u8),
                    _ => stream
                        .chunk
                        .extend_from_slice(&((value * f32::from(i16::MAX)) as i16).to_le_bytes()),
                }
            }
        }
    }
}

impl NativeMediaSource for SyntheticSource {
    fn open(&self, path: &Path, version: &str, audio_format: &AudioFormatDescriptor) -> Result<MediaHandle, i32> {
        if path.as_os_str().is_empty() {
            return Err(ERROR_NO_SUCH_FILE);
        }

        let handle = {
            let mut next = self.next_handle.lock().unwrap_or_else(PoisonError::into_inner);
            let handle = MediaHandle(*next);
            *next += 1;
            handle
        };

        log::debug!(
            "Synthetic source {}: {} opened for {} ({}x{} @ {} fps)",
            handle,
            path.display(),
            version,
            self.config.width,
            self.config.height,
            self.config.fps
        );

        let now = Instant::now();
        self.streams().insert(
            handle,
            SyntheticStream {
                format: audio_format.clone(),
                playing: false,
                play_sound: false,
                speed: 1.0,
                position: 0.0,
                frame_index: 0,
                video_clock: now,
                audio_clock: now,
                audio_phase: 0.0,
                sync_delay_ms: 0,
                view: View {
                    x0: 0,
                    y0: 0,
                    width: self.config.width,
                    height: self.config.height,
                },
                chunk: Vec::new(),
            },
        );
        Ok(handle)
    }

    fn has_video_stream(&self, _handle: MediaHandle) -> bool {
        self.config.has_video
    }

    fn has_audio_stream(&self, _handle: MediaHandle) -> bool {
        self.config.has_audio
    }

    fn play(&self, handle: MediaHandle) {
        self.with_stream(handle, (), |s| {
            let now = Instant::now();
            s.playing = true;
            s.video_clock = now;
            s.audio_clock = now + Duration::from_millis(s.sync_delay_ms.max(0) as u64);
        });
    }

    fn pause(&self, handle: MediaHandle) {
        self.with_stream(handle, (), |s| s.playing = false);
    }

    fn stop(&self, handle: MediaHandle) {
        self.with_stream(handle, (), |s| s.playing = false);
    }

    fn close(&self, handle: MediaHandle) {
        self.streams().remove(&handle);
    }

    fn seek(&self, handle: MediaHandle, time: f64) {
        let fps = self.config.fps;
        self.with_stream(handle, (), |s| {
            s.position = time;
            s.frame_index = (time * fps) as u64;
        });
    }

    fn reset(&self, handle: MediaHandle) {
        self.seek(handle, 0.0);
    }

    fn set_speed(&self, handle: MediaHandle, speed: f32) {
        self.with_stream(handle, (), |s| s.speed = speed);
    }

    fn speed(&self, handle: MediaHandle) -> f32 {
        self.with_stream(handle, 0.0, |s| s.speed)
    }

    fn set_play_sound(&self, handle: MediaHandle, play_sound: bool) -> bool {
        self.with_stream(handle, false, |s| std::mem::replace(&mut s.play_sound, play_sound))
    }

    fn set_audio_sync_delay(&self, handle: MediaHandle, delay_ms: i64) {
        self.with_stream(handle, (), |s| s.sync_delay_ms = delay_ms);
    }

    fn set_view(&self, handle: MediaHandle, x0: u32, y0: u32, width: u32, height: u32) -> bool {
        let (stream_width, stream_height) = (self.config.width, self.config.height);
        self.with_stream(handle, false, |s| {
            let fits = x0.checked_add(width).is_some_and(|r| r <= stream_width)
                && y0.checked_add(height).is_some_and(|b| b <= stream_height);
            if fits {
                s.view = View { x0, y0, width, height };
            }
            fits
        })
    }

    fn pull_next_video_frame(&self, handle: MediaHandle) -> Result<u32, SourceError> {
        let interval = self.frame_interval();
        let wait = {
            let mut streams = self.streams();
            let stream = streams.get_mut(&handle).ok_or(SourceError::InvalidHandle(handle.0))?;
            if !stream.playing || stream.position >= self.config.duration {
                None
            } else {
                let speed = f64::from(stream.speed.abs()).max(MIN_PACING_SPEED);
                let due = stream.video_clock + interval.div_f64(speed);
                Some(due.saturating_duration_since(Instant::now()))
            }
        };

        let Some(wait) = wait else {
            // Idle: behave like a blocking decoder with nothing to hand out
            thread::sleep(interval);
            return Ok(0);
        };
        thread::sleep(wait);

        let mut streams = self.streams();
        let stream = streams.get_mut(&handle).ok_or(SourceError::InvalidHandle(handle.0))?;
        if !stream.playing {
            return Ok(0);
        }

        // Catch up on frames we fell behind on
        let speed = f64::from(stream.speed.abs()).max(MIN_PACING_SPEED);
        let elapsed = stream.video_clock.elapsed().as_secs_f64() * speed;
        let frames = ((elapsed * self.config.fps) as u32).max(1);
        stream.video_clock += interval.mul_f64(f64::from(frames) / speed);

        let step = f64::from(frames) / self.config.fps;
        if stream.speed < 0.0 {
            stream.position = (stream.position - step).max(0.0);
            stream.frame_index = stream.frame_index.saturating_sub(u64::from(frames));
        } else {
            stream.position += step;
            stream.frame_index += u64::from(frames);
        }
        Ok(frames)
    }

    fn read_image(&self, handle: MediaHandle, buffer: &mut [u8]) -> usize {
        let streams = self.streams();
        let Some(stream) = streams.get(&handle) else {
            return 0;
        };

        let view = &stream.view;
        let mut written = 0;
        for y in view.y0..view.y0 + view.height {
            for x in view.x0..view.x0 + view.width {
                let Some(slot) = buffer.get_mut(written..written + 3) else {
                    return written;
                };
                slot.copy_from_slice(&self.pixel(x, y, stream.frame_index));
                written += 3;
            }
        }
        written
    }

    fn width(&self, handle: MediaHandle) -> u32 {
        self.with_stream(handle, 0, |s| s.view.width)
    }

    fn height(&self, handle: MediaHandle) -> u32 {
        self.with_stream(handle, 0, |s| s.view.height)
    }

    fn color_channels(&self, _handle: MediaHandle) -> u32 {
        3
    }

    fn pull_next_audio_chunk(&self, handle: MediaHandle) -> Result<bool, SourceError> {
        let chunk = Duration::from_millis(AUDIO_CHUNK_MILLIS);
        let wait = {
            let mut streams = self.streams();
            let stream = streams.get_mut(&handle).ok_or(SourceError::InvalidHandle(handle.0))?;
            if !stream.playing || !stream.play_sound || stream.position >= self.config.duration {
                None
            } else {
                Some((stream.audio_clock + chunk).saturating_duration_since(Instant::now()))
            }
        };

        let Some(wait) = wait else {
            thread::sleep(chunk);
            return Ok(false);
        };
        thread::sleep(wait);

        let mut streams = self.streams();
        let stream = streams.get_mut(&handle).ok_or(SourceError::InvalidHandle(handle.0))?;
        if !stream.playing {
            return Ok(false);
        }
        stream.audio_clock += chunk;
        Self::render_chunk(stream);
        Ok(true)
    }

    fn read_audio(&self, handle: MediaHandle, buffer: &mut [u8]) -> usize {
        self.with_stream(handle, 0, |s| {
            let len = s.chunk.len().min(buffer.len());
            buffer[..len].copy_from_slice(&s.chunk[..len]);
            len
        })
    }

    fn sample_rate(&self, handle: MediaHandle) -> f32 {
        self.with_stream(handle, 0.0, |s| s.format.sample_rate)
    }

    fn sample_size_bits(&self, handle: MediaHandle) -> u16 {
        self.with_stream(handle, 0, |s| s.format.sample_size_bits)
    }

    fn audio_channels(&self, handle: MediaHandle) -> u16 {
        self.with_stream(handle, 0, |s| s.format.channels)
    }

    fn frame_size(&self, handle: MediaHandle) -> u32 {
        self.with_stream(handle, 0, |s| u32::from(s.format.sample_size_bits / 8))
    }

    fn frame_rate(&self, handle: MediaHandle) -> f32 {
        self.with_stream(handle, 0.0, |s| s.format.frame_rate)
    }

    fn codec_name(&self, handle: MediaHandle) -> String {
        self.with_stream(handle, String::new(), |s| match s.format.encoding {
            AudioEncoding::PcmUnsigned => format!("pcm_u{}", s.format.sample_size_bits),
            _ => format!("pcm_s{}le", s.format.sample_size_bits),
        })
    }

    fn start_time(&self, _handle: MediaHandle) -> f64 {
        0.0
    }

    fn end_time(&self, _handle: MediaHandle) -> f64 {
        self.config.duration
    }

    fn duration(&self, _handle: MediaHandle) -> f64 {
        self.config.duration
    }

    fn current_time(&self, handle: MediaHandle) -> f64 {
        self.with_stream(handle, 0.0, |s| s.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{negotiate_audio_format, AUDIO_BUFFER_SIZE};

    fn fast() -> SyntheticSource {
        SyntheticSource::new(SyntheticConfig {
            width: 8,
            height: 4,
            fps: 200.0,
            duration: 5.0,
            has_video: true,
            has_audio: true,
        })
    }

    fn open(source: &SyntheticSource, format: &AudioFormatDescriptor) -> MediaHandle {
        source.open(Path::new("synthetic.mp4"), "test", format).unwrap()
    }

    #[test]
    fn test_empty_path_fails_to_open() {
        let source = fast();
        let result = source.open(Path::new(""), "test", &AudioFormatDescriptor::mono_signed());
        assert_eq!(result, Err(ERROR_NO_SUCH_FILE));
    }

    #[test]
    fn test_reported_format_negotiates_back_to_request() {
        let source = fast();
        for format in [AudioFormatDescriptor::mono_signed(), AudioFormatDescriptor::stereo_unsigned()] {
            let handle = open(&source, &format);
            let negotiated = negotiate_audio_format(
                &source.codec_name(handle),
                source.sample_rate(handle),
                source.sample_size_bits(handle),
                source.audio_channels(handle),
                source.frame_size(handle),
                source.frame_rate(handle),
            )
            .unwrap();
            assert_eq!(negotiated, format);
        }
    }

    #[test]
    fn test_no_frames_until_played() {
        let source = fast();
        let handle = open(&source, &AudioFormatDescriptor::mono_signed());
        assert_eq!(source.pull_next_video_frame(handle).unwrap(), 0);
        assert!(!source.pull_next_audio_chunk(handle).unwrap());

        source.play(handle);
        assert!(source.pull_next_video_frame(handle).unwrap() >= 1);
        assert!(source.current_time(handle) > 0.0);
    }

    #[test]
    fn test_invalid_frame_rate_falls_back_to_default() {
        for fps in [0.0, -5.0, f64::NAN, f64::INFINITY] {
            let source = SyntheticSource::new(SyntheticConfig {
                fps,
                duration: 5.0,
                ..SyntheticConfig::default()
            });
            let handle = open(&source, &AudioFormatDescriptor::mono_signed());
            source.play(handle);
            assert!(source.pull_next_video_frame(handle).unwrap() >= 1, "fps {}", fps);
        }
    }

    #[test]
    fn test_frames_change_over_time() {
        let source = fast();
        let handle = open(&source, &AudioFormatDescriptor::mono_signed());
        let geometry = source.geometry(handle);
        let mut first = vec![0; geometry.frame_len()];
        let mut second = vec![0; geometry.frame_len()];

        source.play(handle);
        source.pull_next_video_frame(handle).unwrap();
        assert_eq!(source.read_image(handle, &mut first), 8 * 4 * 3);
        source.pull_next_video_frame(handle).unwrap();
        source.read_image(handle, &mut second);
        assert_ne!(first, second);
    }

    #[test]
    fn test_view_changes_geometry() {
        let source = fast();
        let handle = open(&source, &AudioFormatDescriptor::mono_signed());
        assert!(source.set_view(handle, 2, 1, 4, 2));
        assert_eq!((source.width(handle), source.height(handle)), (4, 2));
        assert!(!source.set_view(handle, 6, 0, 4, 2));
    }

    #[test]
    fn test_audio_needs_sound_enabled() {
        let source = fast();
        let handle = open(&source, &AudioFormatDescriptor::mono_signed());
        source.play(handle);
        assert!(!source.pull_next_audio_chunk(handle).unwrap());

        assert!(!source.set_play_sound(handle, true));
        assert!(source.pull_next_audio_chunk(handle).unwrap());

        let mut buffer = vec![0; AUDIO_BUFFER_SIZE];
        // 100 ms of mono 16-bit at 44.1 kHz
        assert_eq!(source.read_audio(handle, &mut buffer), 4410 * 2);
        assert!(buffer[..8820].iter().any(|b| *b != 0));
    }

    #[test]
    fn test_closed_handle_is_a_source_error() {
        let source = fast();
        let handle = open(&source, &AudioFormatDescriptor::mono_signed());
        source.close(handle);
        assert!(matches!(
            source.pull_next_video_frame(handle),
            Err(SourceError::InvalidHandle(_))
        ));
    }
}
