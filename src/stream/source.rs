use std::path::Path;

use crate::core::SourceError;
use crate::stream::{AudioFormatDescriptor, StreamGeometry};

/// Opaque identifier of one stream opened by a `NativeMediaSource`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MediaHandle(pub u64);

impl std::fmt::Display for MediaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Native decoding engine. The controller receives one instance at
/// construction and reaches the decoder only through it.
///
/// Pull calls are expected to block or to pace themselves; the pull loops
/// call them back to back.
pub trait NativeMediaSource: Send + Sync {
    /// Opens `path`, transcoding audio into `audio_format`. Returns the
    /// native error code on failure.
    fn open(&self, path: &Path, version: &str, audio_format: &AudioFormatDescriptor) -> Result<MediaHandle, i32>;

    fn has_video_stream(&self, handle: MediaHandle) -> bool;
    fn has_audio_stream(&self, handle: MediaHandle) -> bool;

    // Transport
    fn play(&self, handle: MediaHandle);
    fn pause(&self, handle: MediaHandle);
    fn stop(&self, handle: MediaHandle);
    fn close(&self, handle: MediaHandle);
    fn seek(&self, handle: MediaHandle, time: f64);
    /// Back to the start of the stream.
    fn reset(&self, handle: MediaHandle);
    fn set_speed(&self, handle: MediaHandle, speed: f32);
    fn speed(&self, handle: MediaHandle) -> f32;
    /// Enables or disables pulling sound. Returns the previous setting.
    fn set_play_sound(&self, handle: MediaHandle, play_sound: bool) -> bool;
    /// Positive values render audio later, negative values earlier.
    fn set_audio_sync_delay(&self, handle: MediaHandle, delay_ms: i64);
    /// Restricts decoded images to a window of the stream.
    fn set_view(&self, handle: MediaHandle, x0: u32, y0: u32, width: u32, height: u32) -> bool;

    // Video
    /// Loads the next image. Returns how many source frames were consumed:
    /// 0 for no data, more than 1 when frames were skipped to keep up with
    /// the playback speed.
    fn pull_next_video_frame(&self, handle: MediaHandle) -> Result<u32, SourceError>;
    /// Copies the most recently loaded image into `buffer`; returns the
    /// number of bytes written.
    fn read_image(&self, handle: MediaHandle, buffer: &mut [u8]) -> usize;
    /// Width of the images currently produced (the view).
    fn width(&self, handle: MediaHandle) -> u32;
    fn height(&self, handle: MediaHandle) -> u32;
    fn color_channels(&self, handle: MediaHandle) -> u32;

    // Audio
    /// Loads the next audio chunk. `false` means no data right now.
    fn pull_next_audio_chunk(&self, handle: MediaHandle) -> Result<bool, SourceError>;
    fn read_audio(&self, handle: MediaHandle, buffer: &mut [u8]) -> usize;
    fn sample_rate(&self, handle: MediaHandle) -> f32;
    fn sample_size_bits(&self, handle: MediaHandle) -> u16;
    fn audio_channels(&self, handle: MediaHandle) -> u16;
    /// Bytes per frame for a single channel.
    fn frame_size(&self, handle: MediaHandle) -> u32;
    fn frame_rate(&self, handle: MediaHandle) -> f32;
    fn codec_name(&self, handle: MediaHandle) -> String;

    // Clock
    fn start_time(&self, handle: MediaHandle) -> f64;
    fn end_time(&self, handle: MediaHandle) -> f64;
    fn duration(&self, handle: MediaHandle) -> f64;
    fn current_time(&self, handle: MediaHandle) -> f64;

    /// Geometry of the images currently produced.
    fn geometry(&self, handle: MediaHandle) -> StreamGeometry {
        StreamGeometry {
            width: self.width(handle),
            height: self.height(handle),
            color_channels: self.color_channels(handle),
        }
    }
}
