use std::path::PathBuf;

use thiserror::Error;

use crate::core::PlaybackStatus;
use crate::stream::{AudioFormatDescriptor, ColorSpace};

/// Failures of the asynchronous open sequence. These are recorded on the
/// controller and queried with `error()` / `has_error()`.
#[derive(Debug, Clone, Error)]
pub enum OpenError {
    #[error("Color space {0:?} is not supported")]
    UnsupportedColorSpace(ColorSpace),

    #[error("Audio format {0} is not supported")]
    UnsupportedAudioFormat(AudioFormatDescriptor),

    #[error("Error {code} occurred while opening {}", path.display())]
    NativeOpenFailure { code: i32, path: PathBuf },
}

/// Unrecoverable failure reported by the native media source.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("Native source failure: {0}")]
    Native(String),

    #[error("Media handle {0} is not open")]
    InvalidHandle(u64),
}

/// Rejected transport calls.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("Time {time} is not in range [{start}, {end}]")]
    SeekOutOfRange { time: f64, start: f64, end: f64 },

    #[error("Speed {speed} is not in range [{min}, {max}]")]
    SpeedOutOfRange { speed: f32, min: f32, max: f32 },

    #[error("View window {x0},{y0} {width}x{height} is outside the {stream_width}x{stream_height} stream")]
    ViewOutOfBounds {
        x0: u32,
        y0: u32,
        width: u32,
        height: u32,
        stream_width: u32,
        stream_height: u32,
    },

    #[error("No video stream available")]
    NoVideoStream,

    #[error("Operation not allowed while {0:?}")]
    InvalidState(PlaybackStatus),

    #[error("Playback halted after a native failure")]
    Halted,
}
