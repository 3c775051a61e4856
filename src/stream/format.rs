use serde::{Deserialize, Serialize};

use crate::core::OpenError;

/// Size of one audio chunk handed to audio listeners.
pub const AUDIO_BUFFER_SIZE: usize = 64 * 1024;

/// Colour spaces a host may request for decoded images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorSpace {
    Srgb,
    LinearRgb,
    Gray,
    CieXyz,
    PhotoYcc,
}

impl ColorSpace {
    pub fn is_supported(self) -> bool {
        matches!(self, ColorSpace::Srgb)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioEncoding {
    PcmSigned,
    PcmUnsigned,
    PcmFloat,
    ULaw,
    ALaw,
    /// A native codec name with no PCM mapping.
    Other(String),
}

impl AudioEncoding {
    /// Maps a native codec name onto an encoding. Unknown names pass through
    /// as `Other` and fail the allow-list later.
    pub fn from_codec_name(codec: &str) -> Self {
        let codec = codec.to_lowercase();
        match codec.as_str() {
            "pcm_u8" | "pcm_u16le" => AudioEncoding::PcmUnsigned,
            "pcm_s8" | "pcm_s16le" => AudioEncoding::PcmSigned,
            _ => AudioEncoding::Other(codec),
        }
    }
}

/// Audio format requested by the host and later reported by the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFormatDescriptor {
    pub sample_rate: f32,
    pub sample_size_bits: u16,
    pub channels: u16,
    /// Bytes per frame across all channels.
    pub frame_size: u32,
    pub frame_rate: f32,
    pub encoding: AudioEncoding,
    pub big_endian: bool,
}

impl AudioFormatDescriptor {
    pub fn mono_signed() -> Self {
        Self {
            sample_rate: 44_100.0,
            sample_size_bits: 16,
            channels: 1,
            frame_size: 2,
            frame_rate: 44_100.0,
            encoding: AudioEncoding::PcmSigned,
            big_endian: false,
        }
    }

    pub fn stereo_unsigned() -> Self {
        Self {
            sample_rate: 44_100.0,
            sample_size_bits: 8,
            channels: 2,
            frame_size: 2,
            frame_rate: 44_100.0,
            encoding: AudioEncoding::PcmUnsigned,
            big_endian: false,
        }
    }

    /// Only mono signed PCM and stereo unsigned PCM can be decoded into.
    pub fn is_supported(&self) -> bool {
        matches!(
            (self.channels, &self.encoding),
            (1, AudioEncoding::PcmSigned) | (2, AudioEncoding::PcmUnsigned)
        )
    }
}

impl Default for AudioFormatDescriptor {
    fn default() -> Self {
        Self::mono_signed()
    }
}

impl std::fmt::Display for AudioFormatDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} {} Hz, {} bit, {} channel(s), {} bytes/frame",
            self.encoding, self.sample_rate, self.sample_size_bits, self.channels, self.frame_size
        )
    }
}

/// Pixel geometry of the video stream (or of the current view).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamGeometry {
    pub width: u32,
    pub height: u32,
    pub color_channels: u32,
}

impl StreamGeometry {
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * self.color_channels as usize
    }

    /// Whether the window `[x0, x0 + width] x [y0, y0 + height]` lies inside
    /// this geometry.
    pub fn contains_window(&self, x0: u32, y0: u32, width: u32, height: u32) -> bool {
        x0.checked_add(width).is_some_and(|right| right <= self.width)
            && y0.checked_add(height).is_some_and(|bottom| bottom <= self.height)
    }
}

/// Checks the requested formats before any native call is made.
pub fn validate_request(
    color_space: ColorSpace,
    audio_format: &AudioFormatDescriptor,
) -> Result<(), OpenError> {
    if !color_space.is_supported() {
        return Err(OpenError::UnsupportedColorSpace(color_space));
    }
    if !audio_format.is_supported() {
        return Err(OpenError::UnsupportedAudioFormat(audio_format.clone()));
    }
    Ok(())
}

/// Builds the negotiated audio format from what the source reports after
/// open. The reported frame size is per channel and gets multiplied out.
pub fn negotiate_audio_format(
    codec_name: &str,
    sample_rate: f32,
    sample_size_bits: u16,
    channels: u16,
    frame_size: u32,
    frame_rate: f32,
) -> Result<AudioFormatDescriptor, OpenError> {
    let mut negotiated = AudioFormatDescriptor {
        sample_rate,
        sample_size_bits,
        channels,
        frame_size,
        frame_rate,
        encoding: AudioEncoding::from_codec_name(codec_name),
        big_endian: false,
    };
    let Some(total) = frame_size.checked_mul(u32::from(channels)) else {
        return Err(OpenError::UnsupportedAudioFormat(negotiated));
    };
    negotiated.frame_size = total;

    if negotiated.is_supported() {
        Ok(negotiated)
    } else {
        Err(OpenError::UnsupportedAudioFormat(negotiated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_srgb_is_supported() {
        assert!(ColorSpace::Srgb.is_supported());
        for cs in [ColorSpace::LinearRgb, ColorSpace::Gray, ColorSpace::CieXyz, ColorSpace::PhotoYcc] {
            assert!(!cs.is_supported(), "{:?} should be rejected", cs);
        }
    }

    #[test]
    fn test_audio_allow_list() {
        assert!(AudioFormatDescriptor::mono_signed().is_supported());
        assert!(AudioFormatDescriptor::stereo_unsigned().is_supported());

        let mut mono_unsigned = AudioFormatDescriptor::mono_signed();
        mono_unsigned.encoding = AudioEncoding::PcmUnsigned;
        assert!(!mono_unsigned.is_supported());

        let mut stereo_signed = AudioFormatDescriptor::stereo_unsigned();
        stereo_signed.encoding = AudioEncoding::PcmSigned;
        assert!(!stereo_signed.is_supported());

        let mut surround = AudioFormatDescriptor::stereo_unsigned();
        surround.channels = 6;
        assert!(!surround.is_supported());
    }

    #[test]
    fn test_codec_name_mapping() {
        assert_eq!(AudioEncoding::from_codec_name("pcm_u8"), AudioEncoding::PcmUnsigned);
        assert_eq!(AudioEncoding::from_codec_name("PCM_U16LE"), AudioEncoding::PcmUnsigned);
        assert_eq!(AudioEncoding::from_codec_name("pcm_s8"), AudioEncoding::PcmSigned);
        assert_eq!(AudioEncoding::from_codec_name("pcm_s16le"), AudioEncoding::PcmSigned);
        assert_eq!(
            AudioEncoding::from_codec_name("aac"),
            AudioEncoding::Other("aac".to_string())
        );
    }

    #[test]
    fn test_negotiation_rejects_unmapped_codec() {
        let result = negotiate_audio_format("mp3", 44_100.0, 16, 1, 2, 44_100.0);
        assert!(matches!(result, Err(OpenError::UnsupportedAudioFormat(_))));
    }

    #[test]
    fn test_negotiation_multiplies_frame_size_by_channels() {
        let format = negotiate_audio_format("pcm_u8", 48_000.0, 8, 2, 1, 48_000.0).unwrap();
        assert_eq!(format.encoding, AudioEncoding::PcmUnsigned);
        assert_eq!(format.frame_size, 2);
    }

    #[test]
    fn test_negotiation_rejects_overflowing_frame_size() {
        match negotiate_audio_format("pcm_u8", 48_000.0, 8, 2, u32::MAX, 48_000.0) {
            Err(OpenError::UnsupportedAudioFormat(format)) => assert_eq!(format.frame_size, u32::MAX),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_request_checks_color_space_first() {
        let mut bad_audio = AudioFormatDescriptor::mono_signed();
        bad_audio.channels = 2;
        let err = validate_request(ColorSpace::Gray, &bad_audio).unwrap_err();
        assert!(matches!(err, OpenError::UnsupportedColorSpace(ColorSpace::Gray)));

        let err = validate_request(ColorSpace::Srgb, &bad_audio).unwrap_err();
        assert!(matches!(err, OpenError::UnsupportedAudioFormat(_)));

        assert!(validate_request(ColorSpace::Srgb, &AudioFormatDescriptor::stereo_unsigned()).is_ok());
    }

    #[test]
    fn test_window_containment() {
        let geometry = StreamGeometry { width: 640, height: 360, color_channels: 3 };
        assert!(geometry.contains_window(0, 0, 640, 360));
        assert!(geometry.contains_window(70, 50, 300, 200));
        assert!(!geometry.contains_window(400, 0, 300, 100));
        assert!(!geometry.contains_window(0, 300, 10, 100));
        assert!(!geometry.contains_window(u32::MAX, 0, 2, 2));
        assert_eq!(geometry.frame_len(), 640 * 360 * 3);
    }
}
