//! Ready-made listeners: counters for diagnostics, a WAV recorder for the
//! audio medium and a PNG snapshot of the last video image.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use hound::{SampleFormat, WavSpec, WavWriter};

use crate::stream::{AudioEncoding, AudioFormatDescriptor, ImageStreamListener, StreamListener};

/// Counts what it receives and logs the stream lifecycle.
pub struct CountingSink {
    name: String,
    units: AtomicU64,
    bytes: AtomicU64,
    starts: AtomicU64,
}

impl CountingSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            units: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            starts: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn units(&self) -> u64 {
        self.units.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn starts(&self) -> u64 {
        self.starts.load(Ordering::Relaxed)
    }
}

impl StreamListener for CountingSink {
    fn stream_opened(&self) -> anyhow::Result<()> {
        log::info!("[{}] opened", self.name);
        Ok(())
    }

    fn stream_data(&self, data: &[u8]) -> anyhow::Result<()> {
        let units = self.units.fetch_add(1, Ordering::Relaxed) + 1;
        self.bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
        log::trace!("[{}] unit {} ({} bytes)", self.name, units, data.len());
        Ok(())
    }

    fn stream_started(&self) -> anyhow::Result<()> {
        self.starts.fetch_add(1, Ordering::Relaxed);
        log::info!("[{}] started", self.name);
        Ok(())
    }

    fn stream_stopped(&self) -> anyhow::Result<()> {
        log::info!("[{}] stopped after {} units", self.name, self.units());
        Ok(())
    }

    fn stream_closed(&self) -> anyhow::Result<()> {
        log::info!("[{}] closed", self.name);
        Ok(())
    }
}

impl ImageStreamListener for CountingSink {
    fn stream_new_image_size(&self, width: u32, height: u32) -> anyhow::Result<()> {
        log::trace!("[{}] image {}x{}", self.name, width, height);
        Ok(())
    }
}

/// Writes the received PCM chunks to a WAV file. The file is created on
/// `stream_opened` and finalized on `stream_closed`.
pub struct WavRecorder {
    path: PathBuf,
    format: AudioFormatDescriptor,
    writer: Mutex<Option<WavWriter<BufWriter<File>>>>,
    samples: AtomicU64,
}

impl WavRecorder {
    /// `format` must be the negotiated format of the stream (see
    /// `Session::audio_format`); only 16-bit signed and 8-bit unsigned PCM
    /// are accepted.
    pub fn new(path: impl Into<PathBuf>, format: AudioFormatDescriptor) -> anyhow::Result<Self> {
        match (&format.encoding, format.sample_size_bits) {
            (AudioEncoding::PcmSigned, 16) | (AudioEncoding::PcmUnsigned, 8) => {}
            _ => anyhow::bail!("Cannot record {} to WAV", format),
        }
        Ok(Self {
            path: path.into(),
            format,
            writer: Mutex::new(None),
            samples: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Samples written so far, counting every channel.
    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    fn spec(&self) -> WavSpec {
        WavSpec {
            channels: self.format.channels,
            sample_rate: self.format.sample_rate as u32,
            bits_per_sample: self.format.sample_size_bits,
            sample_format: SampleFormat::Int,
        }
    }
}

impl StreamListener for WavRecorder {
    fn stream_opened(&self) -> anyhow::Result<()> {
        let writer = WavWriter::create(&self.path, self.spec()).map_err(|e| {
            log::error!("Failed to create WAV writer at {}: {}", self.path.display(), e);
            anyhow::anyhow!("Failed to create WAV writer: {}", e)
        })?;
        *self.writer.lock().unwrap_or_else(PoisonError::into_inner) = Some(writer);
        log::info!("Recording audio to {}", self.path.display());
        Ok(())
    }

    fn stream_data(&self, data: &[u8]) -> anyhow::Result<()> {
        let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(writer) = guard.as_mut() else {
            anyhow::bail!("WAV recorder received data before the stream opened");
        };

        let written = if self.format.sample_size_bits == 16 {
            for pair in data.chunks_exact(2) {
                writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
            }
            data.len() / 2
        } else {
            // hound stores 8-bit samples unsigned but takes them signed
            for byte in data {
                writer.write_sample((i16::from(*byte) - 128) as i8)?;
            }
            data.len()
        };
        self.samples.fetch_add(written as u64, Ordering::Relaxed);
        Ok(())
    }

    fn stream_closed(&self) -> anyhow::Result<()> {
        let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(writer) = writer {
            writer.finalize().map_err(|e| {
                log::error!("Failed to finalize WAV file {}: {}", self.path.display(), e);
                anyhow::anyhow!("Failed to finalize WAV file: {}", e)
            })?;
            log::info!("Wrote {} samples to {}", self.samples(), self.path.display());
        }
        Ok(())
    }
}

struct Frame {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

/// Keeps the most recent RGB image and saves it as PNG when the stream
/// closes.
pub struct SnapshotSink {
    path: PathBuf,
    pending_size: Mutex<(u32, u32)>,
    last: Mutex<Option<Frame>>,
}

impl SnapshotSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pending_size: Mutex::new((0, 0)),
            last: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn has_frame(&self) -> bool {
        self.last.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Saves the last image. Returns `false` if there is nothing to save.
    pub fn save(&self) -> anyhow::Result<bool> {
        let last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(frame) = last.as_ref() else {
            return Ok(false);
        };

        let image = image::RgbImage::from_raw(frame.width, frame.height, frame.pixels.clone()).ok_or_else(|| {
            anyhow::anyhow!(
                "{} bytes do not make a {}x{} RGB image",
                frame.pixels.len(),
                frame.width,
                frame.height
            )
        })?;
        image.save(&self.path)?;
        log::info!("Saved {}x{} snapshot to {}", frame.width, frame.height, self.path.display());
        Ok(true)
    }
}

impl StreamListener for SnapshotSink {
    fn stream_data(&self, data: &[u8]) -> anyhow::Result<()> {
        let (width, height) = *self.pending_size.lock().unwrap_or_else(PoisonError::into_inner);
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        match last.as_mut() {
            Some(frame) => {
                frame.width = width;
                frame.height = height;
                frame.pixels.clear();
                frame.pixels.extend_from_slice(data);
            }
            None => {
                *last = Some(Frame {
                    width,
                    height,
                    pixels: data.to_vec(),
                })
            }
        }
        Ok(())
    }

    fn stream_closed(&self) -> anyhow::Result<()> {
        self.save()?;
        Ok(())
    }
}

impl ImageStreamListener for SnapshotSink {
    fn stream_new_image_size(&self, width: u32, height: u32) -> anyhow::Result<()> {
        *self.pending_size.lock().unwrap_or_else(PoisonError::into_inner) = (width, height);
        Ok(())
    }
}
