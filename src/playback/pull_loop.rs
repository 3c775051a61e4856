// =============================================================================
// PULL LOOPS - ONE WORKER PER MEDIUM
// =============================================================================
//
// Each loop repeatedly pulls one unit (audio chunk or video frame) from the
// native source and fans it out to the listeners of its medium:
//
//   stream_started -> { pull -> broadcast | stall }* -> stream_stopped
//
// The stop flag is checked once per iteration; a pull in flight always
// completes. No sleeping between pulls unless a stall backoff is configured.
//
// =============================================================================

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::core::{PlaybackStatus, SourceError, StatusCell};
use crate::stream::{
    BroadcastReport, ImageStreamListener, ListenerRegistry, MediaHandle, NativeMediaSource, StreamListener,
    AUDIO_BUFFER_SIZE,
};

thread_local! {
    static ON_PULL_LOOP: Cell<bool> = const { Cell::new(false) };
}

/// Whether the calling thread is currently running a pull loop. Transport
/// calls made from listener callbacks use this to avoid waiting on their own
/// loop.
pub fn on_pull_loop_thread() -> bool {
    ON_PULL_LOOP.with(|flag| flag.get())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Medium {
    Audio,
    Video,
}

/// Counters reported when a loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// Units broadcast to listeners.
    pub units: u64,
    /// Source frames consumed; exceeds `units` when video frames were skipped.
    pub frames_consumed: u64,
    pub stalls: u64,
    pub listener_failures: u64,
    pub halted: bool,
}

/// State shared by both loops of one playback run.
#[derive(Clone)]
pub struct LoopContext {
    pub source: Arc<dyn NativeMediaSource>,
    pub handle: MediaHandle,
    pub status: Arc<StatusCell>,
    /// Shared by the audio and video loop of one run; set by stop/pause/close
    /// and by a loop that hit an unrecoverable failure.
    pub stop_flag: Arc<AtomicBool>,
    pub stall_backoff: Option<Duration>,
}

/// Result of one pull attempt.
enum Pulled {
    /// A unit was broadcast after consuming this many source frames.
    Unit { frames: u32, report: BroadcastReport },
    NoData,
}

/// The medium-specific half of a pull loop.
trait PullUnit {
    fn medium(&self) -> Medium;
    fn broadcast_started(&self) -> BroadcastReport;
    fn pull(&mut self, ctx: &LoopContext) -> Result<Pulled, SourceError>;
    fn broadcast_stopped(&self) -> BroadcastReport;
}

fn drive(mut unit: impl PullUnit, ctx: &LoopContext) -> LoopStats {
    let medium = unit.medium();
    let mut stats = LoopStats::default();

    ON_PULL_LOOP.with(|flag| flag.set(true));
    log::info!("Stream {}: Starting {:?} pull loop", ctx.handle, medium);

    stats.listener_failures += unit.broadcast_started().failed as u64;

    while !ctx.stop_flag.load(Ordering::SeqCst) {
        match unit.pull(ctx) {
            Ok(Pulled::Unit { frames, report }) => {
                stats.units += 1;
                stats.frames_consumed += u64::from(frames);
                stats.listener_failures += report.failed as u64;
            }
            Ok(Pulled::NoData) => {
                stats.stalls += 1;
                if ctx.status.transition_if(PlaybackStatus::is_streaming, PlaybackStatus::Stalled) {
                    log::debug!("Stream {}: {:?} stalled", ctx.handle, medium);
                }
                if let Some(backoff) = ctx.stall_backoff {
                    thread::sleep(backoff);
                }
            }
            Err(e) => {
                log::error!("Stream {}: {:?} pull failed, halting playback: {}", ctx.handle, medium, e);
                ctx.status.transition(PlaybackStatus::Halted);
                // Take the sibling loop down with us
                ctx.stop_flag.store(true, Ordering::SeqCst);
                stats.halted = true;
            }
        }
    }

    stats.listener_failures += unit.broadcast_stopped().failed as u64;

    log::info!(
        "Stream {}: Stopped {:?} pull loop ({} units, {} frames, {} stalls)",
        ctx.handle,
        medium,
        stats.units,
        stats.frames_consumed,
        stats.stalls
    );
    ON_PULL_LOOP.with(|flag| flag.set(false));
    stats
}

/// Marks the run as playing unless it was stopped, paused or halted meanwhile.
fn mark_playing(ctx: &LoopContext) {
    ctx.status.transition_if(PlaybackStatus::is_streaming, PlaybackStatus::Playing);
}

// =============================================================================
// AUDIO
// =============================================================================

pub struct AudioPullLoop {
    listeners: Arc<ListenerRegistry<dyn StreamListener>>,
    buffer: Vec<u8>,
}

impl AudioPullLoop {
    pub fn new(listeners: Arc<ListenerRegistry<dyn StreamListener>>) -> Self {
        Self {
            listeners,
            buffer: vec![0; AUDIO_BUFFER_SIZE],
        }
    }

    pub fn run(self, ctx: &LoopContext) -> LoopStats {
        drive(self, ctx)
    }
}

impl PullUnit for AudioPullLoop {
    fn medium(&self) -> Medium {
        Medium::Audio
    }

    fn broadcast_started(&self) -> BroadcastReport {
        self.listeners.broadcast_lifecycle("stream_started", true, |l| l.stream_started())
    }

    fn pull(&mut self, ctx: &LoopContext) -> Result<Pulled, SourceError> {
        if !ctx.source.pull_next_audio_chunk(ctx.handle)? {
            return Ok(Pulled::NoData);
        }

        let len = ctx.source.read_audio(ctx.handle, &mut self.buffer).min(self.buffer.len());
        mark_playing(ctx);
        let chunk = &self.buffer[..len];
        let report = self.listeners.broadcast("stream_data", |l| l.stream_data(chunk));
        Ok(Pulled::Unit { frames: 1, report })
    }

    fn broadcast_stopped(&self) -> BroadcastReport {
        self.listeners.broadcast_lifecycle("stream_stopped", false, |l| l.stream_stopped())
    }
}

// =============================================================================
// VIDEO
// =============================================================================

pub struct VideoPullLoop {
    listeners: Arc<ListenerRegistry<dyn ImageStreamListener>>,
    buffer: Vec<u8>,
}

impl VideoPullLoop {
    pub fn new(listeners: Arc<ListenerRegistry<dyn ImageStreamListener>>) -> Self {
        Self {
            listeners,
            buffer: Vec::new(),
        }
    }

    pub fn run(self, ctx: &LoopContext) -> LoopStats {
        drive(self, ctx)
    }
}

impl PullUnit for VideoPullLoop {
    fn medium(&self) -> Medium {
        Medium::Video
    }

    fn broadcast_started(&self) -> BroadcastReport {
        self.listeners.broadcast_lifecycle("stream_started", true, |l| l.stream_started())
    }

    fn pull(&mut self, ctx: &LoopContext) -> Result<Pulled, SourceError> {
        let (frames, report) =
            deliver_next_frame(ctx.source.as_ref(), ctx.handle, &self.listeners, &mut self.buffer, || {
                mark_playing(ctx)
            })?;
        if frames == 0 {
            Ok(Pulled::NoData)
        } else {
            Ok(Pulled::Unit { frames, report })
        }
    }

    fn broadcast_stopped(&self) -> BroadcastReport {
        self.listeners.broadcast_lifecycle("stream_stopped", false, |l| l.stream_stopped())
    }
}

/// Pulls the next image and, if there is one, sends its geometry and bytes
/// to every video listener. Skipped frames are never broadcast: only the
/// latest image is delivered regardless of the frame count.
///
/// `on_frame` runs after the pull succeeded and before the broadcast.
pub(crate) fn deliver_next_frame(
    source: &dyn NativeMediaSource,
    handle: MediaHandle,
    listeners: &ListenerRegistry<dyn ImageStreamListener>,
    buffer: &mut Vec<u8>,
    on_frame: impl FnOnce(),
) -> Result<(u32, BroadcastReport), SourceError> {
    let frames = source.pull_next_video_frame(handle)?;
    if frames == 0 {
        return Ok((0, BroadcastReport::default()));
    }

    // The geometry may change between frames
    let geometry = source.geometry(handle);
    buffer.resize(geometry.frame_len(), 0);
    let len = source.read_image(handle, buffer).min(buffer.len());
    on_frame();

    let image = &buffer[..len];
    let report = listeners.broadcast("stream_data", |l| {
        let sized = l.stream_new_image_size(geometry.width, geometry.height);
        let data = l.stream_data(image);
        sized.and(data)
    });
    Ok((frames, report))
}
