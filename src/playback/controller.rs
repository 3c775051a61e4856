// =============================================================================
// PLAYBACK CONTROLLER
// =============================================================================
//
// Owns one opened stream of a NativeMediaSource, its status, its two listener
// registries and the pull loops feeding them.
//
//   new() ──► [open pool] validate ─► native open ─► negotiate ─► READY
//                                                                  │
//   play() ──► native play ─► [loop pool] AudioPullLoop / VideoPullLoop
//   stop()/pause()/close() ──► stop flag ─► wait for loops
//
// Transport calls decide under the transport lock (lock order: transport,
// then handle/session/error) and issue native commands after releasing it.
// No lock is held across a native call, while waiting on a loop or while a
// registry broadcasts. Everything touching the native handle outside the
// lock holds an ActivityToken; close() releases the handle only after the
// last token is dropped, even when a loop outlives the join timeout.
//
// =============================================================================

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;

use crate::core::{OpenError, PlaybackStatus, PlayerConfig, Session, StatusCell, StatusEvent, TransportError};
use crate::playback::activity::{ActivityToken, ActivityTracker};
use crate::playback::pull_loop::{
    deliver_next_frame, on_pull_loop_thread, AudioPullLoop, LoopContext, VideoPullLoop,
};
use crate::playback::worker_pool::{JobHandle, WorkerPool};
use crate::stream::{
    negotiate_audio_format, validate_request, AudioFormatDescriptor, ColorSpace, ImageStreamListener, ListenerId,
    ListenerRegistry, MediaHandle, NativeMediaSource, StreamListener,
};

/// Speeds closer to zero than this mean "no playback".
pub const SPEED_EPSILON: f32 = f32::EPSILON;
pub const MAX_SPEED: f32 = 16.0;
pub const MIN_SPEED: f32 = -16.0;

/// Construction-time options of a `PlaybackController`.
#[derive(Clone)]
pub struct PlayerOptions {
    pub path: PathBuf,
    pub version: String,
    pub color_space: ColorSpace,
    pub audio_format: AudioFormatDescriptor,
    pub audio_listeners: Vec<Arc<dyn StreamListener>>,
    pub video_listeners: Vec<Arc<dyn ImageStreamListener>>,
    pub stall_backoff: Option<Duration>,
    pub loop_join_timeout: Duration,
}

impl PlayerOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::from_config(path, &PlayerConfig::default())
    }

    pub fn from_config(path: impl Into<PathBuf>, config: &PlayerConfig) -> Self {
        Self {
            path: path.into(),
            version: config.version.clone(),
            color_space: config.color_space,
            audio_format: config.audio_format.clone(),
            audio_listeners: Vec::new(),
            video_listeners: Vec::new(),
            stall_backoff: config.stall_backoff(),
            loop_join_timeout: config.loop_join_timeout(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_color_space(mut self, color_space: ColorSpace) -> Self {
        self.color_space = color_space;
        self
    }

    pub fn with_audio_format(mut self, audio_format: AudioFormatDescriptor) -> Self {
        self.audio_format = audio_format;
        self
    }

    pub fn with_audio_listener(mut self, listener: Arc<dyn StreamListener>) -> Self {
        self.audio_listeners.push(listener);
        self
    }

    pub fn with_video_listener(mut self, listener: Arc<dyn ImageStreamListener>) -> Self {
        self.video_listeners.push(listener);
        self
    }

    pub fn with_stall_backoff(mut self, backoff: Option<Duration>) -> Self {
        self.stall_backoff = backoff;
        self
    }

    pub fn with_loop_join_timeout(mut self, timeout: Duration) -> Self {
        self.loop_join_timeout = timeout;
        self
    }
}

impl std::fmt::Debug for PlayerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayerOptions")
            .field("path", &self.path)
            .field("version", &self.version)
            .field("color_space", &self.color_space)
            .field("audio_format", &self.audio_format)
            .field("audio_listeners", &self.audio_listeners.len())
            .field("video_listeners", &self.video_listeners.len())
            .field("stall_backoff", &self.stall_backoff)
            .field("loop_join_timeout", &self.loop_join_timeout)
            .finish()
    }
}

/// Loops of one play run. They share a stop flag.
struct RunningLoops {
    stop_flag: Arc<AtomicBool>,
    jobs: Vec<JobHandle>,
}

impl RunningLoops {
    fn is_live(&self) -> bool {
        !self.stop_flag.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Transport {
    /// play() arrived before the open finished.
    play_requested: bool,
    running: Option<RunningLoops>,
    /// step_forward() already sent stream_started to the video listeners.
    stepping: bool,
    closed: bool,
}

struct Inner {
    source: Arc<dyn NativeMediaSource>,
    path: PathBuf,
    version: String,
    color_space: ColorSpace,
    audio_format: AudioFormatDescriptor,
    stall_backoff: Option<Duration>,
    loop_join_timeout: Duration,

    status: Arc<StatusCell>,
    audio_listeners: Arc<ListenerRegistry<dyn StreamListener>>,
    video_listeners: Arc<ListenerRegistry<dyn ImageStreamListener>>,

    transport: Mutex<Transport>,
    handle: Mutex<Option<MediaHandle>>,
    session: Mutex<Option<Session>>,
    error: Mutex<Option<OpenError>>,
    step_buffer: Mutex<Vec<u8>>,

    /// Loops, launches and transport calls using the native handle; close()
    /// releases it through this once they are all done.
    handle_users: Arc<ActivityTracker>,
    /// One slot per medium.
    loop_pool: WorkerPool,
}

/// Single entry point for playing one media file through a native source.
///
/// Construction returns immediately; the file is opened on a background
/// worker. Poll `status()`/`has_error()`, subscribe with `subscribe_status()`
/// or block with `wait_for_open()`.
///
/// Transport calls may be made from any thread, including from listener
/// callbacks, with one exception: listener registration must not be called
/// from inside a callback of the registry it touches.
pub struct PlaybackController {
    inner: Arc<Inner>,
    open_job: Mutex<Option<JobHandle>>,
    // Dropped after `inner` so a pending open finishes first
    _open_pool: WorkerPool,
}

impl PlaybackController {
    pub fn new(source: Arc<dyn NativeMediaSource>, options: PlayerOptions) -> anyhow::Result<Self> {
        let audio_listeners: Arc<ListenerRegistry<dyn StreamListener>> = Arc::new(ListenerRegistry::new("audio"));
        for listener in options.audio_listeners {
            audio_listeners.add(listener);
        }
        let video_listeners: Arc<ListenerRegistry<dyn ImageStreamListener>> = Arc::new(ListenerRegistry::new("video"));
        for listener in options.video_listeners {
            video_listeners.add(listener);
        }

        let inner = Arc::new(Inner {
            source,
            path: options.path,
            version: options.version,
            color_space: options.color_space,
            audio_format: options.audio_format,
            stall_backoff: options.stall_backoff,
            loop_join_timeout: options.loop_join_timeout,
            status: Arc::new(StatusCell::new()),
            audio_listeners,
            video_listeners,
            transport: Mutex::new(Transport::default()),
            handle: Mutex::new(None),
            session: Mutex::new(None),
            error: Mutex::new(None),
            step_buffer: Mutex::new(Vec::new()),
            handle_users: ActivityTracker::new(),
            loop_pool: WorkerPool::new("pull-loop", 2)?,
        });

        let open_pool = WorkerPool::new("media-open", 1)?;
        let open_job = {
            let inner = inner.clone();
            open_pool.submit(move || inner.open_media())
        };

        Ok(Self {
            inner,
            open_job: Mutex::new(open_job),
            _open_pool: open_pool,
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn status(&self) -> PlaybackStatus {
        self.inner.status.get()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.status.subscribe()
    }

    /// The open failure, if the open did not succeed.
    pub fn error(&self) -> Option<OpenError> {
        lock(&self.inner.error).clone()
    }

    pub fn has_error(&self) -> bool {
        lock(&self.inner.error).is_some()
    }

    pub fn session(&self) -> Option<Session> {
        lock(&self.inner.session).clone()
    }

    /// Blocks until the background open finished. Returns `None` on timeout
    /// or if the controller was closed before the open completed.
    pub fn wait_for_open(&self, timeout: Duration) -> Option<Result<Session, OpenError>> {
        if let Some(job) = lock(&self.open_job).as_ref() {
            if !job.wait(timeout) {
                return None;
            }
        }
        if let Some(e) = self.error() {
            return Some(Err(e));
        }
        self.session().map(Ok)
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    /// Starts the pull loops. Before the open completed this only records the
    /// intent; the loops then start as soon as the stream is READY.
    pub fn play(&self) -> Result<(), TransportError> {
        self.inner.play()
    }

    pub fn stop(&self) -> Result<(), TransportError> {
        self.inner.halt_transport(PlaybackStatus::Stopped)
    }

    pub fn pause(&self) -> Result<(), TransportError> {
        self.inner.halt_transport(PlaybackStatus::Paused)
    }

    /// Stops playback, notifies listeners and releases the native handle.
    /// Calling it again has no effect.
    pub fn close(&self) {
        // Let an in-flight open settle so its handle gets released here
        if let Some(job) = lock(&self.open_job).take() {
            if !job.wait(self.inner.loop_join_timeout) {
                log::warn!("Open of {} still pending while closing", self.inner.path.display());
            }
        }
        self.inner.close();
    }

    pub fn seek(&self, time: f64) -> Result<(), TransportError> {
        let (handle, _token) = self.inner.open_handle()?;
        if let Some(session) = self.session() {
            if !session.contains_time(time) {
                return Err(TransportError::SeekOutOfRange {
                    time,
                    start: session.start_time,
                    end: session.end_time,
                });
            }
        }
        log::debug!("Stream {}: Seeking to {:.3}s", handle, time);
        self.inner.source.seek(handle, time);
        Ok(())
    }

    /// Sets the playback speed. Negative speeds play backwards; a speed of
    /// zero stops playback and is not forwarded.
    pub fn set_speed(&self, speed: f32) -> Result<(), TransportError> {
        if speed.abs() < SPEED_EPSILON {
            return self.stop();
        }
        if !(MIN_SPEED..=MAX_SPEED).contains(&speed) {
            return Err(TransportError::SpeedOutOfRange {
                speed,
                min: MIN_SPEED,
                max: MAX_SPEED,
            });
        }
        let (handle, _token) = self.inner.open_handle()?;
        log::debug!("Stream {}: Speed set to {}", handle, speed);
        self.inner.source.set_speed(handle, speed);
        Ok(())
    }

    /// Playback speed as reported by the native source, 0.0 when nothing is open.
    pub fn speed(&self) -> f32 {
        self.inner
            .borrow_handle()
            .map_or(0.0, |(handle, _token)| self.inner.source.speed(handle))
    }

    /// Back to the start of the stream.
    pub fn rewind(&self) -> Result<(), TransportError> {
        let (handle, _token) = self.inner.open_handle()?;
        self.inner.source.reset(handle);
        Ok(())
    }

    /// Pulls exactly one video frame and broadcasts it. Only allowed while
    /// the loops are not running. Returns the number of source frames
    /// consumed (0 when no frame was available).
    pub fn step_forward(&self) -> Result<u32, TransportError> {
        let (handle, _token) = self.inner.stepping_handle()?;
        let inner = &self.inner;

        let first_step = {
            let mut transport = lock(&inner.transport);
            !std::mem::replace(&mut transport.stepping, true)
        };
        if first_step {
            inner.source.set_play_sound(handle, false);
            inner
                .video_listeners
                .broadcast_lifecycle("stream_started", true, |l| l.stream_started());
        }

        let mut buffer = lock(&inner.step_buffer);
        match deliver_next_frame(inner.source.as_ref(), handle, &inner.video_listeners, &mut buffer, || {}) {
            Ok((frames, _)) => Ok(frames),
            Err(e) => {
                log::error!("Stream {}: Step failed, halting playback: {}", handle, e);
                inner.status.transition(PlaybackStatus::Halted);
                Err(TransportError::Halted)
            }
        }
    }

    /// Consumes the next video frame without broadcasting it.
    pub fn drop_frame(&self) -> Result<bool, TransportError> {
        let (handle, _token) = self.inner.stepping_handle()?;
        match self.inner.source.pull_next_video_frame(handle) {
            Ok(frames) => Ok(frames > 0),
            Err(e) => {
                log::error!("Stream {}: Frame drop failed, halting playback: {}", handle, e);
                self.inner.status.transition(PlaybackStatus::Halted);
                Err(TransportError::Halted)
            }
        }
    }

    /// Restricts decoded images to a window of the stream. Running loops are
    /// stopped around the change and started again afterwards.
    pub fn set_view(&self, x0: u32, y0: u32, width: u32, height: u32) -> Result<(), TransportError> {
        let (handle, _token) = self.inner.open_handle()?;
        let geometry = self
            .session()
            .and_then(|session| session.geometry)
            .ok_or(TransportError::NoVideoStream)?;
        if !geometry.contains_window(x0, y0, width, height) {
            return Err(TransportError::ViewOutOfBounds {
                x0,
                y0,
                width,
                height,
                stream_width: geometry.width,
                stream_height: geometry.height,
            });
        }

        let was_running = self.inner.loops_running();
        if was_running {
            self.stop()?;
        }
        if !self.inner.source.set_view(handle, x0, y0, width, height) {
            log::warn!("Stream {}: Native source rejected view {}x{}+{}+{}", handle, width, height, x0, y0);
        }
        if was_running {
            self.play()?;
        }
        Ok(())
    }

    /// Enables or disables sound. Returns the previous setting.
    pub fn set_play_sound(&self, play_sound: bool) -> Result<bool, TransportError> {
        let (handle, _token) = self.inner.open_handle()?;
        Ok(self.inner.source.set_play_sound(handle, play_sound))
    }

    pub fn set_audio_sync_delay(&self, delay_ms: i64) -> Result<(), TransportError> {
        let (handle, _token) = self.inner.open_handle()?;
        self.inner.source.set_audio_sync_delay(handle, delay_ms);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Clock
    // -------------------------------------------------------------------------

    /// The virtual clock shared by both media, in seconds.
    pub fn current_time(&self) -> f64 {
        self.inner
            .borrow_handle()
            .map_or(0.0, |(handle, _token)| self.inner.source.current_time(handle))
    }

    pub fn start_time(&self) -> f64 {
        self.session().map_or(0.0, |s| s.start_time)
    }

    pub fn end_time(&self) -> f64 {
        self.session().map_or(0.0, |s| s.end_time)
    }

    pub fn duration(&self) -> f64 {
        self.session().map_or(0.0, |s| s.duration)
    }

    // -------------------------------------------------------------------------
    // Listeners
    // -------------------------------------------------------------------------

    /// Registers an audio listener. If the medium already sent
    /// `stream_started`, the listener first gets `stream_opened` and
    /// `stream_started` so it joins a consistent stream.
    pub fn add_audio_listener(&self, listener: Arc<dyn StreamListener>) -> ListenerId {
        let registry = &self.inner.audio_listeners;
        registry.add_catching_up(listener, |l| {
            registry.deliver("stream_opened", || l.stream_opened());
            registry.deliver("stream_started", || l.stream_started());
        })
    }

    pub fn add_video_listener(&self, listener: Arc<dyn ImageStreamListener>) -> ListenerId {
        let registry = &self.inner.video_listeners;
        registry.add_catching_up(listener, |l| {
            registry.deliver("stream_opened", || l.stream_opened());
            registry.deliver("stream_started", || l.stream_started());
        })
    }

    pub fn remove_audio_listener(&self, id: ListenerId) -> bool {
        self.inner.audio_listeners.remove(id).is_some()
    }

    pub fn remove_video_listener(&self, id: ListenerId) -> bool {
        self.inner.video_listeners.remove(id).is_some()
    }

    pub fn audio_listener_count(&self) -> usize {
        self.inner.audio_listeners.len()
    }

    pub fn video_listener_count(&self) -> usize {
        self.inner.video_listeners.len()
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        self.close();
    }
}

/// A play run reserved under the transport lock, started after releasing it.
struct Launch {
    handle: MediaHandle,
    session: Session,
    stop_flag: Arc<AtomicBool>,
    token: ActivityToken,
}

impl Inner {
    fn open_media(&self) {
        log::info!("Opening {}", self.path.display());

        if let Err(e) = validate_request(self.color_space, &self.audio_format) {
            self.fail_open(e);
            return;
        }

        let handle = match self.source.open(&self.path, &self.version, &self.audio_format) {
            Ok(handle) => handle,
            Err(code) => {
                self.fail_open(OpenError::NativeOpenFailure {
                    code,
                    path: self.path.clone(),
                });
                return;
            }
        };

        let mut session = Session::new(
            self.path.clone(),
            self.source.start_time(handle),
            self.source.end_time(handle),
            self.source.duration(handle),
        );
        if self.source.has_video_stream(handle) {
            session.geometry = Some(self.source.geometry(handle));
        }
        if self.source.has_audio_stream(handle) {
            let negotiated = negotiate_audio_format(
                &self.source.codec_name(handle),
                self.source.sample_rate(handle),
                self.source.sample_size_bits(handle),
                self.source.audio_channels(handle),
                self.source.frame_size(handle),
                self.source.frame_rate(handle),
            );
            match negotiated {
                Ok(format) => session.audio_format = Some(format),
                Err(e) => {
                    self.source.close(handle);
                    self.fail_open(e);
                    return;
                }
            }
        }

        // Held until the end so a concurrent close() defers the release
        let token = {
            let transport = lock(&self.transport);
            if transport.closed {
                None
            } else {
                *lock(&self.handle) = Some(handle);
                *lock(&self.session) = Some(session.clone());
                Some(self.handle_users.enter())
            }
        };
        let Some(_token) = token else {
            log::info!("Stream {}: Closed while opening, releasing", handle);
            self.source.close(handle);
            return;
        };

        if session.has_audio() {
            self.audio_listeners.broadcast("stream_opened", |l| l.stream_opened());
        }
        if session.has_video() {
            self.video_listeners.broadcast("stream_opened", |l| l.stream_opened());
        }

        let launch = {
            let mut transport = lock(&self.transport);
            if transport.closed {
                return;
            }
            self.status.transition(PlaybackStatus::Ready);
            log::info!(
                "Stream {}: Opened {} (video: {}, audio: {}, {:.2}s)",
                handle,
                session.display_name(),
                session.has_video(),
                session.has_audio(),
                session.duration
            );

            if std::mem::take(&mut transport.play_requested) {
                log::debug!("Stream {}: Starting requested playback", handle);
                Some(self.reserve_run(&mut transport, handle, session))
            } else {
                None
            }
        };
        if let Some(launch) = launch {
            self.launch(launch);
        }
    }

    fn fail_open(&self, error: OpenError) {
        log::error!("Failed to open {}: {}", self.path.display(), error);
        *lock(&self.error) = Some(error);
    }

    /// The open handle with a token keeping it alive, unless closing began.
    fn borrow_handle(&self) -> Option<(MediaHandle, ActivityToken)> {
        let transport = lock(&self.transport);
        if transport.closed {
            return None;
        }
        let handle = (*lock(&self.handle))?;
        Some((handle, self.handle_users.enter()))
    }

    /// The handle for a transport call, or why the call is not allowed now.
    fn open_handle(&self) -> Result<(MediaHandle, ActivityToken), TransportError> {
        let status = self.status.get();
        if status == PlaybackStatus::Halted {
            return Err(TransportError::Halted);
        }
        if !status.is_open() {
            return Err(TransportError::InvalidState(status));
        }
        self.borrow_handle().ok_or(TransportError::InvalidState(status))
    }

    /// Like `open_handle`, additionally requiring a video stream and no
    /// running loops.
    fn stepping_handle(&self) -> Result<(MediaHandle, ActivityToken), TransportError> {
        let borrowed = self.open_handle()?;
        let status = self.status.get();
        if status.is_streaming() {
            return Err(TransportError::InvalidState(status));
        }
        let has_video = lock(&self.session).as_ref().is_some_and(Session::has_video);
        if !has_video {
            return Err(TransportError::NoVideoStream);
        }
        Ok(borrowed)
    }

    fn loops_running(&self) -> bool {
        lock(&self.transport).running.as_ref().is_some_and(RunningLoops::is_live)
    }

    fn play(&self) -> Result<(), TransportError> {
        let launch = {
            let mut transport = lock(&self.transport);
            let status = self.status.get();
            match status {
                PlaybackStatus::Halted => return Err(TransportError::Halted),
                PlaybackStatus::Disposed => return Err(TransportError::InvalidState(PlaybackStatus::Disposed)),
                PlaybackStatus::Unknown => {
                    log::debug!("Play requested before {} finished opening", self.path.display());
                    transport.play_requested = true;
                    return Ok(());
                }
                _ => {}
            }

            if transport.running.as_ref().is_some_and(RunningLoops::is_live) {
                return Ok(());
            }
            if transport.closed {
                return Err(TransportError::InvalidState(status));
            }

            let handle = (*lock(&self.handle)).ok_or(TransportError::InvalidState(status))?;
            let session = lock(&self.session).clone().ok_or(TransportError::InvalidState(status))?;
            self.reserve_run(&mut transport, handle, session)
        };
        self.launch(launch);
        Ok(())
    }

    /// Claims the next play run. A second play() sees it as live, and a
    /// stop() or close() before `launch` finishes cancels it.
    fn reserve_run(&self, transport: &mut Transport, handle: MediaHandle, session: Session) -> Launch {
        let stop_flag = Arc::new(AtomicBool::new(false));
        transport.stepping = false;
        transport.running = Some(RunningLoops {
            stop_flag: stop_flag.clone(),
            jobs: Vec::new(),
        });
        Launch {
            handle,
            session,
            stop_flag,
            token: self.handle_users.enter(),
        }
    }

    /// Issues the native play, then submits the loops if the run was not
    /// cancelled meanwhile.
    fn launch(&self, launch: Launch) {
        let Launch {
            handle,
            session,
            stop_flag,
            token,
        } = launch;

        if session.has_audio() {
            self.source.set_play_sound(handle, true);
        }
        self.source.play(handle);

        let mut transport = lock(&self.transport);
        let current = transport
            .running
            .as_ref()
            .is_some_and(|running| Arc::ptr_eq(&running.stop_flag, &stop_flag));
        if !current {
            // The halting call may have reached the source before our play
            let halted_to = match self.status.get() {
                next @ (PlaybackStatus::Paused | PlaybackStatus::Stopped)
                    if transport.running.is_none() && !transport.closed =>
                {
                    Some(next)
                }
                _ => None,
            };
            drop(transport);
            log::debug!("Stream {}: Play cancelled before the loops started", handle);
            if let Some(next) = halted_to {
                self.command_halt(handle, next, session.has_audio());
            }
            drop(token);
            return;
        }

        self.status.transition(PlaybackStatus::Playing);

        let ctx = LoopContext {
            source: self.source.clone(),
            handle,
            status: self.status.clone(),
            stop_flag,
            stall_backoff: self.stall_backoff,
        };

        let mut jobs = Vec::with_capacity(2);
        if session.has_audio() {
            let pull_loop = AudioPullLoop::new(self.audio_listeners.clone());
            let ctx = ctx.clone();
            let token = self.handle_users.enter();
            jobs.extend(self.loop_pool.submit(move || {
                let _token = token;
                pull_loop.run(&ctx);
            }));
        }
        if session.has_video() {
            let pull_loop = VideoPullLoop::new(self.video_listeners.clone());
            let ctx = ctx.clone();
            let token = self.handle_users.enter();
            jobs.extend(self.loop_pool.submit(move || {
                let _token = token;
                pull_loop.run(&ctx);
            }));
        }

        log::info!("Stream {}: Playing with {} loop(s)", handle, jobs.len());
        if let Some(running) = transport.running.as_mut() {
            running.jobs = jobs;
        }
        drop(transport);
        drop(token);
    }

    /// Signals the running loops to stop after their current unit.
    fn signal_loops(transport: &mut Transport) -> Vec<JobHandle> {
        match transport.running.take() {
            Some(running) => {
                running.stop_flag.store(true, Ordering::SeqCst);
                running.jobs
            }
            None => Vec::new(),
        }
    }

    /// Returns whether every loop stopped in time.
    fn join_loops(&self, jobs: Vec<JobHandle>) -> bool {
        // A callback stopping its own loop cannot wait for it
        if on_pull_loop_thread() {
            return jobs.is_empty();
        }
        let mut joined = true;
        for job in jobs {
            if !job.wait(self.loop_join_timeout) {
                log::warn!("Pull loop of {} did not stop within {:?}", self.path.display(), self.loop_join_timeout);
                joined = false;
            }
        }
        joined
    }

    fn command_halt(&self, handle: MediaHandle, next: PlaybackStatus, has_audio: bool) {
        if next == PlaybackStatus::Paused {
            self.source.pause(handle);
        } else {
            self.source.stop(handle);
        }
        if has_audio {
            self.source.set_play_sound(handle, false);
        }
    }

    /// Shared body of stop() and pause().
    fn halt_transport(&self, next: PlaybackStatus) -> Result<(), TransportError> {
        let (handle, has_audio, jobs, step_ended, token) = {
            let mut transport = lock(&self.transport);
            let status = self.status.get();
            match status {
                PlaybackStatus::Halted => return Err(TransportError::Halted),
                PlaybackStatus::Disposed => return Err(TransportError::InvalidState(PlaybackStatus::Disposed)),
                PlaybackStatus::Unknown => {
                    transport.play_requested = false;
                    return Ok(());
                }
                _ => {}
            }
            if transport.closed {
                return Err(TransportError::InvalidState(status));
            }

            let handle = (*lock(&self.handle)).ok_or(TransportError::InvalidState(status))?;
            let has_audio = lock(&self.session).as_ref().is_some_and(Session::has_audio);
            let jobs = Self::signal_loops(&mut transport);
            let step_ended = std::mem::take(&mut transport.stepping) && jobs.is_empty();
            self.status.transition(next);
            (handle, has_audio, jobs, step_ended, self.handle_users.enter())
        };

        self.command_halt(handle, next, has_audio);
        log::info!("Stream {}: {}", handle, next.display_text());

        self.join_loops(jobs);
        if step_ended {
            self.video_listeners
                .broadcast_lifecycle("stream_stopped", false, |l| l.stream_stopped());
        }
        drop(token);
        Ok(())
    }

    fn close(&self) {
        let (handle, was_open, jobs) = {
            let mut transport = lock(&self.transport);
            if transport.closed {
                return;
            }
            transport.closed = true;
            transport.play_requested = false;
            transport.stepping = false;

            let handle = lock(&self.handle).take();
            (handle, self.status.get().is_open(), Self::signal_loops(&mut transport))
        };

        if let (Some(handle), true) = (handle, was_open) {
            self.source.stop(handle);
        }
        let joined = self.join_loops(jobs);

        if let Some(handle) = handle {
            let release = self.release_task(handle);
            if !self.handle_users.release_when_idle(release) {
                log::warn!(
                    "Stream {}: Still in use (loops joined: {}), releasing once the last user finishes",
                    handle,
                    joined
                );
            }
        }

        self.status.transition(PlaybackStatus::Disposed);
    }

    /// Sends `stream_closed` and releases the native handle. Runs only once
    /// nothing else uses the handle.
    fn release_task(&self, handle: MediaHandle) -> impl FnOnce() + Send + 'static {
        let session = lock(&self.session).clone();
        let has_audio = session.as_ref().is_some_and(Session::has_audio);
        let has_video = session.as_ref().is_some_and(Session::has_video);
        let source = self.source.clone();
        let audio_listeners = self.audio_listeners.clone();
        let video_listeners = self.video_listeners.clone();
        let path = self.path.clone();

        move || {
            if has_audio {
                audio_listeners.broadcast("stream_closed", |l| l.stream_closed());
            }
            if has_video {
                video_listeners.broadcast("stream_closed", |l| l.stream_closed());
            }
            source.close(handle);
            log::info!("Stream {}: Closed {}", handle, path.display());
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
