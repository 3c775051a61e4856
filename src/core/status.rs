use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Playback status shared by the controller and both pull loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlaybackStatus {
    Unknown,
    Ready,
    Paused,
    Playing,
    Stopped,
    /// A pull returned no data; cleared by the next successful pull.
    Stalled,
    /// Unrecoverable native failure. Only `close()` is accepted.
    Halted,
    Disposed,
}

impl PlaybackStatus {
    /// Whether the source finished opening and has not been torn down.
    pub fn is_open(self) -> bool {
        matches!(
            self,
            PlaybackStatus::Ready
                | PlaybackStatus::Paused
                | PlaybackStatus::Playing
                | PlaybackStatus::Stopped
                | PlaybackStatus::Stalled
        )
    }

    pub fn is_streaming(self) -> bool {
        matches!(self, PlaybackStatus::Playing | PlaybackStatus::Stalled)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PlaybackStatus::Halted | PlaybackStatus::Disposed)
    }

    pub fn can_transition_to(self, next: PlaybackStatus) -> bool {
        use PlaybackStatus::*;

        if self == next {
            return self != Disposed;
        }

        match self {
            Unknown => matches!(next, Ready | Halted | Disposed),
            Ready => matches!(next, Playing | Paused | Stopped | Halted | Disposed),
            Playing => matches!(next, Stalled | Paused | Stopped | Halted | Disposed),
            Stalled => matches!(next, Playing | Paused | Stopped | Halted | Disposed),
            Paused => matches!(next, Playing | Stopped | Halted | Disposed),
            Stopped => matches!(next, Playing | Paused | Halted | Disposed),
            Halted => matches!(next, Disposed),
            Disposed => false,
        }
    }

    pub fn display_text(self) -> &'static str {
        match self {
            PlaybackStatus::Unknown => "Opening...",
            PlaybackStatus::Ready => "Ready",
            PlaybackStatus::Paused => "Paused",
            PlaybackStatus::Playing => "Playing",
            PlaybackStatus::Stopped => "Stopped",
            PlaybackStatus::Stalled => "Buffering...",
            PlaybackStatus::Halted => "Playback failed",
            PlaybackStatus::Disposed => "Closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusEvent {
    pub previous: PlaybackStatus,
    pub current: PlaybackStatus,
}

/// Lock-guarded status value that publishes every change.
pub struct StatusCell {
    status: Mutex<PlaybackStatus>,
    event_sender: broadcast::Sender<StatusEvent>,
}

impl StatusCell {
    const EVENT_CAPACITY: usize = 64;

    pub fn new() -> Self {
        let (event_sender, _) = broadcast::channel(Self::EVENT_CAPACITY);
        Self {
            status: Mutex::new(PlaybackStatus::Unknown),
            event_sender,
        }
    }

    pub fn get(&self) -> PlaybackStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves to `next` if the state machine allows it. Returns whether the
    /// status now equals `next`.
    pub fn transition(&self, next: PlaybackStatus) -> bool {
        self.transition_if(|_| true, next)
    }

    /// Moves to `next` only when `guard` accepts the current status and the
    /// transition is legal.
    pub fn transition_if(&self, guard: impl FnOnce(PlaybackStatus) -> bool, next: PlaybackStatus) -> bool {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = *status;
        if !guard(previous) || !previous.can_transition_to(next) {
            return false;
        }
        if previous == next {
            return true;
        }
        *status = next;

        log::debug!("Status {:?} -> {:?}", previous, next);
        // Published under the lock so subscribers see changes in order;
        // having no receivers is fine
        let _ = self.event_sender.send(StatusEvent { previous, current: next });
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.event_sender.subscribe()
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}
