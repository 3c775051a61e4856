pub mod core;
pub mod playback;
pub mod sinks;
pub mod stream;

pub use crate::core::{OpenError, PlaybackStatus, PlayerConfig, Session, SourceError, StatusEvent, TransportError};
pub use crate::playback::{PlaybackController, PlayerOptions};
pub use crate::stream::{ImageStreamListener, ListenerId, NativeMediaSource, StreamListener};
