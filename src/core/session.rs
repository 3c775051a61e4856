use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::stream::{AudioFormatDescriptor, StreamGeometry};

/// Everything learned about one opened media file. Created when the native
/// open succeeds and kept until `close()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub path: PathBuf,
    pub opened_at: DateTime<Utc>,
    pub start_time: f64,
    pub end_time: f64,
    pub duration: f64,
    /// Stream geometry at open time; `None` for audio-only media.
    pub geometry: Option<StreamGeometry>,
    /// Negotiated audio format; `None` for video-only media.
    pub audio_format: Option<AudioFormatDescriptor>,
}

impl Session {
    pub fn new(path: PathBuf, start_time: f64, end_time: f64, duration: f64) -> Self {
        Session {
            id: uuid::Uuid::new_v4().to_string(),
            path,
            opened_at: Utc::now(),
            start_time,
            end_time,
            duration,
            geometry: None,
            audio_format: None,
        }
    }

    pub fn has_video(&self) -> bool {
        self.geometry.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.audio_format.is_some()
    }

    pub fn contains_time(&self, time: f64) -> bool {
        time >= self.start_time && time <= self.end_time
    }

    pub fn display_name(&self) -> String {
        self.path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string()
    }
}
