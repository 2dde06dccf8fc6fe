//! Audio manifest produced by the narration generator

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One narrated message
#[derive(Debug, Clone, Deserialize)]
pub struct NarratedMessage {
    pub sender: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    pub audio: String,
    pub duration: f64,
}

/// Contents of `audios/messages_with_audio.json`
#[derive(Debug, Clone)]
pub struct AudioManifest {
    /// Total narration length in seconds, including any tail padding
    pub duration_total: f64,
    pub messages: Vec<NarratedMessage>,
    duration: Duration,
}

impl AudioManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::parse(path.to_path_buf(), &text)
    }

    pub fn parse(path: PathBuf, text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text).map_err(|source| Error::Parse {
            path: path.clone(),
            source,
        })?;
        let duration_total = value
            .get("duration_total")
            .and_then(serde_json::Value::as_f64)
            .ok_or_else(|| Error::Schema { path: path.clone(), field: "duration_total" })?;
        // Rejects negative, non-finite and out-of-range values alike.
        let duration = Duration::try_from_secs_f64(duration_total)
            .map_err(|_| Error::Schema { path: path.clone(), field: "duration_total" })?;

        let messages = match value.get("messages") {
            Some(messages) => serde_json::from_value(messages.clone())
                .map_err(|_| Error::Schema { path, field: "messages" })?,
            None => Vec::new(),
        };

        Ok(Self { duration_total, messages, duration })
    }

    /// How long the capture runs.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Sum of the per-message durations (without tail padding).
    pub fn spoken_duration(&self) -> f64 {
        self.messages.iter().map(|m| m.duration).sum()
    }
}
