//! Recorder configuration
//!
//! Values are resolved in this order, later sources winning:
//! 1. compiled defaults (browser location per OS)
//! 2. `storyreel.toml` in the project root, if present
//! 3. the `STORYREEL_BROWSER` environment variable

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the optional configuration file looked up in the project root.
pub const CONFIG_FILE_NAME: &str = "storyreel.toml";

/// Environment variable overriding the browser executable.
pub const BROWSER_ENV_VAR: &str = "STORYREEL_BROWSER";

/// Configuration for a recording run
///
/// Relative paths are resolved against `root`, which is also the directory
/// served to the browser.
///
/// # Examples
///
/// ```
/// let cfg = storyreel::RecorderConfig::default();
/// assert_eq!(cfg.bind_addr, "127.0.0.1:8080");
/// assert_eq!(cfg.video_extension, "webm");
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Project root; never read from the config file
    #[serde(skip)]
    pub root: PathBuf,
    /// Directory holding story definitions
    pub stories_dir: PathBuf,
    /// Manifest written by the narration generator
    pub manifest_path: PathBuf,
    /// Directory receiving recordings
    pub videos_dir: PathBuf,
    /// Container extension of the recording
    pub video_extension: String,
    /// Interpreter running the narration generator
    pub narration_program: PathBuf,
    /// Arguments passed to the interpreter (the generator script first)
    pub narration_args: Vec<String>,
    /// Listen address of the content server
    pub bind_addr: String,
    /// Path probed for readiness
    pub ready_path: String,
    /// Path of the story page
    pub index_path: String,
    /// Delay between readiness probes in milliseconds
    pub ready_poll_interval_ms: u64,
    /// Readiness timeout in milliseconds
    pub ready_timeout_ms: u64,
    /// Browser executable
    pub browser_path: PathBuf,
    /// Run the browser without a visible window
    pub headless: bool,
    /// CSS selector of the element that becomes the video frame
    pub frame_selector: String,
    /// Interval at which the page hands recorded chunks over, in milliseconds
    pub chunk_timeslice_ms: u64,
    /// How long to wait for the final chunk after stopping, in milliseconds
    pub flush_timeout_ms: u64,
    /// Also export an MP4 next to the WebM recording
    pub transcode_mp4: bool,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            stories_dir: PathBuf::from("stories"),
            manifest_path: PathBuf::from("audios/messages_with_audio.json"),
            videos_dir: PathBuf::from("videos"),
            video_extension: "webm".to_string(),
            narration_program: default_narration_program(),
            narration_args: vec!["generate_audio.py".to_string()],
            bind_addr: "127.0.0.1:8080".to_string(),
            ready_path: "/".to_string(),
            index_path: "/index.html".to_string(),
            ready_poll_interval_ms: 200,
            ready_timeout_ms: 30_000,
            browser_path: default_browser_path(),
            headless: false,
            frame_selector: ".backgroundGif".to_string(),
            chunk_timeslice_ms: 1000,
            flush_timeout_ms: 10_000,
            transcode_mp4: false,
        }
    }
}

impl RecorderConfig {
    /// Build the configuration for a project rooted at `root`.
    pub fn load(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let file = root.join(CONFIG_FILE_NAME);

        let mut config = if file.exists() {
            let text = std::fs::read_to_string(&file).map_err(|e| Error::io(&file, e))?;
            toml::from_str::<RecorderConfig>(&text)
                .map_err(|e| Error::Config(format!("{}: {}", file.display(), e)))?
        } else {
            RecorderConfig::default()
        };
        config.root = root;

        if let Some(browser) = std::env::var_os(BROWSER_ENV_VAR) {
            config.browser_path = PathBuf::from(browser);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ready_poll_interval_ms == 0 {
            return Err(Error::Config("ready_poll_interval_ms must be non-zero".into()));
        }
        if self.ready_timeout_ms == 0 {
            return Err(Error::Config("ready_timeout_ms must be non-zero".into()));
        }
        if self.chunk_timeslice_ms == 0 {
            return Err(Error::Config("chunk_timeslice_ms must be non-zero".into()));
        }
        if self.frame_selector.trim().is_empty() {
            return Err(Error::Config("frame_selector must not be empty".into()));
        }
        if self.video_extension.is_empty() || self.video_extension.contains(['.', '/', '\\']) {
            return Err(Error::Config(format!(
                "video_extension '{}' must be a bare extension",
                self.video_extension
            )));
        }
        if !self.ready_path.starts_with('/') || !self.index_path.starts_with('/') {
            return Err(Error::Config("ready_path and index_path must start with '/'".into()));
        }
        Ok(())
    }

    /// Resolve a configured path against the project root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn chunk_timeslice(&self) -> Duration {
        Duration::from_millis(self.chunk_timeslice_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

fn default_narration_program() -> PathBuf {
    if cfg!(target_os = "windows") {
        PathBuf::from("venv").join("Scripts").join("python.exe")
    } else {
        PathBuf::from("venv").join("bin").join("python")
    }
}

fn default_browser_path() -> PathBuf {
    if cfg!(target_os = "windows") {
        PathBuf::from("C:/Program Files/Google/Chrome/Application/chrome.exe")
    } else if cfg!(target_os = "macos") {
        PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome")
    } else {
        PathBuf::from("/usr/bin/google-chrome")
    }
}
