//! Error types for the story recorder

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for recorder operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while producing a story recording
#[derive(Error, Debug)]
pub enum Error {
    /// The story definition file does not exist
    #[error("Story file not found: {}", .0.display())]
    StoryNotFound(PathBuf),

    /// A JSON input could not be parsed
    #[error("Failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A JSON input parsed but lacks a required field
    #[error("{}: missing or invalid field `{field}`", path.display())]
    Schema { path: PathBuf, field: &'static str },

    /// The narration generator could not be started
    #[error("Failed to spawn narration generator {}: {source}", program.display())]
    ProcessSpawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The narration generator exited unsuccessfully (`None` when killed by a signal)
    #[error("Narration generator failed (code {})", code.map(|c| c.to_string()).unwrap_or_else(|| "none".into()))]
    ProcessFailure { code: Option<i32> },

    /// The content server could not bind its listener
    #[error("Content server failed to start: {0}")]
    ServerStart(String),

    /// The content server did not answer 200 in time
    #[error("Content server not ready after {0}ms")]
    ServerTimeout(u64),

    /// The browser could not be launched
    #[error("Browser launch failed: {0}")]
    BrowserLaunch(String),

    /// Navigation to the story page failed
    #[error("Failed to load page: {0}")]
    Navigation(String),

    /// The capture frame element is not on the page
    #[error("Element not found: {0}")]
    ElementNotFound(String),

    /// In-page script evaluation failed or returned something unexpected
    #[error("Script execution failed: {0}")]
    Script(String),

    /// The capture stream failed
    #[error("Capture failed: {0}")]
    Capture(String),

    /// A capture step ran out of order
    #[error("Invalid capture transition: {from} -> {to}")]
    InvalidState {
        from: crate::capture::CaptureState,
        to: crate::capture::CaptureState,
    },

    /// MP4 export failed
    #[error("Transcode failed: {0}")]
    Transcode(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Filesystem error
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// CDP-specific error
    #[error("CDP error: {0}")]
    Cdp(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Cdp(err.to_string())
    }
}
