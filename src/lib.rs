//! storyreel
//!
//! Records a browser-rendered narrated story to a video file: the narration
//! generator produces audio and a manifest, a local server exposes the story
//! page, and Chrome is driven over the DevTools protocol to capture the page
//! for exactly the narration's length.
//!
//! # Pipeline
//!
//! - **Input**: `stories/<name>` is read and `metadata.name` names the output
//! - **Narration**: an external generator writes `audios/messages_with_audio.json`
//! - **Serving**: the project root is served on `127.0.0.1:8080`
//! - **Capture**: the frame element is fitted to the viewport and the tab is
//!   recorded to `videos/<name>.webm`
//!
//! # Example
//!
//! ```no_run
//! use storyreel::RecorderConfig;
//!
//! # async fn demo() -> storyreel::Result<()> {
//! let config = RecorderConfig::load(std::env::current_dir().unwrap())?;
//! let report = storyreel::pipeline::run(&config, "@demo.json").await?;
//! println!("wrote {}", report.output.display());
//! # Ok(())
//! # }
//! ```

pub mod error;
pub use error::{Error, Result};

pub mod config;
pub use config::RecorderConfig;

pub mod manifest;
pub mod narration;
pub mod server;
pub mod story;

// Chrome DevTools Protocol session (blocking, owned by the recorder thread)
pub mod cdp;

// Capture state machine, chunk sink and stop timer
pub mod capture;

// Async facade over the CDP session
pub mod recorder;
pub use recorder::Recorder;

pub mod pipeline;
pub mod transcode;

/// Viewport dimensions in CSS pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

/// Bounding box of a page element, as reported by `getBoundingClientRect()`
#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize)]
pub struct ElementBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl ElementBox {
    /// Viewport that exactly holds this element (nearest integer pixels).
    pub fn viewport(&self) -> Viewport {
        Viewport {
            width: self.width.round().max(0.0) as u32,
            height: self.height.round().max(0.0) as u32,
        }
    }

    /// Whether the element's top-left corner sits at the frame origin.
    pub fn is_at_origin(&self) -> bool {
        self.x.abs() < 0.5 && self.y.abs() < 0.5
    }
}
