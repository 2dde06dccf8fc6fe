//! The recording run: ordered steps over an explicit run context
//!
//! Narration happens before anything is started. Once the content server is
//! up, every exit path goes through [`RunContext::teardown`], which releases
//! the capture file, the browser and the server exactly once each.

use crate::capture::{CaptureSink, CaptureState, CaptureStats, StopReason, StopTimer};
use crate::cdp::LaunchSettings;
use crate::manifest::AudioManifest;
use crate::narration::NarrationCommand;
use crate::server::{self, ContentServer};
use crate::story::{self, Story};
use crate::{transcode, ElementBox, Error, RecorderConfig, Recorder, Result, Viewport};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Outcome of a successful run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub story: String,
    pub output: PathBuf,
    /// Duration declared by the manifest
    pub duration: Duration,
    /// Measured time between capture start and the stop trigger
    pub recorded_for: Duration,
    /// Viewport the page was recorded at
    pub viewport: Viewport,
    /// Frame element box after scrolling, in viewport coordinates
    pub frame: ElementBox,
    pub stats: CaptureStats,
    pub mp4: Option<PathBuf>,
}

/// What `record` hands back to `run`
struct Recording {
    recorded_for: Duration,
    viewport: Viewport,
    frame: ElementBox,
    stats: CaptureStats,
}

/// Resources acquired during a run
#[derive(Default)]
pub struct RunContext {
    server: Option<ContentServer>,
    recorder: Option<Recorder>,
    sink: Option<CaptureSink>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Release everything still held. Failures are logged, never raised.
    pub async fn teardown(&mut self) {
        if let Some(recorder) = self.recorder.as_mut() {
            if recorder.state() == CaptureState::Recording {
                if let Err(e) = recorder.stop_capture().await {
                    warn!("failed to stop capture: {}", e);
                }
            }
        }
        if let Some(sink) = self.sink.take() {
            debug!("closing {}", sink.path().display());
            sink.abort();
        }
        if let Some(recorder) = self.recorder.take() {
            if let Err(e) = recorder.close().await {
                warn!("failed to close browser: {}", e);
            }
        }
        if let Some(server) = self.server.take() {
            server.stop();
        }
    }
}

/// Record the story named by `story_arg` (a leading `@` is ignored).
pub async fn run(config: &RecorderConfig, story_arg: &str) -> Result<RunReport> {
    let stories_dir = config.resolve(&config.stories_dir);
    let story = Story::load(story::story_path(&stories_dir, story_arg))?;
    info!("📖 Story '{}' from {}", story.name(), story.path.display());

    info!("🔊 Generating narration audio...");
    NarrationCommand::from_config(config).run().await?;

    let manifest = AudioManifest::load(&config.resolve(&config.manifest_path))?;
    info!(
        "⏱️ Narration lasts {:.2}s ({} messages, {:.2}s spoken)",
        manifest.duration_total,
        manifest.messages.len(),
        manifest.spoken_duration()
    );

    let output = story.output_path(&config.resolve(&config.videos_dir), &config.video_extension);

    let mut ctx = RunContext::new();
    let recorded = record(config, &manifest, &output, &mut ctx).await;
    ctx.teardown().await;
    let recording = recorded?;

    let mp4 = if config.transcode_mp4 {
        Some(transcode::to_mp4(&output).await?)
    } else {
        None
    };

    Ok(RunReport {
        story: story.name().to_string(),
        output,
        duration: manifest.duration(),
        recorded_for: recording.recorded_for,
        viewport: recording.viewport,
        frame: recording.frame,
        stats: recording.stats,
        mp4,
    })
}

/// Steps from server start to the closed recording file.
async fn record(
    config: &RecorderConfig,
    manifest: &AudioManifest,
    output: &Path,
    ctx: &mut RunContext,
) -> Result<Recording> {
    let server = ctx
        .server
        .insert(ContentServer::start(&config.bind_addr, &config.root)?);
    let base = Url::parse(&server.base_url())
        .map_err(|e| Error::Config(format!("invalid server address: {}", e)))?;
    let ready_url = join_url(&base, &config.ready_path)?;
    let index_url = join_url(&base, &config.index_path)?;

    server::wait_until_ready(ready_url.as_str(), config.ready_poll_interval(), config.ready_timeout())
        .await?;

    let settings = LaunchSettings::from_config(config, manifest.duration());
    let recorder = ctx.recorder.insert(Recorder::launch(settings).await?);
    recorder.open(index_url.as_str()).await?;

    let frame = recorder.measure(&config.frame_selector).await?;
    debug!("frame element {:?}", frame);
    let viewport = recorder.fit_viewport(frame.viewport()).await?;
    let placed = recorder.scroll_into_view(&config.frame_selector).await?;
    verify_fit(&frame, viewport, &placed)?;
    info!("📐 Viewport fitted to {}x{}", viewport.width, viewport.height);

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    let (sink, chunks) = CaptureSink::create(output)?;
    let sink = ctx.sink.insert(sink);
    let faults = sink.take_faults();

    recorder
        .start_capture(&config.frame_selector, chunks, config.chunk_timeslice())
        .await?;
    info!("🎥 Recording to {}", output.display());

    let recorded_for = match StopTimer::arm(manifest.duration()).wait(faults).await {
        StopReason::Elapsed(elapsed) => elapsed,
        StopReason::Fault(err) => return Err(err),
    };

    recorder.stop_capture().await?;
    let sink = ctx
        .sink
        .take()
        .ok_or_else(|| Error::Capture("capture sink went missing".into()))?;
    let stats = sink.finish(config.flush_timeout()).await?;
    info!(
        "✅ Recording finished after {:.2}s ({} chunks, {} bytes)",
        recorded_for.as_secs_f64(),
        stats.chunks,
        stats.bytes
    );
    Ok(Recording {
        recorded_for,
        viewport,
        frame: placed,
        stats,
    })
}

/// The viewport must equal the measured frame (rounded) and the frame must
/// sit at the viewport origin before recording starts.
fn verify_fit(frame: &ElementBox, viewport: Viewport, placed: &ElementBox) -> Result<()> {
    let wanted = frame.viewport();
    if viewport != wanted {
        return Err(Error::Capture(format!(
            "viewport {}x{} does not match frame element {}x{}",
            viewport.width, viewport.height, wanted.width, wanted.height
        )));
    }
    if !placed.is_at_origin() {
        return Err(Error::Capture(format!(
            "frame element sits at ({:.1}, {:.1}) after scrolling",
            placed.x, placed.y
        )));
    }
    Ok(())
}

fn join_url(base: &Url, path: &str) -> Result<Url> {
    base.join(path)
        .map_err(|e| Error::Config(format!("invalid page path '{}': {}", path, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_urls_join_onto_server_base() {
        let base = Url::parse("http://127.0.0.1:8080").unwrap();
        assert_eq!(join_url(&base, "/").unwrap().as_str(), "http://127.0.0.1:8080/");
        assert_eq!(
            join_url(&base, "/index.html").unwrap().as_str(),
            "http://127.0.0.1:8080/index.html"
        );
    }

    #[test]
    fn fitted_frame_at_origin_passes() {
        let frame = ElementBox { x: 0.0, y: 312.0, width: 359.6, height: 640.2 };
        let placed = ElementBox { x: 0.0, y: 0.3, ..frame };
        verify_fit(&frame, Viewport { width: 360, height: 640 }, &placed).unwrap();
    }

    #[test]
    fn mismatched_viewport_is_an_error() {
        let frame = ElementBox { x: 0.0, y: 0.0, width: 360.0, height: 640.0 };
        let err = verify_fit(&frame, Viewport { width: 500, height: 640 }, &frame).unwrap_err();
        assert!(matches!(err, Error::Capture(ref m) if m.contains("500x640")), "{err:?}");
    }

    #[test]
    fn frame_off_origin_is_an_error() {
        let frame = ElementBox { x: 0.0, y: 0.0, width: 360.0, height: 640.0 };
        let placed = ElementBox { y: 24.0, ..frame };
        let err = verify_fit(&frame, frame.viewport(), &placed).unwrap_err();
        assert!(matches!(err, Error::Capture(ref m) if m.contains("after scrolling")), "{err:?}");
    }

    #[tokio::test]
    async fn teardown_of_empty_context_is_a_no_op() {
        let mut ctx = RunContext::new();
        ctx.teardown().await;
        ctx.teardown().await;
    }

    #[tokio::test]
    async fn teardown_releases_server_socket() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = RunContext::new();
        let server = ContentServer::start("127.0.0.1:0", dir.path()).unwrap();
        let addr = server.addr();
        ctx.server = Some(server);
        ctx.teardown().await;

        // The accept thread drops the listener shortly after shutdown.
        let mut rebound = None;
        for _ in 0..50 {
            if let Ok(server) = ContentServer::start(&addr.to_string(), dir.path()) {
                rebound = Some(server);
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        rebound.expect("port was not released").stop();
    }
}
