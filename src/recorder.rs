use crate::capture::{CaptureState, ChunkSender};
use crate::cdp::{CdpSession, LaunchSettings};
use crate::{ElementBox, Error, Result, Viewport};
use log::debug;
use std::sync::mpsc::{self, Sender};
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;

enum Command {
    Open(String, oneshot::Sender<Result<()>>),
    Measure(String, oneshot::Sender<Result<ElementBox>>),
    FitViewport(Viewport, oneshot::Sender<Result<Viewport>>),
    ScrollIntoView(String, oneshot::Sender<Result<ElementBox>>),
    StartCapture(String, ChunkSender, Duration, oneshot::Sender<Result<()>>),
    StopCapture(oneshot::Sender<Result<()>>),
    Close(oneshot::Sender<Result<()>>),
}

/// An async-friendly capture driver backed by a dedicated worker thread.
///
/// The worker thread owns the blocking `CdpSession` and executes commands
/// sent from async code. The recorder tracks the capture state and refuses
/// steps issued out of order.
pub struct Recorder {
    cmd_tx: Sender<Command>,
    state: CaptureState,
}

impl Recorder {
    /// Launch the browser (spawns the thread that owns the session).
    pub async fn launch(settings: LaunchSettings) -> Result<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>();
        let (init_tx, init_rx) = oneshot::channel::<Result<()>>();

        thread::Builder::new()
            .name("storyreel-cdp".into())
            .spawn(move || {
                let mut session = match CdpSession::launch(&settings) {
                    Ok(s) => s,
                    Err(err) => {
                        let _ = init_tx.send(Err(err));
                        return;
                    }
                };
                let _ = init_tx.send(Ok(()));

                while let Ok(cmd) = cmd_rx.recv() {
                    match cmd {
                        Command::Open(url, resp) => {
                            let _ = resp.send(session.open(&url));
                        }
                        Command::Measure(selector, resp) => {
                            let _ = resp.send(session.measure(&selector));
                        }
                        Command::FitViewport(target, resp) => {
                            let _ = resp.send(session.fit_viewport(target));
                        }
                        Command::ScrollIntoView(selector, resp) => {
                            let _ = resp.send(session.scroll_into_view(&selector));
                        }
                        Command::StartCapture(selector, chunks, timeslice, resp) => {
                            let _ = resp.send(session.start_capture(&selector, chunks, timeslice));
                        }
                        Command::StopCapture(resp) => {
                            let _ = resp.send(session.stop_capture());
                        }
                        Command::Close(resp) => {
                            let _ = resp.send(session.close());
                            return;
                        }
                    }
                }
                // Every Recorder handle dropped without Close.
                let _ = session.close();
            })
            .map_err(|e| Error::BrowserLaunch(format!("failed to spawn browser thread: {}", e)))?;

        init_rx
            .await
            .map_err(|e| Error::Other(format!("Browser init canceled: {}", e)))??;

        let mut state = CaptureState::Idle;
        state.advance(CaptureState::BrowserLaunched)?;
        Ok(Self { cmd_tx, state })
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    async fn request<T>(
        &self,
        what: &str,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .map_err(|_| Error::Other(format!("{} failed: browser thread is gone", what)))?;
        rx.await
            .map_err(|e| Error::Other(format!("{} canceled: {}", what, e)))?
    }

    /// Open the story page in a new tab.
    pub async fn open(&mut self, url: &str) -> Result<()> {
        self.require_state(CaptureState::BrowserLaunched)?;
        let url = url.to_string();
        self.request("Open", |tx| Command::Open(url, tx)).await?;
        self.state.advance(CaptureState::PageLoaded)
    }

    /// Bounding box of the frame element.
    pub async fn measure(&self, selector: &str) -> Result<ElementBox> {
        let selector = selector.to_string();
        self.request("Measure", |tx| Command::Measure(selector, tx)).await
    }

    /// Resize the viewport to exactly `target`.
    pub async fn fit_viewport(&mut self, target: Viewport) -> Result<Viewport> {
        self.require_state(CaptureState::PageLoaded)?;
        let observed = self
            .request("FitViewport", |tx| Command::FitViewport(target, tx))
            .await?;
        self.state.advance(CaptureState::ViewportFitted)?;
        Ok(observed)
    }

    /// Scroll the frame element to the top-left; returns its new box.
    pub async fn scroll_into_view(&self, selector: &str) -> Result<ElementBox> {
        self.require_state(CaptureState::ViewportFitted)?;
        let selector = selector.to_string();
        self.request("ScrollIntoView", |tx| Command::ScrollIntoView(selector, tx))
            .await
    }

    /// Start recording audio and video; chunks go to `chunks`.
    pub async fn start_capture(
        &mut self,
        selector: &str,
        chunks: ChunkSender,
        timeslice: Duration,
    ) -> Result<()> {
        self.require_state(CaptureState::ViewportFitted)?;
        let selector = selector.to_string();
        self.request("StartCapture", |tx| {
            Command::StartCapture(selector, chunks, timeslice, tx)
        })
        .await?;
        self.state.advance(CaptureState::Recording)
    }

    /// Stop the capture stream.
    pub async fn stop_capture(&mut self) -> Result<()> {
        self.state.advance(CaptureState::Stopping)?;
        self.request("StopCapture", Command::StopCapture).await
    }

    /// Close the browser; on the success path this completes the state machine.
    pub async fn close(mut self) -> Result<()> {
        let res = self.request("Close", Command::Close).await;
        if self.state == CaptureState::Stopping {
            self.state.advance(CaptureState::Closed)?;
        } else {
            debug!("browser closed from state {}", self.state);
            self.state = CaptureState::Closed;
        }
        res
    }

    fn require_state(&self, state: CaptureState) -> Result<()> {
        if self.state == state {
            Ok(())
        } else {
            Err(Error::InvalidState {
                from: self.state,
                to: state.successor().unwrap_or(CaptureState::Closed),
            })
        }
    }
}
