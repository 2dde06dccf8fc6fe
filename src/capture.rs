//! Capture state machine, recorded-chunk sink and stop timer
//!
//! The page hands recorded media over as JSON messages through a CDP
//! binding:
//!
//! - `{"seq": n, "data": "<base64>"}` for each chunk, `seq` starting at 0
//! - `{"end": true, "chunks": n}` once the recorder has flushed
//! - `{"error": "..."}` when the page-side recorder fails
//!
//! [`CaptureSink`] owns the output file and appends chunks in order on a
//! dedicated writer thread.

use crate::{Error, Result};
use base64::Engine as _;
use log::{debug, warn};
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Lifecycle of a capture session; transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    BrowserLaunched,
    PageLoaded,
    ViewportFitted,
    Recording,
    Stopping,
    Closed,
}

impl CaptureState {
    pub fn successor(self) -> Option<CaptureState> {
        use CaptureState::*;
        match self {
            Idle => Some(BrowserLaunched),
            BrowserLaunched => Some(PageLoaded),
            PageLoaded => Some(ViewportFitted),
            ViewportFitted => Some(Recording),
            Recording => Some(Stopping),
            Stopping => Some(Closed),
            Closed => None,
        }
    }

    /// Move to `next`, which must be the direct successor.
    pub fn advance(&mut self, next: CaptureState) -> Result<()> {
        if self.successor() == Some(next) {
            *self = next;
            Ok(())
        } else {
            Err(Error::InvalidState { from: *self, to: next })
        }
    }
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CaptureState::Idle => "idle",
            CaptureState::BrowserLaunched => "browser-launched",
            CaptureState::PageLoaded => "page-loaded",
            CaptureState::ViewportFitted => "viewport-fitted",
            CaptureState::Recording => "recording",
            CaptureState::Stopping => "stopping",
            CaptureState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// A decoded message from the page-side recorder
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    Chunk { seq: u64, data: Vec<u8> },
    End { chunks: u64 },
    Failed(String),
}

impl CaptureEvent {
    /// Decode a binding payload.
    ///
    /// `headless_chrome` hands the binding argument over as a JSON string;
    /// an already-parsed object is accepted too.
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self> {
        let message = message_object(payload)
            .ok_or_else(|| Error::Capture(format!("unrecognized capture payload: {}", truncate(payload))))?;

        if let Some(error) = message.get("error") {
            let text = error.as_str().map(str::to_string).unwrap_or_else(|| error.to_string());
            return Ok(CaptureEvent::Failed(text));
        }

        if message.get("end").and_then(serde_json::Value::as_bool) == Some(true) {
            let chunks = message
                .get("chunks")
                .and_then(serde_json::Value::as_u64)
                .ok_or_else(|| Error::Capture("end marker without chunk count".into()))?;
            return Ok(CaptureEvent::End { chunks });
        }

        let seq = message
            .get("seq")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| Error::Capture("chunk without sequence number".into()))?;
        let data = message
            .get("data")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| Error::Capture(format!("chunk {} without data", seq)))?;
        let data = base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| Error::Capture(format!("chunk {} is not valid base64: {}", seq, e)))?;
        Ok(CaptureEvent::Chunk { seq, data })
    }
}

fn message_object(value: &serde_json::Value) -> Option<serde_json::Map<String, serde_json::Value>> {
    match value {
        serde_json::Value::Object(map) => Some(map.clone()),
        serde_json::Value::String(s) => match serde_json::from_str(s).ok()? {
            serde_json::Value::Object(map) => Some(map),
            _ => None,
        },
        _ => None,
    }
}

fn truncate(value: &serde_json::Value) -> String {
    let mut text = value.to_string();
    if text.len() > 120 {
        let mut cut = 120;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push('…');
    }
    text
}

enum SinkMessage {
    Payload(serde_json::Value),
    Abort,
}

/// Handle given to the page binding; forwards payloads to the writer.
#[derive(Clone)]
pub struct ChunkSender {
    tx: mpsc::Sender<SinkMessage>,
}

impl ChunkSender {
    pub fn deliver(&self, payload: serde_json::Value) {
        if self.tx.send(SinkMessage::Payload(payload)).is_err() {
            debug!("capture payload dropped: sink already closed");
        }
    }
}

/// Totals written by a finished capture
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub chunks: u64,
    pub bytes: u64,
}

/// Exclusive owner of the recording file
pub struct CaptureSink {
    path: PathBuf,
    control: mpsc::Sender<SinkMessage>,
    done: Option<oneshot::Receiver<Result<CaptureStats>>>,
    faults: Option<oneshot::Receiver<Error>>,
    worker: Option<JoinHandle<()>>,
}

impl CaptureSink {
    /// Create (truncating) `path` and start the writer thread.
    pub fn create(path: impl Into<PathBuf>) -> Result<(Self, ChunkSender)> {
        let path = path.into();
        let file = File::create(&path).map_err(|e| Error::io(&path, e))?;

        let (tx, rx) = mpsc::channel();
        let (done_tx, done_rx) = oneshot::channel();
        let (fault_tx, fault_rx) = oneshot::channel();

        let writer_path = path.clone();
        let worker = std::thread::Builder::new()
            .name("storyreel-sink".into())
            .spawn(move || {
                let result = write_chunks(&writer_path, BufWriter::new(file), rx);
                if let Err(e) = &result {
                    let _ = fault_tx.send(Error::Capture(e.to_string()));
                }
                let _ = done_tx.send(result);
            })
            .map_err(|e| Error::Capture(format!("failed to spawn writer thread: {}", e)))?;

        let sink = Self {
            path,
            control: tx.clone(),
            done: Some(done_rx),
            faults: Some(fault_rx),
            worker: Some(worker),
        };
        Ok((sink, ChunkSender { tx }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Receiver resolving when the writer fails; handed to the stop timer.
    pub fn take_faults(&mut self) -> Option<oneshot::Receiver<Error>> {
        self.faults.take()
    }

    /// Wait for the end marker, then close the file.
    pub async fn finish(mut self, timeout: Duration) -> Result<CaptureStats> {
        let done = self
            .done
            .take()
            .ok_or_else(|| Error::Capture("capture sink already finished".into()))?;

        let outcome = match tokio::time::timeout(timeout, done).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Capture("capture writer exited without a result".into())),
            Err(_) => Err(Error::Capture(format!(
                "recorder did not deliver its final chunk within {:?}",
                timeout
            ))),
        };
        self.close();
        outcome
    }

    /// Stop writing immediately and close the file.
    pub fn abort(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.control.send(SinkMessage::Abort);
            if worker.join().is_err() {
                warn!("capture writer thread panicked");
            }
            debug!("closed {}", self.path.display());
        }
    }
}

impl Drop for CaptureSink {
    fn drop(&mut self) {
        self.close();
    }
}

fn write_chunks(
    path: &Path,
    mut file: BufWriter<File>,
    rx: mpsc::Receiver<SinkMessage>,
) -> Result<CaptureStats> {
    let mut stats = CaptureStats::default();
    let result = loop {
        let payload = match rx.recv() {
            Ok(SinkMessage::Payload(payload)) => payload,
            Ok(SinkMessage::Abort) => break Err(Error::Capture("capture aborted".into())),
            Err(_) => break Err(Error::Capture("capture stream closed before its end marker".into())),
        };

        match CaptureEvent::from_payload(&payload) {
            Ok(CaptureEvent::Chunk { seq, data }) => {
                if seq != stats.chunks {
                    break Err(Error::Capture(format!(
                        "chunk {} arrived, expected {}",
                        seq, stats.chunks
                    )));
                }
                if let Err(e) = file.write_all(&data) {
                    break Err(Error::io(path, e));
                }
                stats.chunks += 1;
                stats.bytes += data.len() as u64;
            }
            Ok(CaptureEvent::End { chunks }) => {
                if chunks != stats.chunks {
                    break Err(Error::Capture(format!(
                        "recorder reported {} chunks, received {}",
                        chunks, stats.chunks
                    )));
                }
                break Ok(stats);
            }
            Ok(CaptureEvent::Failed(message)) => break Err(Error::Capture(message)),
            Err(e) => break Err(e),
        }
    };

    // Keep whatever was received even when the capture failed.
    file.flush().map_err(|e| Error::io(path, e))?;
    result
}

/// Why the recording stopped
#[derive(Debug)]
pub enum StopReason {
    /// The full duration elapsed
    Elapsed(Duration),
    /// The sink failed first
    Fault(Error),
}

/// Single deferred stop trigger, armed once recording has started
#[derive(Debug)]
pub struct StopTimer {
    duration: Duration,
    armed_at: Instant,
}

impl StopTimer {
    pub fn arm(duration: Duration) -> Self {
        Self {
            duration,
            armed_at: Instant::now(),
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Resolve after the armed duration, or early on a sink fault.
    pub async fn wait(self, faults: Option<oneshot::Receiver<Error>>) -> StopReason {
        let deadline = tokio::time::Instant::from_std(self.armed_at + self.duration);
        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);

        if let Some(faults) = faults {
            tokio::select! {
                _ = &mut sleep => {}
                fault = faults => match fault {
                    Ok(err) => return StopReason::Fault(err),
                    // Writer finished without a fault; only the timer remains.
                    Err(_) => (&mut sleep).await,
                },
            }
        } else {
            sleep.await;
        }
        StopReason::Elapsed(self.armed_at.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chunk(seq: u64, bytes: &[u8]) -> serde_json::Value {
        let data = base64::engine::general_purpose::STANDARD.encode(bytes);
        json!({ "seq": seq, "data": data })
    }

    #[test]
    fn states_advance_in_order() {
        let mut state = CaptureState::Idle;
        for next in [
            CaptureState::BrowserLaunched,
            CaptureState::PageLoaded,
            CaptureState::ViewportFitted,
            CaptureState::Recording,
            CaptureState::Stopping,
            CaptureState::Closed,
        ] {
            state.advance(next).unwrap();
        }
        assert_eq!(state, CaptureState::Closed);
        assert!(state.successor().is_none());
    }

    #[test]
    fn recording_cannot_start_before_viewport_fit() {
        let mut state = CaptureState::PageLoaded;
        let err = state.advance(CaptureState::Recording).unwrap_err();
        assert_eq!(err.to_string(), "Invalid capture transition: page-loaded -> recording");
        assert_eq!(state, CaptureState::PageLoaded);
    }

    #[test]
    fn payload_shapes_decode_alike() {
        let object = chunk(0, b"abc");
        let as_string = serde_json::Value::String(object.to_string());

        let expected = CaptureEvent::Chunk { seq: 0, data: b"abc".to_vec() };
        assert_eq!(CaptureEvent::from_payload(&object).unwrap(), expected);
        assert_eq!(CaptureEvent::from_payload(&as_string).unwrap(), expected);
    }

    #[test]
    fn non_object_payloads_are_rejected() {
        for payload in [json!([chunk(0, b"abc").to_string()]), json!("\"just text\""), json!("not json"), json!(null)] {
            let err = CaptureEvent::from_payload(&payload).unwrap_err();
            assert!(err.to_string().contains("unrecognized capture payload"), "{payload}");
        }
    }

    #[test]
    fn end_and_error_messages() {
        assert_eq!(
            CaptureEvent::from_payload(&json!({ "end": true, "chunks": 3 })).unwrap(),
            CaptureEvent::End { chunks: 3 }
        );
        assert_eq!(
            CaptureEvent::from_payload(&json!({ "error": "NotAllowedError" })).unwrap(),
            CaptureEvent::Failed("NotAllowedError".into())
        );
        assert!(CaptureEvent::from_payload(&json!({ "seq": 0, "data": "***" })).is_err());
        assert!(CaptureEvent::from_payload(&json!(42)).is_err());
    }

    #[tokio::test]
    async fn sink_writes_chunks_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo.webm");
        let (sink, sender) = CaptureSink::create(&path).unwrap();

        sender.deliver(chunk(0, b"\x1aE\xdf\xa3"));
        sender.deliver(serde_json::Value::String(chunk(1, b"rest").to_string()));
        sender.deliver(json!({ "end": true, "chunks": 2 }));

        let stats = sink.finish(Duration::from_secs(5)).await.unwrap();
        assert_eq!(stats, CaptureStats { chunks: 2, bytes: 8 });
        assert_eq!(std::fs::read(&path).unwrap(), b"\x1aE\xdf\xa3rest");
    }

    #[tokio::test]
    async fn out_of_order_chunk_faults() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sink, sender) = CaptureSink::create(dir.path().join("x.webm")).unwrap();
        let faults = sink.take_faults().unwrap();

        sender.deliver(chunk(1, b"late"));
        let fault = tokio::time::timeout(Duration::from_secs(5), faults).await.unwrap().unwrap();
        assert!(fault.to_string().contains("expected 0"));
        assert!(sink.finish(Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn finish_times_out_without_end_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.webm");
        let (sink, sender) = CaptureSink::create(&path).unwrap();
        sender.deliver(chunk(0, b"part"));

        let err = sink.finish(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, Error::Capture(_)));
        // partial data is kept and the handle is closed
        assert_eq!(std::fs::read(&path).unwrap(), b"part");
    }

    #[tokio::test]
    async fn timer_waits_full_duration() {
        let timer = StopTimer::arm(Duration::from_millis(150));
        match timer.wait(None).await {
            StopReason::Elapsed(elapsed) => assert!(elapsed >= Duration::from_millis(150)),
            StopReason::Fault(e) => panic!("unexpected fault: {e}"),
        }
    }

    #[tokio::test]
    async fn timer_stops_early_on_fault() {
        let (tx, rx) = oneshot::channel();
        let timer = StopTimer::arm(Duration::from_secs(30));
        tx.send(Error::Capture("disk full".into())).unwrap();
        let started = Instant::now();
        match timer.wait(Some(rx)).await {
            StopReason::Fault(e) => assert!(e.to_string().contains("disk full")),
            StopReason::Elapsed(_) => panic!("timer should have been cut short"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn dropped_fault_channel_keeps_timer_running() {
        let (tx, rx) = oneshot::channel::<Error>();
        drop(tx);
        let timer = StopTimer::arm(Duration::from_millis(100));
        assert!(matches!(timer.wait(Some(rx)).await, StopReason::Elapsed(d) if d >= Duration::from_millis(100)));
    }
}
