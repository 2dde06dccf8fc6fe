//! Chrome DevTools Protocol session used for capture

use crate::capture::ChunkSender;
use crate::{ElementBox, Error, RecorderConfig, Result, Viewport};
use headless_chrome::browser::tab::Tab;
use headless_chrome::types::Bounds;
use headless_chrome::{Browser, LaunchOptions};
use log::debug;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Name of the page binding receiving recorded chunks.
pub const CHUNK_BINDING: &str = "__storyreelSink";

/// Chrome switches needed to record the current tab without a picker.
const CAPTURE_FLAGS: &[&str] = &[
    "--auto-accept-this-tab-capture",
    "--use-fake-ui-for-media-stream",
    "--autoplay-policy=no-user-gesture-required",
];

/// Page-side recorder. `getDisplayMedia` needs user activation, so `arm`
/// only installs a click listener on the frame element; the session then
/// clicks it over CDP.
const RECORDER_SCRIPT: &str = r#"(function(){
    if (window.__storyreel) return 'installed';
    const sink = window['{{BINDING}}'];
    const send = (msg) => sink(JSON.stringify(msg));
    const toBase64 = (blob) => new Promise(function(resolve, reject){
        const reader = new FileReader();
        reader.onload = () => resolve(String(reader.result).split(',')[1] || '');
        reader.onerror = () => reject(reader.error);
        reader.readAsDataURL(blob);
    });
    let recorder = null, stream = null, stopped = null, seq = 0;
    let queue = Promise.resolve();

    window.__storyreel = {
        arm: function(selector, timeslice){
            const target = document.querySelector(selector);
            if (!target) return 'missing';
            window.__storyreelStarted = new Promise(function(resolve, reject){
                target.addEventListener('click', async function(event){
                    event.preventDefault();
                    event.stopImmediatePropagation();
                    try {
                        stream = await navigator.mediaDevices.getDisplayMedia({
                            video: true, audio: true, preferCurrentTab: true, selfBrowserSurface: 'include'
                        });
                        const mimeType = ['video/webm;codecs=vp9,opus', 'video/webm;codecs=vp8,opus', 'video/webm']
                            .find((t) => MediaRecorder.isTypeSupported(t));
                        recorder = new MediaRecorder(stream, mimeType ? { mimeType: mimeType } : undefined);
                        recorder.ondataavailable = function(e){
                            if (!e.data || e.data.size === 0) return;
                            const blob = e.data;
                            queue = queue
                                .then(() => toBase64(blob))
                                .then((data) => send({ seq: seq++, data: data }))
                                .catch((err) => send({ error: String(err) }));
                        };
                        recorder.onerror = (e) => send({ error: String(e.error || e) });
                        stopped = new Promise((r) => { recorder.onstop = r; });
                        recorder.start(timeslice);
                        resolve('started');
                    } catch (err) {
                        reject(err);
                    }
                }, { once: true, capture: true });
            });
            return 'armed';
        },
        stop: function(){
            if (!recorder) return Promise.resolve('idle');
            if (recorder.state !== 'inactive') recorder.stop();
            return stopped
                .then(() => queue)
                .then(function(){
                    stream.getTracks().forEach((t) => t.stop());
                    send({ end: true, chunks: seq });
                    return 'stopped';
                });
        }
    };
    return 'installed';
})()"#;

/// Resize attempts before a mismatched viewport is reported.
const FIT_ATTEMPTS: u32 = 2;
/// The page applies a window resize asynchronously.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(3);
const SETTLE_POLL: Duration = Duration::from_millis(50);
/// Identical consecutive readings after which the size counts as settled.
const SETTLE_READINGS: u32 = 4;

/// Browser launch parameters
#[derive(Debug, Clone)]
pub struct LaunchSettings {
    pub executable: PathBuf,
    pub headless: bool,
    /// Upper bound on silence from the browser before the connection is dropped
    pub idle_timeout: Duration,
}

impl LaunchSettings {
    /// Settings for a capture lasting `capture`.
    pub fn from_config(config: &RecorderConfig, capture: Duration) -> Self {
        Self {
            executable: config.browser_path.clone(),
            headless: config.headless,
            idle_timeout: capture + config.flush_timeout() + Duration::from_secs(60),
        }
    }
}

/// One browser with one tab, driven synchronously
///
/// `headless_chrome` blocks on every call, so the session lives on the
/// recorder's worker thread.
pub struct CdpSession {
    browser: Browser,
    tab: Option<Arc<Tab>>,
}

impl CdpSession {
    pub fn launch(settings: &LaunchSettings) -> Result<Self> {
        if !settings.executable.exists() {
            return Err(Error::BrowserLaunch(format!(
                "browser executable not found at {}",
                settings.executable.display()
            )));
        }

        let flags: Vec<&OsStr> = CAPTURE_FLAGS.iter().map(OsStr::new).collect();
        // No window_size: the page sees the OS window's native size.
        let launch_options = LaunchOptions::default_builder()
            .headless(settings.headless)
            .path(Some(settings.executable.clone()))
            .window_size(None)
            .idle_browser_timeout(settings.idle_timeout)
            .args(flags)
            .build()
            .map_err(|e| Error::BrowserLaunch(format!("Failed to build launch options: {}", e)))?;

        let browser = Browser::new(launch_options)
            .map_err(|e| Error::BrowserLaunch(format!("Failed to launch browser: {}", e)))?;

        Ok(Self { browser, tab: None })
    }

    fn tab(&self) -> Result<&Arc<Tab>> {
        self.tab
            .as_ref()
            .ok_or_else(|| Error::Navigation("no page is open".into()))
    }

    /// Open a new tab on `url` and wait for navigation to complete.
    pub fn open(&mut self, url: &str) -> Result<()> {
        let tab = self
            .browser
            .new_tab()
            .map_err(|e| Error::Navigation(format!("Failed to create tab: {}", e)))?;

        tab.navigate_to(url)
            .map_err(|e| Error::Navigation(format!("Navigation failed: {}", e)))?;
        tab.wait_until_navigated()
            .map_err(|e| Error::Navigation(format!("Wait for navigation failed: {}", e)))?;

        self.tab = Some(tab);
        Ok(())
    }

    /// Evaluate `script` and return its string result (`None` for null/undefined).
    fn eval_string(&self, script: &str, await_promise: bool) -> Result<Option<String>> {
        let result = self
            .tab()?
            .evaluate(script, await_promise)
            .map_err(|e| Error::Script(format!("Evaluation failed: {}", e)))?;

        match result.value {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::String(s)) => Ok(Some(s)),
            Some(other) => Ok(Some(other.to_string())),
        }
    }

    /// Bounding box of the first element matching `selector`.
    pub fn measure(&self, selector: &str) -> Result<ElementBox> {
        let script = format!(
            r#"(function(){{
                const el = document.querySelector({sel});
                if (!el) return null;
                const r = el.getBoundingClientRect();
                return JSON.stringify({{ x: r.x, y: r.y, width: r.width, height: r.height }});
            }})()"#,
            sel = js_string(selector)
        );
        let json = self
            .eval_string(&script, false)?
            .ok_or_else(|| Error::ElementNotFound(selector.to_string()))?;
        serde_json::from_str(&json)
            .map_err(|e| Error::Script(format!("unexpected bounding box {}: {}", json, e)))
    }

    fn window_metrics(&self) -> Result<WindowMetrics> {
        let json = self
            .eval_string(
                "JSON.stringify({ outerWidth: window.outerWidth, outerHeight: window.outerHeight, \
                 innerWidth: window.innerWidth, innerHeight: window.innerHeight })",
                false,
            )?
            .ok_or_else(|| Error::Script("window metrics unavailable".into()))?;
        serde_json::from_str(&json)
            .map_err(|e| Error::Script(format!("unexpected window metrics {}: {}", json, e)))
    }

    /// Resize the window so the page viewport becomes exactly `target`.
    ///
    /// The browser chrome may change size along with the window, so a
    /// second resize corrects for the new delta. A viewport that still
    /// differs afterwards is an error.
    pub fn fit_viewport(&self, target: Viewport) -> Result<Viewport> {
        if target.width == 0 || target.height == 0 {
            return Err(Error::Capture(format!(
                "frame element has an empty box ({}x{})",
                target.width, target.height
            )));
        }

        let mut metrics = self.window_metrics()?;
        for attempt in 1..=FIT_ATTEMPTS {
            let (extra_w, extra_h) = metrics.chrome_size();
            debug!(
                "resize attempt {}: browser chrome adds {}x{} around the viewport",
                attempt, extra_w, extra_h
            );
            self.tab()?
                .set_bounds(Bounds::Normal {
                    left: None,
                    top: None,
                    width: Some(f64::from(target.width + extra_w)),
                    height: Some(f64::from(target.height + extra_h)),
                })
                .map_err(|e| Error::Cdp(format!("Failed to resize window: {}", e)))?;

            metrics = self.settle_window(target)?;
            if metrics.viewport() == target {
                return Ok(target);
            }
        }

        let observed = metrics.viewport();
        Err(Error::Capture(format!(
            "viewport is {}x{}, wanted {}x{} (window manager may clamp the size)",
            observed.width, observed.height, target.width, target.height
        )))
    }

    /// Poll the window until its viewport reaches `target` or stops changing.
    fn settle_window(&self, target: Viewport) -> Result<WindowMetrics> {
        let deadline = Instant::now() + SETTLE_TIMEOUT;
        let mut settle = Settle::new(target);
        loop {
            let metrics = self.window_metrics()?;
            if settle.observe(metrics.viewport()) || Instant::now() >= deadline {
                return Ok(metrics);
            }
            std::thread::sleep(SETTLE_POLL);
        }
    }

    /// Scroll the element to the viewport's top-left and re-measure it.
    pub fn scroll_into_view(&self, selector: &str) -> Result<ElementBox> {
        let script = format!(
            r#"(function(){{
                const el = document.querySelector({sel});
                if (!el) return null;
                el.scrollIntoView({{ block: 'start', inline: 'start' }});
                return 'ok';
            }})()"#,
            sel = js_string(selector)
        );
        self.eval_string(&script, false)?
            .ok_or_else(|| Error::ElementNotFound(selector.to_string()))?;
        self.measure(selector)
    }

    /// Start recording the tab; chunks are forwarded to `chunks`.
    pub fn start_capture(&self, selector: &str, chunks: ChunkSender, timeslice: Duration) -> Result<()> {
        let tab = self.tab()?;

        tab.expose_function(
            CHUNK_BINDING,
            Arc::new(move |payload: serde_json::Value| chunks.deliver(payload)),
        )
        .map_err(|e| Error::Capture(format!("Failed to expose chunk binding: {}", e)))?;

        let install = RECORDER_SCRIPT.replace("{{BINDING}}", CHUNK_BINDING);
        self.eval_string(&install, false)?;

        let arm = format!(
            "window.__storyreel.arm({}, {})",
            js_string(selector),
            timeslice.as_millis()
        );
        match self.eval_string(&arm, false)?.as_deref() {
            Some("armed") => {}
            Some("missing") => return Err(Error::ElementNotFound(selector.to_string())),
            other => return Err(Error::Script(format!("recorder did not arm: {:?}", other))),
        }

        // A real input event gives the page the activation getDisplayMedia requires.
        tab.find_element(selector)
            .map_err(|_| Error::ElementNotFound(selector.to_string()))?
            .click()
            .map_err(|e| Error::Capture(format!("Failed to activate capture: {}", e)))?;

        let started = self.eval_string(
            "window.__storyreelStarted.then(() => 'started', (e) => 'error: ' + e)",
            true,
        )?;
        match started.as_deref() {
            Some("started") => Ok(()),
            other => Err(Error::Capture(format!(
                "page recorder failed to start: {}",
                other.unwrap_or("no result")
            ))),
        }
    }

    /// Stop the page recorder; resolves once the final chunk has been handed over.
    pub fn stop_capture(&self) -> Result<()> {
        let stopped = self.eval_string(
            "window.__storyreel ? window.__storyreel.stop() : 'idle'",
            true,
        )?;
        debug!("page recorder: {:?}", stopped);
        match stopped.as_deref() {
            Some("stopped") | Some("idle") => Ok(()),
            other => Err(Error::Capture(format!("page recorder did not stop: {:?}", other))),
        }
    }

    /// Close the tab and the browser process.
    pub fn close(self) -> Result<()> {
        if let Some(tab) = &self.tab {
            if let Err(e) = tab.close(true) {
                debug!("tab close failed: {}", e);
            }
        }
        // Dropping the browser kills the child process.
        drop(self.tab);
        drop(self.browser);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct WindowMetrics {
    outer_width: u32,
    outer_height: u32,
    inner_width: u32,
    inner_height: u32,
}

impl WindowMetrics {
    /// Space taken by toolbars and borders around the page.
    fn chrome_size(&self) -> (u32, u32) {
        (
            self.outer_width.saturating_sub(self.inner_width),
            self.outer_height.saturating_sub(self.inner_height),
        )
    }

    fn viewport(&self) -> Viewport {
        Viewport {
            width: self.inner_width,
            height: self.inner_height,
        }
    }
}

/// Tracks viewport readings while a resize takes effect.
#[derive(Debug)]
struct Settle {
    target: Viewport,
    last: Option<Viewport>,
    repeats: u32,
}

impl Settle {
    fn new(target: Viewport) -> Self {
        Self { target, last: None, repeats: 0 }
    }

    /// Record a reading; true once it matches the target or has been
    /// repeated `SETTLE_READINGS` times.
    fn observe(&mut self, viewport: Viewport) -> bool {
        if viewport == self.target {
            return true;
        }
        if self.last == Some(viewport) {
            self.repeats += 1;
        } else {
            self.last = Some(viewport);
            self.repeats = 1;
        }
        self.repeats >= SETTLE_READINGS
    }
}

/// Quote `s` as a JavaScript string literal.
fn js_string(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}
