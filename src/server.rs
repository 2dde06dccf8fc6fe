//! Local static content server and its readiness probe
//!
//! The browser loads the story page and its assets from this server, so the
//! served root is the project directory.

use crate::{Error, Result};
use log::{debug, info, warn};
use std::fs::File;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tiny_http::{Header, Method, Request, Response, Server};

/// A running static file server
pub struct ContentServer {
    server: Arc<Server>,
    addr: SocketAddr,
    worker: Option<JoinHandle<()>>,
}

impl ContentServer {
    /// Bind `addr` and start serving files below `root`.
    pub fn start(addr: &str, root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let server_root = root.clone();
        let server = Server::http(addr).map_err(|e| Error::ServerStart(format!("{}: {}", addr, e)))?;
        let bound = server
            .server_addr()
            .to_ip()
            .ok_or_else(|| Error::ServerStart(format!("{} is not an IP listener", addr)))?;
        let server = Arc::new(server);

        let listener = server.clone();
        let worker = std::thread::Builder::new()
            .name("storyreel-content".into())
            .spawn(move || {
                for request in listener.incoming_requests() {
                    serve(&server_root, request);
                }
                debug!("content server loop exited");
            })
            .map_err(|e| Error::ServerStart(format!("failed to spawn server thread: {}", e)))?;

        info!("🌐 Serving {} on http://{}", root.display(), bound);
        Ok(Self {
            server,
            addr: bound,
            worker: Some(worker),
        })
    }

    /// Address actually bound (useful when started on port 0).
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `http://<addr>` with no trailing path.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Stop accepting requests and release the listening socket.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.server.unblock();
            if worker.join().is_err() {
                warn!("content server thread panicked");
            }
            info!("🌐 Content server on {} stopped", self.addr);
        }
    }
}

impl Drop for ContentServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn serve(root: &Path, request: Request) {
    let method = request.method().clone();
    let url = request.url().to_string();

    let response = if method != Method::Get && method != Method::Head {
        Response::from_string("Method Not Allowed").with_status_code(405).boxed()
    } else {
        match resolve_request_path(root, &url) {
            Resolved::File(path) => match File::open(&path) {
                Ok(file) => {
                    let mut response = Response::from_file(file);
                    if let Ok(header) =
                        Header::from_bytes(&b"Content-Type"[..], content_type(&path).as_bytes())
                    {
                        response.add_header(header);
                    }
                    response.boxed()
                }
                Err(e) => {
                    warn!("failed to open {}: {}", path.display(), e);
                    Response::from_string("Internal Server Error").with_status_code(500).boxed()
                }
            },
            Resolved::Forbidden => Response::from_string("Forbidden").with_status_code(403).boxed(),
            Resolved::NotFound => Response::from_string("Not Found").with_status_code(404).boxed(),
        }
    };

    debug!("{} {} -> {}", method, url, response.status_code().0);
    if let Err(e) = request.respond(response) {
        debug!("failed to respond to {}: {}", url, e);
    }
}

/// Outcome of mapping a request URL onto the served root
#[derive(Debug, PartialEq, Eq)]
pub enum Resolved {
    File(PathBuf),
    Forbidden,
    NotFound,
}

/// Map a request target (`/a/b.js?x=1`) to a file below `root`.
pub fn resolve_request_path(root: &Path, url: &str) -> Resolved {
    let path = url.split(['?', '#']).next().unwrap_or("");
    let Some(decoded) = percent_decode(path) else {
        return Resolved::NotFound;
    };

    let mut target = root.to_path_buf();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Resolved::Forbidden,
            s if s.contains('\\') || s.contains('\0') || Path::new(s).has_root() => {
                return Resolved::Forbidden;
            }
            s => target.push(s),
        }
    }

    if target.is_dir() {
        target.push("index.html");
    }
    if target.is_file() {
        Resolved::File(target)
    } else {
        Resolved::NotFound
    }
}

fn percent_decode(input: &str) -> Option<String> {
    percent_encoding::percent_decode_str(input)
        .decode_utf8()
        .ok()
        .map(|decoded| decoded.into_owned())
}

/// MIME type for a served file, by extension.
pub fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("js") | Some("mjs") => "text/javascript; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("ogg") => "audio/ogg",
        Some("gif") => "image/gif",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        Some("webp") => "image/webp",
        Some("webm") => "video/webm",
        Some("mp4") => "video/mp4",
        Some("woff2") => "font/woff2",
        Some("woff") => "font/woff",
        Some("ttf") => "font/ttf",
        _ => "application/octet-stream",
    }
}

/// Poll `url` every `interval` until it answers 200 or `timeout` elapses.
pub async fn wait_until_ready(url: &str, interval: Duration, timeout: Duration) -> Result<()> {
    info!("Waiting for {} (timeout: {:?})", url, timeout);
    let client = reqwest::Client::builder()
        .timeout(interval.max(Duration::from_secs(1)))
        .build()
        .map_err(|e| Error::Other(format!("failed to build HTTP client: {}", e)))?;

    let start = Instant::now();
    loop {
        match client.get(url).send().await {
            Ok(response) if response.status() == reqwest::StatusCode::OK => {
                debug!("{} ready after {:?}", url, start.elapsed());
                return Ok(());
            }
            Ok(response) => debug!("readiness probe got {}", response.status()),
            Err(e) => debug!("server not ready yet: {}", e),
        }

        if start.elapsed() >= timeout {
            return Err(Error::ServerTimeout(timeout.as_millis() as u64));
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_types_by_extension() {
        assert_eq!(content_type(Path::new("index.html")), "text/html; charset=utf-8");
        assert_eq!(content_type(Path::new("a/b/bg.GIF")), "image/gif");
        assert_eq!(content_type(Path::new("audios/audio_0.mp3")), "audio/mpeg");
        assert_eq!(content_type(Path::new("noext")), "application/octet-stream");
    }

    #[test]
    fn percent_decoding() {
        assert_eq!(percent_decode("/a%20b.json").as_deref(), Some("/a b.json"));
        assert_eq!(percent_decode("/caf%C3%A9").as_deref(), Some("/café"));
        assert_eq!(percent_decode("/bad%ff").as_deref(), None);
        // Malformed escapes are kept as written.
        assert_eq!(percent_decode("/100%zz").as_deref(), Some("/100%zz"));
    }

    #[test]
    fn traversal_is_forbidden() {
        let root = std::env::temp_dir();
        assert_eq!(resolve_request_path(&root, "/../etc/passwd"), Resolved::Forbidden);
        assert_eq!(resolve_request_path(&root, "/a/%2e%2e/%2e%2e/x"), Resolved::Forbidden);
    }

    #[test]
    fn root_maps_to_index() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html></html>").unwrap();
        assert_eq!(
            resolve_request_path(dir.path(), "/?t=1"),
            Resolved::File(dir.path().join("index.html"))
        );
        assert_eq!(resolve_request_path(dir.path(), "/missing.js"), Resolved::NotFound);
    }
}
