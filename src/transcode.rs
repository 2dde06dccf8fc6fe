//! Optional MP4 export of a finished WebM recording (requires `ffmpeg` on PATH)

use crate::{Error, Result};
use log::info;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

pub async fn is_ffmpeg_on_path() -> bool {
    Command::new("ffmpeg")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// `videos/demo.webm` -> `videos/demo.mp4`
pub fn mp4_path(webm: &Path) -> PathBuf {
    webm.with_extension("mp4")
}

/// Convert `webm` to H.264/AAC MP4 next to it; returns the MP4 path.
pub async fn to_mp4(webm: &Path) -> Result<PathBuf> {
    if !is_ffmpeg_on_path().await {
        return Err(Error::Transcode(
            "ffmpeg is required for MP4 export, but was not found on PATH".into(),
        ));
    }

    let out = mp4_path(webm);
    info!("🎞️ Converting {} -> {}", webm.display(), out.display());

    let output = Command::new("ffmpeg")
        .args(["-y", "-loglevel", "error", "-i"])
        .arg(webm)
        .args(["-c:v", "libx264", "-pix_fmt", "yuv420p", "-c:a", "aac", "-movflags", "+faststart"])
        .arg(&out)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| Error::Transcode(format!("failed to spawn ffmpeg: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Transcode(format!(
            "ffmpeg exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(out)
}
