//! End-to-end runs of the recording pipeline against a scratch project

use std::path::{Path, PathBuf};
use std::time::Duration;
use storyreel::{pipeline, Error, RecorderConfig, Viewport};

const STORY: &str = r#"{
  "metadata": { "name": "demo", "description": "two friends chatting" },
  "messages": [
    { "sender": "A", "text": "hi" },
    { "sender": "B", "text": "hello" }
  ]
}"#;

const INDEX: &str = r#"<!DOCTYPE html>
<html>
<head><style>body { margin: 0 } .backgroundGif { width: 360px; height: 640px; background: #336 }</style></head>
<body><div class="backgroundGif"></div></body>
</html>"#;

struct Project {
    dir: tempfile::TempDir,
}

impl Project {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("stories")).unwrap();
        std::fs::write(dir.path().join("stories/demo.json"), STORY).unwrap();
        std::fs::write(dir.path().join("index.html"), INDEX).unwrap();
        std::fs::create_dir_all(dir.path().join("audios")).unwrap();
        std::fs::write(
            dir.path().join("audios/messages_with_audio.json"),
            r#"{"duration_total": 2.0, "messages": []}"#,
        )
        .unwrap();
        Self { dir }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn video(&self) -> PathBuf {
        self.root().join("videos/demo.webm")
    }

    /// Config that never touches port 8080 or a real browser unless asked.
    fn config(&self) -> RecorderConfig {
        RecorderConfig {
            root: self.root().to_path_buf(),
            narration_program: PathBuf::from("/bin/sh"),
            narration_args: vec!["-c".into(), "exit 0".into()],
            bind_addr: "127.0.0.1:0".into(),
            ready_poll_interval_ms: 50,
            ready_timeout_ms: 2_000,
            browser_path: self.root().join("no-such-browser"),
            headless: true,
            ..Default::default()
        }
    }
}

#[tokio::test]
async fn missing_story_fails_before_anything_runs() {
    let project = Project::new();
    let mut config = project.config();
    // Leaves a marker file if it is ever spawned.
    config.narration_args = vec!["-c".into(), "touch narrated".into()];

    let err = pipeline::run(&config, "@missing.json").await.unwrap_err();
    assert!(matches!(err, Error::StoryNotFound(_)), "{err:?}");
    assert!(!project.root().join("narrated").exists());
    assert!(!project.root().join("videos").exists());
}

#[cfg(unix)]
#[tokio::test]
async fn narration_failure_stops_the_run() {
    let project = Project::new();
    let mut config = project.config();
    config.narration_args = vec!["-c".into(), "exit 2".into()];

    let err = pipeline::run(&config, "@demo.json").await.unwrap_err();
    assert!(matches!(err, Error::ProcessFailure { code: Some(2) }), "{err:?}");
    assert!(!project.video().exists());
    assert!(!project.root().join("videos").exists());
}

#[cfg(unix)]
#[tokio::test]
async fn narration_output_is_read_after_it_finishes() {
    let project = Project::new();
    std::fs::remove_file(project.root().join("audios/messages_with_audio.json")).unwrap();
    let mut config = project.config();
    // The generator writes a malformed manifest.
    config.narration_args = vec![
        "-c".into(),
        r#"echo '{"messages": []}' > audios/messages_with_audio.json"#.into(),
    ];

    let err = pipeline::run(&config, "demo.json").await.unwrap_err();
    assert!(
        matches!(err, Error::Schema { field: "duration_total", .. }),
        "{err:?}"
    );
    assert!(!project.video().exists());
}

#[cfg(unix)]
#[tokio::test]
async fn server_that_never_becomes_ready_times_out() {
    let project = Project::new();
    let mut config = project.config();
    config.ready_path = "/never-there.html".into();
    config.ready_timeout_ms = 600;

    let started = std::time::Instant::now();
    let err = pipeline::run(&config, "@demo.json").await.unwrap_err();
    // A launch attempt would have surfaced as BrowserLaunch instead.
    assert!(matches!(err, Error::ServerTimeout(600)), "{err:?}");
    assert!(started.elapsed() >= Duration::from_millis(600));
    assert!(!project.video().exists());
}

#[cfg(unix)]
#[tokio::test]
async fn missing_browser_is_a_launch_error() {
    let project = Project::new();
    let config = project.config();

    let err = pipeline::run(&config, "@demo.json").await.unwrap_err();
    assert!(matches!(err, Error::BrowserLaunch(_)), "{err:?}");
    assert!(!project.video().exists());
}

#[cfg(unix)]
#[tokio::test]
#[ignore] // Requires Chrome; set STORYREEL_BROWSER to its executable
async fn records_demo_story_for_manifest_duration() {
    let project = Project::new();
    let mut config = project.config();
    if let Some(browser) = std::env::var_os(storyreel::config::BROWSER_ENV_VAR) {
        config.browser_path = PathBuf::from(browser);
    } else {
        config.browser_path = RecorderConfig::default().browser_path;
    }

    let report = pipeline::run(&config, "@demo.json").await.unwrap();
    assert_eq!(report.story, "demo");
    assert_eq!(report.output, project.video());
    assert_eq!(report.duration, Duration::from_secs(2));
    assert!(report.recorded_for >= Duration::from_secs(2));
    assert!(report.recorded_for < Duration::from_secs(4));
    assert!(report.stats.chunks > 0);
    // The page is recorded at exactly the frame element's size.
    assert_eq!(report.viewport, Viewport { width: 360, height: 640 });
    assert_eq!(report.frame.viewport(), report.viewport);
    assert!(report.frame.is_at_origin(), "{:?}", report.frame);

    let bytes = std::fs::read(project.video()).unwrap();
    assert_eq!(bytes.len() as u64, report.stats.bytes);
    // EBML magic at the start of every WebM file.
    assert_eq!(&bytes[..4], &[0x1A, 0x45, 0xDF, 0xA3]);
}
