//! Story definitions: resolving the CLI argument to a file and reading it

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Marker some callers prepend to the story name (`@story.json`).
pub const STORY_MARKER: char = '@';

/// Strip one optional leading marker from a story argument.
///
/// ```
/// assert_eq!(storyreel::story::normalize_story_name("@demo.json"), "demo.json");
/// assert_eq!(storyreel::story::normalize_story_name("demo.json"), "demo.json");
/// ```
pub fn normalize_story_name(arg: &str) -> &str {
    arg.strip_prefix(STORY_MARKER).unwrap_or(arg)
}

/// Path of the story named by `arg` inside `stories_dir`.
pub fn story_path(stories_dir: &Path, arg: &str) -> PathBuf {
    stories_dir.join(normalize_story_name(arg))
}

/// Story metadata block
#[derive(Debug, Clone, Deserialize)]
pub struct StoryMetadata {
    /// Base name of the recording
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A story definition as read from `stories/`
///
/// Only `metadata` is interpreted here; the rest is content for the page.
#[derive(Debug, Clone)]
pub struct Story {
    pub path: PathBuf,
    pub metadata: StoryMetadata,
    pub content: serde_json::Map<String, serde_json::Value>,
}

impl Story {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_file() {
            return Err(Error::StoryNotFound(path));
        }
        let text = std::fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
        Self::parse(path, &text)
    }

    /// Parse story JSON; `path` is only used for error reporting.
    pub fn parse(path: PathBuf, text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text).map_err(|source| Error::Parse {
            path: path.clone(),
            source,
        })?;

        let serde_json::Value::Object(mut content) = value else {
            return Err(Error::Schema { path, field: "metadata" });
        };

        let metadata = content
            .remove("metadata")
            .ok_or_else(|| Error::Schema { path: path.clone(), field: "metadata" })?;
        let metadata: StoryMetadata = serde_json::from_value(metadata)
            .map_err(|_| Error::Schema { path: path.clone(), field: "metadata.name" })?;

        if metadata.name.trim().is_empty() || metadata.name.contains(['/', '\\']) {
            return Err(Error::Schema { path, field: "metadata.name" });
        }

        Ok(Self { path, metadata, content })
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Where the recording of this story is written.
    pub fn output_path(&self, videos_dir: &Path, extension: &str) -> PathBuf {
        videos_dir.join(format!("{}.{}", self.metadata.name, extension))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_is_stripped_once() {
        assert_eq!(normalize_story_name("@@x.json"), "@x.json");
        assert_eq!(normalize_story_name(""), "");
    }

    #[test]
    fn marker_does_not_change_resolution() {
        let dir = Path::new("stories");
        assert_eq!(story_path(dir, "@demo.json"), story_path(dir, "demo.json"));
        assert_eq!(story_path(dir, "demo.json"), PathBuf::from("stories/demo.json"));
    }

    #[test]
    fn parses_name_and_keeps_content() {
        let story = Story::parse(
            PathBuf::from("demo.json"),
            r##"{"metadata":{"name":"demo","tags":["#shorts"]},"messages":[{"sender":"A","text":"hi"}]}"##,
        )
        .unwrap();
        assert_eq!(story.name(), "demo");
        assert_eq!(story.metadata.tags, vec!["#shorts".to_string()]);
        assert!(story.metadata.description.is_none());
        assert!(story.content.contains_key("messages"));
        assert!(!story.content.contains_key("metadata"));
        assert_eq!(
            story.output_path(Path::new("videos"), "webm"),
            PathBuf::from("videos/demo.webm")
        );
    }

    #[test]
    fn invalid_json_is_parse_error() {
        let err = Story::parse(PathBuf::from("bad.json"), "{ not json").unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[test]
    fn missing_name_is_schema_error() {
        for text in [r#"{"messages":[]}"#, r#"{"metadata":{}}"#, r#"{"metadata":{"name":42}}"#, "[]"] {
            let err = Story::parse(PathBuf::from("s.json"), text).unwrap_err();
            assert!(matches!(err, Error::Schema { .. }), "{text}: {err:?}");
        }
    }

    #[test]
    fn name_with_separator_is_rejected() {
        let err = Story::parse(PathBuf::from("s.json"), r#"{"metadata":{"name":"../x"}}"#).unwrap_err();
        assert!(matches!(err, Error::Schema { field: "metadata.name", .. }));
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = Story::load("definitely/not/here.json").unwrap_err();
        assert!(matches!(err, Error::StoryNotFound(_)));
    }
}
