// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tokenizer for media markers embedded in generated text.
//!
//! Out-of-band markers look like
//! `[DINGTALK_FILE]{"path":"/tmp/a.txt","fileName":"a.txt"}[/DINGTALK_FILE]`
//! (also `DINGTALK_VIDEO` and `DINGTALK_AUDIO`). Images are referenced
//! inline, either as Markdown `![alt](/local/path.png)` or as a bare local
//! path ending in an image extension.
//!
//! The tokenizer only finds spans; it never edits text. [`replace_spans`]
//! applies edits afterwards.

use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

/// Marker category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkerKind {
    Image,
    Video,
    Audio,
    File,
}

impl MarkerKind {
    /// Tag name for the bracketed marker kinds.
    pub fn tag(self) -> Option<&'static str> {
        match self {
            Self::Image => None,
            Self::Video => Some("DINGTALK_VIDEO"),
            Self::Audio => Some("DINGTALK_AUDIO"),
            Self::File => Some("DINGTALK_FILE"),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::File => "file",
        }
    }
}

/// JSON payload of a bracketed marker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkerPayload {
    pub path: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_type: Option<String>,
    /// Playback length in seconds, for audio and video.
    #[serde(default)]
    pub duration: Option<u64>,
}

/// An inline image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub alt: Option<String>,
    pub path: String,
}

/// What a marker span carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerBody {
    Media(MarkerPayload),
    Image(ImageRef),
    /// The bracketed payload was not valid JSON of the expected shape.
    Malformed(String),
}

/// One marker found in a text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub kind: MarkerKind,
    pub body: MarkerBody,
    /// Byte range of the whole marker in the scanned text.
    pub span: Range<usize>,
}

const IMAGE_EXTENSIONS: &str = "png|jpe?g|gif|bmp|webp";

static BRACKETED: LazyLock<[(MarkerKind, Regex); 3]> = LazyLock::new(|| {
    [MarkerKind::Video, MarkerKind::Audio, MarkerKind::File].map(|kind| {
        let tag = kind.tag().unwrap_or_default();
        let pattern = format!(r"(?s)\[{tag}\](.*?)\[/{tag}\]");
        (kind, Regex::new(&pattern).unwrap())
    })
});

static MARKDOWN_IMAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"!\[([^\]]*)\]\(\s*([^)\s]+)\s*\)").unwrap()
});

static BARE_IMAGE_PATH: LazyLock<Regex> = LazyLock::new(|| {
    let pattern = format!(
        r#"(?i)(?:^|[\s(（：，,])((?:file://)?(?:~|\.{{1,2}})?/[^\s<>"'`()\[\]]+\.(?:{IMAGE_EXTENSIONS}))"#
    );
    Regex::new(&pattern).unwrap()
});

/// Finds every bracketed marker of `kind` in `text`, in order.
pub fn scan_bracketed(text: &str, kind: MarkerKind) -> Vec<Marker> {
    let Some((_, re)) = BRACKETED.iter().find(|(k, _)| *k == kind) else {
        return Vec::new();
    };
    re.captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let inner = caps.get(1)?.as_str().trim();
            let body = match serde_json::from_str::<MarkerPayload>(inner) {
                Ok(payload) if !payload.path.trim().is_empty() => MarkerBody::Media(payload),
                Ok(_) => MarkerBody::Malformed("empty path".into()),
                Err(e) => MarkerBody::Malformed(e.to_string()),
            };
            Some(Marker {
                kind,
                body,
                span: whole.range(),
            })
        })
        .collect()
}

/// Finds local image references: Markdown images pointing at local paths,
/// then bare image paths outside of those.
pub fn scan_images(text: &str) -> Vec<Marker> {
    let mut markers: Vec<Marker> = MARKDOWN_IMAGE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let path = caps.get(2)?.as_str();
            if !is_local_path(path) {
                return None;
            }
            let alt = caps.get(1).map(|m| m.as_str().trim()).filter(|a| !a.is_empty());
            Some(Marker {
                kind: MarkerKind::Image,
                body: MarkerBody::Image(ImageRef {
                    alt: alt.map(str::to_string),
                    path: path.to_string(),
                }),
                span: whole.range(),
            })
        })
        .collect();

    let markdown_spans: Vec<Range<usize>> = MARKDOWN_IMAGE
        .find_iter(text)
        .map(|m| m.range())
        .collect();
    for caps in BARE_IMAGE_PATH.captures_iter(text) {
        let Some(m) = caps.get(1) else { continue };
        let span = m.range();
        if markdown_spans.iter().any(|s| s.start <= span.start && span.end <= s.end)
            || !ends_path(&text[span.end..])
            || text[..span.start].trim_end().ends_with("](")
        {
            continue;
        }
        markers.push(Marker {
            kind: MarkerKind::Image,
            body: MarkerBody::Image(ImageRef {
                alt: None,
                path: m.as_str().to_string(),
            }),
            span,
        });
    }

    markers.sort_by_key(|m| m.span.start);
    markers
}

/// Whether a bare path may end where `rest` begins: at the end of the text,
/// whitespace, closing punctuation, or a full stop that ends a sentence.
fn ends_path(rest: &str) -> bool {
    let mut chars = rest.chars();
    match chars.next() {
        None => true,
        Some('.') => chars.next().is_none_or(char::is_whitespace),
        Some(c) => c.is_whitespace() || ",;:!?)]}>\"'`，。；：！？）」》".contains(c),
    }
}

/// Whether `path` names a local file rather than a remote resource.
pub fn is_local_path(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") || lower.starts_with("data:") {
        return false;
    }
    lower.starts_with("file://")
        || path.starts_with('/')
        || path.starts_with("~/")
        || path.starts_with("./")
        || path.starts_with("../")
}

/// Resolves `file://` and `~/` prefixes to a filesystem path.
pub fn resolve_local_path(path: &str) -> std::path::PathBuf {
    let path = path.strip_prefix("file://").unwrap_or(path);
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    std::path::PathBuf::from(path)
}

/// Replaces non-overlapping spans in `text`. `edits` may be in any order.
pub fn replace_spans(text: &str, edits: &[(Range<usize>, String)]) -> String {
    let mut ordered: Vec<&(Range<usize>, String)> = edits.iter().collect();
    ordered.sort_by_key(|(span, _)| span.start);

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for (span, replacement) in ordered {
        if span.start < cursor || span.end > text.len() {
            continue;
        }
        out.push_str(&text[cursor..span.start]);
        out.push_str(replacement);
        cursor = span.end;
    }
    out.push_str(&text[cursor..]);
    out
}

/// Removes every complete marker of every kind, leaving text otherwise untouched.
pub fn strip_all(text: &str) -> String {
    let mut edits: Vec<(Range<usize>, String)> = scan_images(text)
        .into_iter()
        .map(|m| (m.span, String::new()))
        .collect();
    for kind in [MarkerKind::Video, MarkerKind::Audio, MarkerKind::File] {
        edits.extend(scan_bracketed(text, kind).into_iter().map(|m| (m.span, String::new())));
    }
    replace_spans(text, &edits)
}

/// Hides markers from a partial stream: complete bracketed markers are
/// removed and an unterminated trailing marker is cut off. Image
/// references are left in place.
pub fn hide_for_display(text: &str) -> String {
    let mut edits = Vec::new();
    for kind in [MarkerKind::Video, MarkerKind::Audio, MarkerKind::File] {
        edits.extend(scan_bracketed(text, kind).into_iter().map(|m| (m.span, String::new())));
    }
    let cleaned = replace_spans(text, &edits);

    let open = [MarkerKind::Video, MarkerKind::Audio, MarkerKind::File]
        .iter()
        .filter_map(|k| k.tag())
        .filter_map(|tag| cleaned.find(&format!("[{tag}]")))
        .min();
    match open {
        Some(at) => cleaned[..at].trim_end().to_string(),
        None => cleaned,
    }
}
