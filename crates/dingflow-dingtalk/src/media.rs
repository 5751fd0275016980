// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Post-processing of a completed reply: upload the local media it refers
//! to and strip the markers.
//!
//! Passes run in a fixed order over the output of the previous pass:
//! inline images, then video, audio and file markers. Inline images are
//! rewritten in place to the uploaded media id. The other kinds are sent as
//! separate robot messages. Each marker yields one [`MediaOutcome`]; their
//! status lines are appended after the last pass.

use std::path::Path;
use std::sync::LazyLock;

use dingflow_core::DingflowError;
use dingflow_resilience::retry;
use regex::Regex;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::client::UploadKind;
use crate::markers::{self, MarkerBody, MarkerKind, MarkerPayload};
use crate::messaging::{Destination, Messenger};

/// Largest file, video or audio artifact accepted for upload.
pub const MAX_MEDIA_BYTES: u64 = 20 * 1024 * 1024;

static EXCESS_BLANK_LINES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

/// Result of handling one marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaOutcome {
    /// Uploaded and delivered as a separate message.
    Sent { kind: MarkerKind, name: String },
    /// Image uploaded and its reference rewritten to the media id.
    Inlined { name: String, media_id: String },
    NotFound { kind: MarkerKind, name: String },
    TooLarge { kind: MarkerKind, name: String, bytes: u64 },
    UploadFailed { kind: MarkerKind, name: String },
    SendFailed { kind: MarkerKind, name: String },
    /// Marker payload could not be parsed.
    Invalid { kind: MarkerKind },
}

impl MediaOutcome {
    /// Human-readable status line; `None` for successfully inlined images.
    pub fn status_line(&self) -> Option<String> {
        let line = match self {
            Self::Inlined { .. } => return None,
            Self::Sent { kind, name } => format!("✅ {} sent: {name}", kind.label()),
            Self::NotFound { kind, name } => format!("⚠️ {} not found: {name}", kind.label()),
            Self::TooLarge { kind, name, bytes } => format!(
                "⚠️ {} too large ({:.1} MB, limit 20 MB): {name}",
                kind.label(),
                *bytes as f64 / (1024.0 * 1024.0)
            ),
            Self::UploadFailed { kind, name } => format!("⚠️ {} upload failed: {name}", kind.label()),
            Self::SendFailed { kind, name } => format!("⚠️ {} could not be delivered: {name}", kind.label()),
            Self::Invalid { kind } => format!("⚠️ invalid {} marker ignored", kind.label()),
        };
        Some(line)
    }
}

/// Output of [`MediaPipeline::process`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedReply {
    pub text: String,
    pub outcomes: Vec<MediaOutcome>,
}

/// Uploads and delivers media referenced by a reply.
pub struct MediaPipeline {
    messenger: Messenger,
}

impl MediaPipeline {
    pub fn new(messenger: Messenger) -> Self {
        Self { messenger }
    }

    /// Runs every pass over `text`.
    ///
    /// Without an access token the markers are stripped and nothing else
    /// happens.
    pub async fn process(&self, text: &str, dest: &Destination) -> ProcessedReply {
        let token = match self.messenger.token(&dest.account).await {
            Ok(token) => token,
            Err(e) => {
                warn!(account = %dest.account.id, error = %e, "no upload token, stripping media markers");
                return ProcessedReply {
                    text: markers::strip_all(text),
                    outcomes: Vec::new(),
                };
            }
        };

        let mut outcomes = Vec::new();
        let mut current = self.image_pass(text, &token, &mut outcomes).await;
        for kind in [MarkerKind::Video, MarkerKind::Audio, MarkerKind::File] {
            current = self.marker_pass(&current, kind, &token, dest, &mut outcomes).await;
        }

        ProcessedReply {
            text: finish_text(current, &outcomes),
            outcomes,
        }
    }

    async fn image_pass(&self, text: &str, token: &str, outcomes: &mut Vec<MediaOutcome>) -> String {
        let found = markers::scan_images(text);
        if found.is_empty() {
            return text.to_string();
        }

        let mut edits = Vec::with_capacity(found.len());
        for marker in found {
            let MarkerBody::Image(image) = marker.body else { continue };
            let path = markers::resolve_local_path(&image.path);
            let name = display_name(&path, None);

            let outcome = if !is_file(&path).await {
                MediaOutcome::NotFound {
                    kind: MarkerKind::Image,
                    name,
                }
            } else {
                match self.upload(token, UploadKind::Image, &path).await {
                    Ok(media_id) => MediaOutcome::Inlined { name, media_id },
                    Err(_) => MediaOutcome::UploadFailed {
                        kind: MarkerKind::Image,
                        name,
                    },
                }
            };

            let replacement = match &outcome {
                MediaOutcome::Inlined { media_id, .. } => {
                    format!("![{}]({media_id})", image.alt.as_deref().unwrap_or("image"))
                }
                _ => image.alt.clone().unwrap_or_default(),
            };
            edits.push((marker.span, replacement));
            outcomes.push(outcome);
        }
        markers::replace_spans(text, &edits)
    }

    async fn marker_pass(
        &self,
        text: &str,
        kind: MarkerKind,
        token: &str,
        dest: &Destination,
        outcomes: &mut Vec<MediaOutcome>,
    ) -> String {
        let found = markers::scan_bracketed(text, kind);
        if found.is_empty() {
            return text.to_string();
        }

        let mut edits = Vec::with_capacity(found.len());
        for marker in found {
            let outcome = match marker.body {
                MarkerBody::Media(payload) => self.deliver(kind, &payload, token, dest).await,
                _ => MediaOutcome::Invalid { kind },
            };
            debug!(kind = kind.label(), ?outcome, "media marker handled");
            edits.push((marker.span, String::new()));
            outcomes.push(outcome);
        }
        markers::replace_spans(text, &edits)
    }

    async fn deliver(&self, kind: MarkerKind, payload: &MarkerPayload, token: &str, dest: &Destination) -> MediaOutcome {
        let path = markers::resolve_local_path(&payload.path);
        let name = display_name(&path, payload.file_name.as_deref());

        let size = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => return MediaOutcome::NotFound { kind, name },
        };
        if size > MAX_MEDIA_BYTES {
            return MediaOutcome::TooLarge {
                kind,
                name,
                bytes: size,
            };
        }

        let upload_kind = match kind {
            MarkerKind::Video => UploadKind::Video,
            MarkerKind::Audio => UploadKind::Voice,
            _ => UploadKind::File,
        };
        let media_id = match self.upload(token, upload_kind, &path).await {
            Ok(id) => id,
            Err(_) => return MediaOutcome::UploadFailed { kind, name },
        };

        let file_type = payload
            .file_type
            .clone()
            .or_else(|| extension_of(&name))
            .unwrap_or_else(|| "file".to_string());
        let file_param = json!({ "mediaId": media_id, "fileName": name, "fileType": file_type });

        let sent = match kind {
            MarkerKind::Audio => {
                let param = json!({
                    "mediaId": media_id,
                    "duration": audio_duration_ms(payload.duration).to_string(),
                });
                self.messenger.send(dest, "sampleAudio", &param).await
            }
            MarkerKind::Video => {
                let param = json!({
                    "videoMediaId": media_id,
                    "videoType": file_type,
                    "duration": payload.duration.unwrap_or(1).to_string(),
                });
                match self.messenger.send(dest, "sampleVideo", &param).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        debug!(error = %e, "video message rejected, sending as file");
                        self.messenger.send(dest, "sampleFile", &file_param).await
                    }
                }
            }
            _ => self.messenger.send(dest, "sampleFile", &file_param).await,
        };

        match sent {
            Ok(()) => {
                info!(kind = kind.label(), name = %name, "media delivered");
                MediaOutcome::Sent { kind, name }
            }
            Err(e) => {
                warn!(kind = kind.label(), name = %name, error = %e, "media message failed");
                MediaOutcome::SendFailed { kind, name }
            }
        }
    }

    async fn upload(&self, token: &str, kind: UploadKind, path: &Path) -> Result<String, DingflowError> {
        let client = self.messenger.client();
        let result = retry(self.messenger.retry_policy(), || client.upload_media(token, kind, path)).await;
        if let Err(e) = &result {
            warn!(kind = kind.as_str(), path = %path.display(), error = %e, "media upload failed");
        }
        result
    }
}

/// Tidies whitespace left by removed markers and appends status lines.
/// Text in which nothing was found is returned unchanged.
fn finish_text(text: String, outcomes: &[MediaOutcome]) -> String {
    if outcomes.is_empty() {
        return text;
    }
    let tidied = EXCESS_BLANK_LINES.replace_all(text.trim(), "\n\n").into_owned();
    let lines: Vec<String> = outcomes.iter().filter_map(MediaOutcome::status_line).collect();
    if lines.is_empty() {
        return tidied;
    }
    if tidied.is_empty() {
        return lines.join("\n");
    }
    format!("{tidied}\n\n{}", lines.join("\n"))
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

/// Name shown to users: the declared file name, else the path's last component.
fn display_name(path: &Path, declared: Option<&str>) -> String {
    declared
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .or_else(|| path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "unnamed".to_string())
}

/// Audio duration in milliseconds; the marker carries whole seconds.
fn audio_duration_ms(seconds: Option<u64>) -> u64 {
    seconds.unwrap_or(1).saturating_mul(1000)
}

fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
}
