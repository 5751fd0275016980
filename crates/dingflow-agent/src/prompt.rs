// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! System instructions sent ahead of every user turn.

use dingflow_config::model::BridgeConfig;

/// Teaches the backend how to hand local artifacts back to the bridge.
pub const MEDIA_MARKER_INSTRUCTIONS: &str = r#"## Sending files to the user

You are replying inside DingTalk. To deliver a local file you created, embed a marker in your reply. The bridge uploads the file, sends it as a separate message and removes the marker from the text.

- File: [DINGTALK_FILE]{"path": "/absolute/path/report.pdf", "fileName": "report.pdf", "fileType": "pdf"}[/DINGTALK_FILE]
- Video: [DINGTALK_VIDEO]{"path": "/absolute/path/clip.mp4"}[/DINGTALK_VIDEO]
- Audio: [DINGTALK_AUDIO]{"path": "/absolute/path/voice.mp3", "duration": 12}[/DINGTALK_AUDIO]
- Image: write a Markdown image with a local path, for example ![chart](/absolute/path/chart.png). It is uploaded and shown inline.

Paths must be absolute or start with ~/. Files larger than 20 MB are rejected. Never put a marker inside a code block."#;

/// Builds the system messages for one request.
pub fn system_instructions(bridge: &BridgeConfig) -> Vec<String> {
    let mut instructions = Vec::new();
    if let Some(prompt) = bridge.system_prompt.as_deref().map(str::trim)
        && !prompt.is_empty()
    {
        instructions.push(prompt.to_string());
    }
    if bridge.enable_media_markers {
        instructions.push(MEDIA_MARKER_INSTRUCTIONS.to_string());
    }
    instructions
}
