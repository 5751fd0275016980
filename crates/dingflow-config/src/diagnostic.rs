// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Config diagnostics rendered through miette.
//!
//! Figment reports every problem it hits; each one becomes a [`ConfigError`]
//! pointing at the offending key in the TOML file when it can be located.

#![allow(unused_assignments)] // miette's Diagnostic derive generates code triggering this lint

use figment::error::Kind;
use miette::{Diagnostic, NamedSource, SourceSpan};
use thiserror::Error;

/// Jaro-Winkler score a candidate key must beat to be offered as a fix.
const SUGGESTION_THRESHOLD: f64 = 0.75;

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("unknown configuration key `{key}`")]
    #[diagnostic(
        code(dingflow::config::unknown_key),
        help("{}", unknown_key_help(suggestion.as_deref(), valid_keys))
    )]
    UnknownKey {
        key: String,
        suggestion: Option<String>,
        /// Comma-separated keys accepted in the same table.
        valid_keys: String,
        #[label("not a dingflow setting")]
        span: Option<SourceSpan>,
        #[source_code]
        src: Option<NamedSource<String>>,
    },

    #[error("`{key}` has the wrong type: {detail}")]
    #[diagnostic(code(dingflow::config::invalid_type), help("expected {expected}"))]
    InvalidType {
        key: String,
        detail: String,
        expected: String,
        #[label("set here")]
        span: Option<SourceSpan>,
        #[source_code]
        src: Option<NamedSource<String>>,
    },

    #[error("missing required key `{key}`")]
    #[diagnostic(
        code(dingflow::config::missing_key),
        help("add `{key}` to dingflow.toml")
    )]
    MissingKey { key: String },

    #[error("{message}")]
    #[diagnostic(code(dingflow::config::validation))]
    Validation { message: String },

    #[error("configuration error: {0}")]
    #[diagnostic(code(dingflow::config::other))]
    Other(String),
}

fn unknown_key_help(suggestion: Option<&str>, valid_keys: &str) -> String {
    match suggestion {
        Some(fix) => format!("did you mean `{fix}`? Accepted here: {valid_keys}"),
        None => format!("accepted here: {valid_keys}"),
    }
}

/// Where a figment error sits: the table it belongs to and the file it came from.
struct Origin<'a> {
    table: Vec<String>,
    file: Option<(&'a str, &'a str)>,
}

impl<'a> Origin<'a> {
    fn of(error: &figment::Error, sources: &'a [(String, String)]) -> Self {
        let path = error.metadata.as_ref().and_then(|meta| match meta.source.as_ref() {
            Some(figment::Source::File(path)) => Some(path.display().to_string()),
            _ => None,
        });
        let file = path.and_then(|path| {
            sources
                .iter()
                .find(|(name, _)| *name == path)
                .map(|(name, content)| (name.as_str(), content.as_str()))
        });
        Self {
            table: error.path.clone(),
            file,
        }
    }

    fn dotted(&self, key: &str) -> String {
        self.table
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(key))
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(".")
    }

    fn locate(&self, key: &str) -> (Option<SourceSpan>, Option<NamedSource<String>>) {
        let Some((name, content)) = self.file else {
            return (None, None);
        };
        match find_key_offset(content, &self.table, key) {
            Some(offset) => (
                Some(SourceSpan::new(offset.into(), key.len())),
                Some(NamedSource::new(name, content.to_string())),
            ),
            None => (None, None),
        }
    }
}

/// Converts a (possibly multi-error) `figment::Error` into diagnostics.
///
/// `toml_sources` pairs each loaded file path with its content so spans can
/// be attached.
pub fn figment_to_config_errors(
    err: figment::Error,
    toml_sources: &[(String, String)],
) -> Vec<ConfigError> {
    err.into_iter()
        .map(|error| {
            let origin = Origin::of(&error, toml_sources);
            match &error.kind {
                Kind::UnknownField(field, accepted) => {
                    let (span, src) = origin.locate(field);
                    ConfigError::UnknownKey {
                        key: field.clone(),
                        suggestion: suggest_key(field, accepted),
                        valid_keys: accepted.join(", "),
                        span,
                        src,
                    }
                }
                Kind::MissingField(field) => ConfigError::MissingKey {
                    key: origin.dotted(field),
                },
                Kind::InvalidType(actual, expected) => {
                    // For type errors the last path segment is the key itself.
                    let mut table = origin.table.clone();
                    let key = table.pop().unwrap_or_default();
                    let origin = Origin { table, ..origin };
                    let (span, src) = origin.locate(&key);
                    ConfigError::InvalidType {
                        key: origin.dotted(&key),
                        detail: format!("found {actual}"),
                        expected: expected.clone(),
                        span,
                        src,
                    }
                }
                _ => ConfigError::Other(error.to_string()),
            }
        })
        .collect()
}

/// Byte offset of `key` inside the table `table` of a TOML document.
///
/// The table header is matched as `[a.b]` or `[[a.b]]`; an empty table means
/// the key is searched from the top of the document.
pub fn find_key_offset(content: &str, table: &[String], key: &str) -> Option<usize> {
    let header = table
        .iter()
        .filter(|part| part.parse::<usize>().is_err())
        .cloned()
        .collect::<Vec<_>>()
        .join(".");

    let mut offset = 0;
    let mut in_table = header.is_empty();
    for line in content.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if trimmed.starts_with('[') {
            let name = trimmed.trim_end().trim_matches(|c: char| c == '[' || c == ']').trim();
            in_table = !header.is_empty() && name == header;
        } else if in_table
            && let Some(rest) = trimmed.strip_prefix(key)
            && rest.trim_start().starts_with('=')
        {
            return Some(offset + (line.len() - trimmed.len()));
        }
        offset += line.len();
    }
    None
}

/// Closest accepted key to `unknown`, if any is similar enough.
pub fn suggest_key(unknown: &str, valid_keys: &[&str]) -> Option<String> {
    valid_keys
        .iter()
        .map(|candidate| (strsim::jaro_winkler(unknown, candidate), *candidate))
        .filter(|(score, _)| *score > SUGGESTION_THRESHOLD)
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, candidate)| candidate.to_string())
}

/// Prints every error to stderr with miette's graphical handler.
pub fn render_errors(errors: &[ConfigError]) {
    let handler = miette::GraphicalReportHandler::new();
    for error in errors {
        let mut rendered = String::new();
        match handler.render_report(&mut rendered, error as &dyn Diagnostic) {
            Ok(()) => eprint!("{rendered}"),
            Err(_) => eprintln!("Error: {error}"),
        }
    }
}
