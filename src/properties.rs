/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Read-merge-write editing of flat `key=value` properties files.
//!
//! Only the lines holding the edited key are rewritten. Comments, blank lines,
//! ordering, line endings and every other key are kept byte for byte, so setting the
//! same value twice produces identical files.

use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PropertiesError {
    #[error("Unable to read properties file {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to write properties file {path:?}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Sets `key` to `value` in the properties file at `path`.
pub fn set_property(path: &Path, key: &str, value: &str) -> Result<(), PropertiesError> {
    let content = fs::read_to_string(path).map_err(|source| PropertiesError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let merged = merge_property(&content, key, value);
    if merged == content {
        debug!("{:?} already has {}={}", path, key, value);
        return Ok(());
    }

    fs::write(path, merged).map_err(|source| PropertiesError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Returns `content` with every assignment of `key` replaced by `key=value`. The key is
/// appended at the end when it isn't present.
pub fn merge_property(content: &str, key: &str, value: &str) -> String {
    let line_ending = if content.contains("\r\n") { "\r\n" } else { "\n" };
    let assignment = format!("{}={}", key, value);

    let mut merged = String::with_capacity(content.len() + assignment.len() + 2);
    let mut found = false;
    let mut continuation = false;
    let mut skipping = false;

    for line in content.split_inclusive('\n') {
        let body = line.trim_end_matches(['\r', '\n']);
        let was_continuation = continuation;
        // comments never continue, only values do
        continuation =
            (was_continuation || parse_key(body).is_some()) && ends_with_continuation(body);

        if was_continuation {
            // remainder of a multi-line value
            if !skipping {
                merged.push_str(line);
            }
            continue;
        }

        skipping = false;
        if parse_key(body) == Some(key) {
            found = true;
            skipping = true;
            merged.push_str(&assignment);
            merged.push_str(&line[body.len()..]);
        } else {
            merged.push_str(line);
        }
    }

    if !found {
        if !merged.is_empty() && !merged.ends_with('\n') {
            merged.push_str(line_ending);
        }
        merged.push_str(&assignment);
        merged.push_str(line_ending);
    }

    merged
}

/// Value of the first assignment of `key`, without unescaping.
pub fn get_property<'a>(content: &'a str, key: &str) -> Option<&'a str> {
    content.lines().find_map(|line| {
        let trimmed = line.trim_start();
        if parse_key(trimmed) != Some(key) {
            return None;
        }
        let rest = trimmed[key.len()..].trim_start();
        let rest = rest
            .strip_prefix('=')
            .or_else(|| rest.strip_prefix(':'))
            .unwrap_or(rest);
        Some(rest.trim())
    })
}

/// Key of an assignment line, `None` for blank lines and comments.
fn parse_key(line: &str) -> Option<&str> {
    let line = line.trim_start();
    if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
        return None;
    }

    let mut escaped = false;
    for (idx, ch) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '=' | ':' => return Some(&line[..idx]),
            ch if ch.is_whitespace() => return Some(&line[..idx]),
            _ => {}
        }
    }
    Some(line)
}

fn ends_with_continuation(line: &str) -> bool {
    line.chars().rev().take_while(|ch| *ch == '\\').count() % 2 == 1
}
