// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! System-reminder stripping.
//!
//! Worker events can carry `<system-reminder>…</system-reminder>`
//! segments that must never reach a client. Inline occurrences collapse
//! to nothing; occurrences spanning lines leave a single newline so
//! surrounding prose does not fuse. Whitespace is then normalized:
//! runs of spaces collapse to one, runs of three or more newlines to two.

const OPEN: &str = "<system-reminder>";
const CLOSE: &str = "</system-reminder>";

/// Remove every reminder segment from one string.
pub fn strip_system_reminders(input: &str) -> String {
    if !input.contains(OPEN) {
        return input.to_string();
    }

    let mut stripped = String::with_capacity(input.len());
    let mut rest = input;
    loop {
        let Some(start) = rest.find(OPEN) else {
            stripped.push_str(rest);
            break;
        };
        stripped.push_str(&rest[..start]);
        let after_open = &rest[start + OPEN.len()..];
        let Some(end) = after_open.find(CLOSE) else {
            // Unterminated reminder: drop the tail rather than leak it.
            break;
        };
        if after_open[..end].contains('\n') {
            stripped.push('\n');
        }
        rest = &after_open[end + CLOSE.len()..];
    }

    normalize_whitespace(&stripped)
}

/// Collapse runs of spaces to one space and runs of 3+ newlines to two.
fn normalize_whitespace(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut spaces = 0usize;
    let mut newlines = 0usize;
    for c in input.chars() {
        match c {
            ' ' => {
                spaces += 1;
                newlines = 0;
            }
            '\n' => {
                newlines += 1;
                spaces = 0;
                if newlines <= 2 {
                    out.push('\n');
                }
            }
            other => {
                if spaces > 0 {
                    out.push(' ');
                    spaces = 0;
                }
                newlines = 0;
                out.push(other);
            }
        }
    }
    if spaces > 0 {
        out.push(' ');
    }
    out
}

/// Strip reminders from every string field of a JSON value, recursively.
pub fn clean_value(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::String(s) => {
            if s.contains(OPEN) {
                *s = strip_system_reminders(s);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                clean_value(item);
            }
        }
        serde_json::Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                clean_value(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
#[path = "sanitize_tests.rs"]
mod tests;
