//! Reading and writing single checklist lines.
//!
//! A tagged line looks like
//! `- [ ] Buy milk #todoist #errand ⏫ 📅 2025-01-01 <!-- todoist-id:123 -->`.
//! Parsing pulls the metadata tokens out into a [`ParsedTask`]; serializing
//! writes them back in a fixed order so the structured fields survive a
//! parse/serialize round trip even when the original spacing does not.

use crate::error::SyncError;
use crate::models::{ParsedTask, Priority};
use chrono::{DateTime, NaiveDate, Utc};
use regex::{Captures, Regex};
use std::collections::HashSet;
use std::sync::LazyLock;

const ID_COMMENT_PREFIX: &str = "todoist-id:";

static TASK_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\s*)([-*])\s+\[([ xX])\]\s+(.*)$").expect("valid task line pattern")
});
static CHECKBOX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\s*[-*]\s+\[)([ xX])(\])").expect("valid checkbox pattern")
});
static ID_COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*todoist-id:\s*([A-Za-z0-9_-]+)\s*-->").expect("valid id comment pattern")
});
static DUE_EMOJI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"📅\x{FE0F}?\s*(\d{4}-\d{2}-\d{2})").expect("valid due pattern")
});
static SCHEDULED_EMOJI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"⏳\x{FE0F}?\s*(\d{4}-\d{2}-\d{2})").expect("valid scheduled pattern")
});
static DUE_TEXT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bdue:(\d{4}-\d{2}-\d{2})").expect("valid textual due pattern")
});
static HASHTAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(^|\s)#([A-Za-z0-9_-]+)").expect("valid hashtag pattern")
});

/// Parses and writes task lines for one configured sync marker.
#[derive(Clone, Debug)]
pub struct TaskCodec {
    marker: String,
    marker_name: String,
    marker_re: Regex,
}

impl TaskCodec {
    pub fn new(marker: &str) -> Result<Self, SyncError> {
        let marker = marker.trim();
        if marker.is_empty() {
            return Err(SyncError::Config("Sync marker must not be empty".to_string()));
        }
        let marker_re = Regex::new(&format!("(?i){}", regex::escape(marker)))
            .map_err(|e| SyncError::Config(format!("Invalid sync marker {marker:?}: {e}")))?;
        Ok(Self {
            marker: marker.to_string(),
            marker_name: marker.trim_start_matches('#').to_lowercase(),
            marker_re,
        })
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    pub fn has_marker(&self, line: &str) -> bool {
        self.marker_re.is_match(line)
    }

    pub fn parse_line(
        &self,
        line: &str,
        line_index: usize,
        file_path: &str,
        modified_at: DateTime<Utc>,
    ) -> Option<ParsedTask> {
        let caps = TASK_LINE_RE.captures(line)?;
        if !self.has_marker(line) {
            return None;
        }

        let completed = caps[3].eq_ignore_ascii_case("x");
        let body = caps.get(4).map(|m| m.as_str()).unwrap_or_default();
        let remote_id = remote_id(body);
        let without_id = ID_COMMENT_RE.replace_all(body, " ");

        let due_date = first_date(&DUE_EMOJI_RE, &without_id)
            .or_else(|| first_date(&SCHEDULED_EMOJI_RE, &without_id))
            .or_else(|| first_date(&DUE_TEXT_RE, &without_id));
        let priority = Priority::LADDER
            .into_iter()
            .find(|p| p.glyph().is_some_and(|glyph| without_id.contains(glyph)))
            .unwrap_or_default();
        let labels = HASHTAG_RE
            .captures_iter(&without_id)
            .map(|c| c[2].to_string())
            .filter(|label| label.to_lowercase() != self.marker_name)
            .collect();

        Some(ParsedTask {
            file_path: file_path.to_string(),
            line_index,
            raw_line: line.to_string(),
            content: self.clean_content(&without_id),
            completed,
            remote_id,
            due_date,
            priority,
            labels,
            description: String::new(),
            source_modified_at: modified_at,
        })
    }

    /// Writes `task` back as a line: checkbox, content, marker, labels,
    /// priority glyph, due date, identifier comment.
    pub fn serialize_line(&self, task: &ParsedTask) -> String {
        let (indent, bullet) = TASK_LINE_RE
            .captures(&task.raw_line)
            .map(|c| (c[1].to_string(), c[2].to_string()))
            .unwrap_or_else(|| (String::new(), "-".to_string()));
        let checkbox = if task.completed { "[x]" } else { "[ ]" };

        let mut parts: Vec<String> = Vec::new();
        let content = task.content.trim();
        if !content.is_empty() {
            parts.push(content.to_string());
        }
        parts.push(self.marker.clone());
        // Hashtags already inside the content are not repeated.
        let inline: HashSet<String> = HASHTAG_RE
            .captures_iter(content)
            .map(|c| c[2].to_lowercase())
            .collect();
        parts.extend(
            task.labels
                .iter()
                .filter(|label| !inline.contains(&label.to_lowercase()))
                .map(|label| format!("#{label}")),
        );
        if let Some(glyph) = task.priority.glyph() {
            parts.push(glyph.to_string());
        }
        if let Some(due) = task.due_date {
            parts.push(format!("📅 {}", due.format("%Y-%m-%d")));
        }
        if let Some(id) = task.remote_id.as_deref() {
            parts.push(id_comment(id));
        }

        format!("{indent}{bullet} {checkbox} {}", parts.join(" "))
    }

    /// Strips the marker, hashtags, identifier comment and date/priority
    /// tokens from `text`, collapsing whitespace.
    pub fn clean_content(&self, text: &str) -> String {
        let text = ID_COMMENT_RE.replace_all(text, " ");
        let text = HASHTAG_RE.replace_all(&text, "$1");
        let text = self.marker_re.replace_all(&text, " ");
        let text = strip_valid_dates(&DUE_EMOJI_RE, &text);
        let text = strip_valid_dates(&SCHEDULED_EMOJI_RE, &text);
        let mut text = strip_valid_dates(&DUE_TEXT_RE, &text);
        for priority in Priority::LADDER {
            if let Some(glyph) = priority.glyph() {
                text = text.replace(glyph, " ");
            }
        }
        normalize_whitespace(&text)
    }

    /// Appends the marker to a line that lacks it.
    pub fn ensure_marker(&self, line: &str) -> String {
        if self.has_marker(line) {
            return line.to_string();
        }
        format!("{} {}", line.trim_end(), self.marker)
    }
}

pub fn is_task_line(line: &str) -> bool {
    TASK_LINE_RE.is_match(line)
}

pub fn remote_id(line: &str) -> Option<String> {
    ID_COMMENT_RE.captures(line).map(|c| c[1].to_string())
}

/// Replaces any identifier comment on `line` with one for `id`.
pub fn attach_remote_id(line: &str, id: &str) -> String {
    let without = ID_COMMENT_RE.replace_all(line, "");
    let trimmed = without.trim_end();
    format!("{trimmed} {}", id_comment(id))
}

/// Sets the checkbox glyph, leaving the rest of the line untouched.
pub fn set_completed(line: &str, completed: bool) -> String {
    CHECKBOX_RE
        .replace(line, |caps: &Captures| {
            let current_done = caps[2].eq_ignore_ascii_case("x");
            let glyph = match (completed, current_done) {
                (true, true) | (false, false) => caps[2].to_string(),
                (true, false) => "x".to_string(),
                (false, true) => " ".to_string(),
            };
            format!("{}{}{}", &caps[1], glyph, &caps[3])
        })
        .into_owned()
}

/// Digest over the fields the engine compares: content, completion, due
/// date, priority and labels. Location fields do not take part.
pub fn fingerprint(task: &ParsedTask) -> String {
    let due = task
        .due_date
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default();
    stable_hash(&format!(
        "{}|{}|{}|{}|{}",
        task.content,
        task.completed,
        due,
        task.priority.as_str(),
        task.labels.join(",")
    ))
}

/// Splits a leading list prefix (`- `, `* `, `+ `, `1. `, `1) `) off `text`.
/// A bare prefix that ends the text (`-`, `3.`) counts as a prefix with
/// nothing after it.
pub fn split_list_prefix(text: &str) -> (&str, &str) {
    for bullet in ["- ", "* ", "+ "] {
        if let Some(rest) = text.strip_prefix(bullet) {
            return (&text[..bullet.len()], rest);
        }
    }
    if matches!(text, "-" | "*" | "+") {
        return (text, "");
    }
    let bytes = text.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if i > 0 && i < bytes.len() && (bytes[i] == b'.' || bytes[i] == b')') {
        if i + 1 == bytes.len() {
            return (text, "");
        }
        if bytes[i + 1] == b' ' {
            return (&text[..i + 2], &text[i + 2..]);
        }
    }
    ("", text)
}

pub fn leading_whitespace(line: &str) -> &str {
    let end = line.len() - line.trim_start().len();
    &line[..end]
}

fn id_comment(id: &str) -> String {
    format!("<!-- {ID_COMMENT_PREFIX}{id} -->")
}

fn first_date(re: &Regex, text: &str) -> Option<NaiveDate> {
    re.captures_iter(text).find_map(|c| parse_date(&c[1]))
}

fn strip_valid_dates(re: &Regex, text: &str) -> String {
    re.replace_all(text, |caps: &Captures| {
        if parse_date(&caps[1]).is_some() {
            " ".to_string()
        } else {
            caps[0].to_string()
        }
    })
    .into_owned()
}

pub(crate) fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()
}

fn normalize_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_space = false;
    for c in text.chars() {
        if c.is_whitespace() {
            if !last_space {
                out.push(' ');
                last_space = true;
            }
        } else {
            out.push(c);
            last_space = false;
        }
    }
    out.trim().to_string()
}

fn stable_hash(input: &str) -> String {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in input.as_bytes() {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{:x}", hash)
}
