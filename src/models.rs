use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    None,
    Low,
    Medium,
    High,
}

impl Priority {
    /// Glyph ladder checked from the top; the first glyph found on a line wins.
    pub const LADDER: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub fn glyph(self) -> Option<&'static str> {
        match self {
            Priority::High => Some("⏫"),
            Priority::Medium => Some("🔼"),
            Priority::Low => Some("🔽"),
            Priority::None => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
            Priority::None => "none",
        }
    }

    /// Todoist counts priorities upwards: 4 is the most urgent, 1 is unset.
    pub fn to_todoist(self) -> u8 {
        match self {
            Priority::High => 4,
            Priority::Medium => 3,
            Priority::Low => 2,
            Priority::None => 1,
        }
    }

    pub fn from_todoist(value: u8) -> Self {
        match value {
            4 => Priority::High,
            3 => Priority::Medium,
            2 => Priority::Low,
            _ => Priority::None,
        }
    }
}

/// A tagged checklist line, rebuilt from document text on every scan.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedTask {
    pub file_path: String,
    pub line_index: usize,
    pub raw_line: String,
    pub content: String,
    pub completed: bool,
    pub remote_id: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub priority: Priority,
    pub labels: Vec<String>,
    pub description: String,
    pub source_modified_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RemoteTask {
    pub id: String,
    pub content: String,
    pub description: String,
    pub completed: bool,
    pub due_date: Option<NaiveDate>,
    pub priority: Priority,
    pub project_id: Option<String>,
    pub labels: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub is_inbox: bool,
}
