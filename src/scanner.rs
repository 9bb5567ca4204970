use crate::models::ParsedTask;
use crate::storage::NoteStore;
use crate::task_line::{self, TaskCodec};
use chrono::Utc;
use log::warn;

/// Collects every tagged task in the store, one document at a time.
///
/// A document that cannot be read is logged and skipped.
pub fn scan_all<S>(store: &S, codec: &TaskCodec) -> Vec<ParsedTask>
where
    S: NoteStore + ?Sized,
{
    let documents = match store.list_documents() {
        Ok(documents) => documents,
        Err(err) => {
            warn!("event=scan_list module=scanner status=error error={err}");
            return Vec::new();
        }
    };

    let mut tasks = Vec::new();
    for path in documents {
        let content = match store.read(&path) {
            Ok(content) => content,
            Err(err) => {
                warn!("event=scan_read module=scanner status=error path={path} error={err}");
                continue;
            }
        };
        let modified_at = store.modified_at(&path).unwrap_or_else(|_| Utc::now());
        tasks.extend(scan_document(&content, &path, codec, modified_at));
    }
    tasks
}

pub fn scan_document(
    content: &str,
    path: &str,
    codec: &TaskCodec,
    modified_at: chrono::DateTime<Utc>,
) -> Vec<ParsedTask> {
    let lines: Vec<&str> = content.lines().collect();
    let mut tasks = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        if let Some(mut task) = codec.parse_line(line, i, path, modified_at) {
            task.description = collect_description(&lines, i);
            tasks.push(task);
        }
    }
    tasks
}

/// Gathers the lines under a task that are indented deeper than it and are
/// not tasks themselves. Blank lines are skipped while the block continues.
fn collect_description(lines: &[&str], task_index: usize) -> String {
    let task_indent = indent_width(lines[task_index]);
    let mut description = Vec::new();

    for line in &lines[task_index + 1..] {
        if line.trim().is_empty() {
            continue;
        }
        if indent_width(line) <= task_indent || task_line::is_task_line(line) {
            break;
        }
        description.push(line.trim());
    }
    description.join("\n")
}

fn indent_width(line: &str) -> usize {
    let mut width = 0;
    for c in line.chars() {
        match c {
            ' ' => width += 1,
            '\t' => width += 4,
            _ => break,
        }
    }
    width
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::VaultStore;

    fn codec() -> TaskCodec {
        TaskCodec::new("#todoist").expect("codec")
    }

    #[test]
    fn attaches_indented_description() {
        let content = "- [ ] Plan trip #todoist\n    book flights\n\n    pack bags\nnext paragraph\n    not mine\n";
        let tasks = scan_document(content, "a.md", &codec(), Utc::now());
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].description, "book flights\npack bags");
    }

    #[test]
    fn description_stops_at_nested_task() {
        let content = "- [ ] Parent #todoist\n  - [ ] Child #todoist\n    child note\n- [ ] Untagged\n";
        let tasks = scan_document(content, "a.md", &codec(), Utc::now());
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].description, "");
        assert_eq!(tasks[1].content, "Child");
        assert_eq!(tasks[1].line_index, 1);
        assert_eq!(tasks[1].description, "child note");
    }

    #[test]
    fn unreadable_document_is_skipped() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = VaultStore::new(dir.path());
        store.write("good.md", "- [ ] Ok #todoist\n").expect("write");
        std::fs::write(dir.path().join("bad.md"), [0xff, 0xfe, 0x00, 0x80]).expect("write bad");

        let tasks = scan_all(&store, &codec());
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].file_path, "good.md");
    }
}
