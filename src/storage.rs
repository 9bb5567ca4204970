use chrono::{DateTime, Utc};
use std::fs;
use std::io;
use std::path::PathBuf;
use walkdir::WalkDir;

/// Line-addressable text documents the sync engine reads and rewrites.
///
/// Paths are store-relative and use `/` separators.
pub trait NoteStore {
    fn list_documents(&self) -> io::Result<Vec<String>>;
    fn read(&self, path: &str) -> io::Result<String>;
    fn write(&self, path: &str, content: &str) -> io::Result<()>;
    fn modified_at(&self, path: &str) -> io::Result<DateTime<Utc>>;
}

/// A directory of markdown notes on disk.
#[derive(Clone, Debug)]
pub struct VaultStore {
    root: PathBuf,
}

impl VaultStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

impl NoteStore for VaultStore {
    fn list_documents(&self) -> io::Result<Vec<String>> {
        if !self.root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("vault directory {} does not exist", self.root.display()),
            ));
        }

        let mut documents = Vec::new();
        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.file_name()));
        for entry in walker.filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("md") {
                continue;
            }
            if let Ok(relative) = path.strip_prefix(&self.root) {
                let parts: Vec<String> = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect();
                documents.push(parts.join("/"));
            }
        }
        Ok(documents)
    }

    fn read(&self, path: &str) -> io::Result<String> {
        fs::read_to_string(self.resolve(path))
    }

    fn write(&self, path: &str, content: &str) -> io::Result<()> {
        let path = self.resolve(path);
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)
    }

    fn modified_at(&self, path: &str) -> io::Result<DateTime<Utc>> {
        let modified = fs::metadata(self.resolve(path))?.modified()?;
        Ok(DateTime::<Utc>::from(modified))
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|s| s.starts_with('.'))
}

/// Rewrites one line of a document in place.
///
/// Re-reads the whole document, splices the new line in and writes it back,
/// so a write lands on whatever the file holds right now. Returns
/// `Ok(false)` when `line_index` is past the end of the document.
pub fn update_line<S, F>(store: &S, path: &str, line_index: usize, edit: F) -> io::Result<bool>
where
    S: NoteStore + ?Sized,
    F: FnOnce(&str) -> String,
{
    let content = store.read(path)?;
    let mut lines: Vec<String> = content.lines().map(|s| s.to_string()).collect();

    if line_index >= lines.len() {
        return Ok(false);
    }

    let updated = edit(&lines[line_index]);
    if updated == lines[line_index] {
        return Ok(true);
    }
    lines[line_index] = updated;

    let newline = if content.contains("\r\n") { "\r\n" } else { "\n" };
    let mut new_content = lines.join(newline);
    if content.ends_with('\n') {
        new_content.push_str(newline);
    }
    store.write(path, &new_content)?;
    Ok(true)
}

pub fn read_line<S>(store: &S, path: &str, line_index: usize) -> io::Result<Option<String>>
where
    S: NoteStore + ?Sized,
{
    let content = store.read(path)?;
    Ok(content.lines().nth(line_index).map(|s| s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn vault() -> (TempDir, VaultStore) {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = VaultStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn lists_markdown_files_and_skips_hidden_dirs() {
        let (_dir, store) = vault();
        store.write("b.md", "b").expect("write b");
        store.write("projects/a.md", "a").expect("write a");
        store.write("projects/readme.txt", "x").expect("write txt");
        store.write(".obsidian/workspace.md", "x").expect("write hidden");

        let docs = store.list_documents().expect("list");
        assert_eq!(docs, vec!["b.md".to_string(), "projects/a.md".to_string()]);
    }

    #[test]
    fn missing_vault_is_an_error() {
        let (dir, _) = vault();
        let store = VaultStore::new(dir.path().join("nope"));
        assert!(store.list_documents().is_err());
    }

    #[test]
    fn update_line_splices_and_keeps_trailing_newline() {
        let (_dir, store) = vault();
        store.write("n.md", "one\ntwo\nthree\n").expect("write");

        let changed = update_line(&store, "n.md", 1, |line| format!("{line}!")).expect("update");
        assert!(changed);
        assert_eq!(store.read("n.md").expect("read"), "one\ntwo!\nthree\n");

        store.write("m.md", "one\ntwo").expect("write");
        update_line(&store, "m.md", 0, |_| "uno".to_string()).expect("update");
        assert_eq!(store.read("m.md").expect("read"), "uno\ntwo");
    }

    #[test]
    fn update_line_keeps_crlf_line_endings() {
        let (_dir, store) = vault();
        store.write("w.md", "# Todo\r\n- [ ] a\r\n- [ ] b\r\n").expect("write");

        update_line(&store, "w.md", 1, |_| "- [x] a".to_string()).expect("update");
        assert_eq!(
            store.read("w.md").expect("read"),
            "# Todo\r\n- [x] a\r\n- [ ] b\r\n"
        );
    }

    #[test]
    fn update_line_out_of_range_returns_false() {
        let (_dir, store) = vault();
        store.write("n.md", "only\n").expect("write");
        let changed = update_line(&store, "n.md", 5, |_| "x".to_string()).expect("update");
        assert!(!changed);
        assert_eq!(store.read("n.md").expect("read"), "only\n");
        assert_eq!(read_line(&store, "n.md", 0).expect("read"), Some("only".to_string()));
    }
}
