//! Local file operations behind the control channel.
//!
//! Paths arrive from the remote console as strings. They are joined with
//! forward slashes, then resolved against an optional root directory.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const ENTRY_DIRECTORY: u8 = 2;
pub const ENTRY_FILE: u8 = 3;

/// Joins wire path segments. Trailing separators are stripped from every
/// segment and leading separators from every segment after the first.
pub fn join_path(parts: &[&str]) -> String {
    let mut out: Vec<&str> = Vec::with_capacity(parts.len());
    for (i, part) in parts.iter().enumerate() {
        let mut w = part.trim_end_matches(['/', '\\']);
        if i != 0 {
            w = w.trim_start_matches(['/', '\\']);
        }
        out.push(w);
    }
    if out.is_empty() {
        return "/".to_string();
    }
    out.join("/")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    pub n: String,
    pub t: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectoryListing {
    pub path: String,
    pub dir: Vec<DirEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reqid: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct LocalFiles {
    root: Option<PathBuf>,
}

impl LocalFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Confines every wire path under `root`.
    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    pub fn resolve(&self, wire: &str) -> PathBuf {
        match &self.root {
            Some(root) => {
                let mut out = root.clone();
                for segment in wire.split(['/', '\\']) {
                    match segment {
                        "" | "." => {}
                        ".." => {
                            if out != *root {
                                out.pop();
                            }
                        }
                        other => out.push(other),
                    }
                }
                out
            }
            None => PathBuf::from(wire),
        }
    }

    /// Unreadable directories list as empty.
    pub fn list(&self, wire: &str) -> DirectoryListing {
        let mut dir = Vec::new();
        if let Ok(entries) = fs::read_dir(self.resolve(wire)) {
            for entry in entries.flatten() {
                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                let name = entry.file_name().to_string_lossy().into_owned();
                let modified = meta
                    .modified()
                    .ok()
                    .map(|t| DateTime::<Utc>::from(t).to_rfc3339());
                if meta.is_dir() {
                    dir.push(DirEntry {
                        n: name,
                        t: ENTRY_DIRECTORY,
                        s: None,
                        d: modified,
                    });
                } else {
                    dir.push(DirEntry {
                        n: name,
                        t: ENTRY_FILE,
                        s: Some(meta.len()),
                        d: modified,
                    });
                }
            }
        }
        dir.sort_by(|a, b| a.t.cmp(&b.t).then_with(|| a.n.cmp(&b.n)));
        DirectoryListing {
            path: wire.to_string(),
            dir,
            reqid: None,
        }
    }

    pub fn make_dir(&self, wire: &str) {
        if let Err(e) = fs::create_dir(self.resolve(wire)) {
            debug!(path = wire, error = %e, "mkdir failed");
        }
    }

    pub fn remove(&self, base: &str, names: &[String]) {
        for name in names {
            let full = join_path(&[base, name]);
            if let Err(e) = remove_entry(&self.resolve(&full)) {
                warn!(path = %full, error = %e, "delete failed");
            }
        }
    }

    pub fn rename(&self, base: &str, old_name: &str, new_name: &str) {
        let from = self.resolve(&join_path(&[base, old_name]));
        let to = self.resolve(&join_path(&[base, new_name]));
        if let Err(e) = fs::rename(&from, &to) {
            warn!(from = %from.display(), to = %to.display(), error = %e, "rename failed");
        }
    }

    /// Copies each named entry from `source` to `dest`, removing the source
    /// afterwards when `remove_source` is set. Same-path pairs are skipped.
    pub fn transfer(&self, source: &str, dest: &str, names: &[String], remove_source: bool) {
        for name in names {
            let sc = join_path(&[source, name]);
            let ds = join_path(&[dest, name]);
            if sc == ds {
                continue;
            }
            let from = self.resolve(&sc);
            let result = fs::copy(&from, self.resolve(&ds)).and_then(|_| {
                if remove_source {
                    fs::remove_file(&from)
                } else {
                    Ok(())
                }
            });
            if let Err(e) = result {
                warn!(from = %sc, to = %ds, error = %e, "copy failed");
            }
        }
    }
}

fn remove_entry(path: &Path) -> std::io::Result<()> {
    if fs::symlink_metadata(path)?.is_dir() {
        fs::remove_dir(path)
    } else {
        fs::remove_file(path)
    }
}
