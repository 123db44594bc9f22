use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Sorted listing of one directory with a "now" entry in use and a "next"
/// entry being browsed. Used for saved songs and drum kits.
#[derive(Debug, Clone)]
pub struct AssetFinder {
    dir: PathBuf,
    want_dirs: bool,
    suffix: String,
    items: Vec<String>,
    pub now: usize,
    pub next: usize,
}

impl AssetFinder {
    /// Lists the entries of `dir` (not recursive) that end with `suffix`.
    /// `want_dirs` picks directories instead of files.
    pub fn scan(dir: &Path, want_dirs: bool, suffix: &str) -> Result<Self> {
        let mut finder = Self {
            dir: dir.to_path_buf(),
            want_dirs,
            suffix: suffix.to_string(),
            items: Vec::new(),
            now: 0,
            next: 0,
        };
        finder.rescan()?;
        Ok(finder)
    }

    pub fn rescan(&mut self) -> Result<()> {
        let mut items = Vec::new();
        self.now = 0;
        self.next = 0;
        if !self.dir.is_dir() {
            log::warn!("{} is not a directory", self.dir.display());
            self.items = items;
            return Ok(());
        }
        for entry in WalkDir::new(&self.dir).min_depth(1).max_depth(1) {
            let entry = entry.with_context(|| format!("listing {}", self.dir.display()))?;
            if entry.file_type().is_dir() != self.want_dirs {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(&self.suffix) && !name.starts_with('.') {
                items.push(name);
            }
        }
        items.sort();
        self.items = items;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn items(&self) -> &[String] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Moves `next` one entry forward or back, wrapping around.
    pub fn iterate(&mut self, go_fwd: bool) {
        let len = self.items.len();
        if len == 0 {
            return;
        }
        self.next = if go_fwd {
            (self.next + 1) % len
        } else {
            (self.next + len - 1) % len
        };
    }

    pub fn item_now(&self) -> Option<&str> {
        self.items.get(self.now).map(String::as_str)
    }

    pub fn item_next(&self) -> Option<&str> {
        self.items.get(self.next).map(String::as_str)
    }

    pub fn path_now(&self) -> Option<PathBuf> {
        self.item_now().map(|name| self.dir.join(name))
    }

    /// Selects `name` as both now and next.
    pub fn select(&mut self, name: &str) -> bool {
        match self.items.iter().position(|item| item == name) {
            Some(pos) => {
                self.now = pos;
                self.next = pos;
                true
            }
            None => false,
        }
    }

    /// Adds a new entry at the end and selects it.
    pub fn push(&mut self, name: String) {
        self.items.push(name);
        self.now = self.items.len() - 1;
        self.next = self.now;
    }

    /// Removes the "now" entry and selects the first one.
    pub fn remove_now(&mut self) -> Option<String> {
        if self.now >= self.items.len() {
            return None;
        }
        let removed = self.items.remove(self.now);
        self.now = 0;
        self.next = 0;
        Some(removed)
    }
}
