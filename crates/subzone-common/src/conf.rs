// conf.rs — configuration document store
//
// Holds the contents of a *.conf file as sections of key/value strings with
// case-insensitive lookup. The full legacy conf grammar (includes, macros)
// is handled by an external preprocessor; this store accepts the plain
// [section] / key = value subset and is also the unit the capability
// manager writes group changes back into.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Default)]
struct Section {
    name: String,
    entries: Vec<(String, String)>,
    /// lower-case key -> index in entries
    index: HashMap<String, usize>,
}

impl Section {
    fn set(&mut self, key: &str, value: &str) {
        if let Some(&idx) = self.index.get(&key.to_lowercase()) {
            self.entries[idx].1 = value.to_string();
        } else {
            self.index
                .insert(key.to_lowercase(), self.entries.len());
            self.entries.push((key.to_string(), value.to_string()));
        }
    }
}

/// A parsed configuration document. Section and key lookup is
/// case-insensitive; stored casing is preserved for writes.
#[derive(Default)]
pub struct ConfDocument {
    path: Option<PathBuf>,
    sections: Vec<Section>,
    /// lower-case section name -> index in sections
    index: HashMap<String, usize>,
    dirty: bool,
}

impl ConfDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self, ConfError> {
        let text = fs::read_to_string(path).map_err(|source| ConfError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut doc = Self::parse(&text);
        doc.path = Some(path.to_path_buf());
        Ok(doc)
    }

    pub fn parse(text: &str) -> Self {
        let mut doc = Self::new();
        let mut current: Option<usize> = None;
        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty()
                || line.starts_with(';')
                || line.starts_with('#')
                || line.starts_with("//")
            {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                current = Some(doc.section_index_or_create(name.trim()));
                continue;
            }
            let sect = match current {
                Some(idx) => idx,
                None => doc.section_index_or_create(""),
            };
            let (key, value) = match line.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (line, ""),
            };
            if !key.is_empty() {
                doc.sections[sect].set(key, value);
            }
        }
        doc
    }

    fn section_index_or_create(&mut self, name: &str) -> usize {
        let lower = name.to_lowercase();
        if let Some(&idx) = self.index.get(&lower) {
            return idx;
        }
        let idx = self.sections.len();
        self.sections.push(Section {
            name: name.to_string(),
            ..Default::default()
        });
        self.index.insert(lower, idx);
        idx
    }

    fn find(&self, section: &str, key: &str) -> Option<&str> {
        let sect = &self.sections[*self.index.get(&section.to_lowercase())?];
        let &idx = sect.index.get(&key.to_lowercase())?;
        Some(sect.entries[idx].1.as_str())
    }

    // ------------------------------------------------------------
    // Typed getters. Getters never create entries; defaulting is
    // done at the call site.
    // ------------------------------------------------------------

    pub fn get_str<'a>(&'a self, section: &str, key: &str) -> Option<&'a str> {
        self.find(section, key)
    }

    pub fn get_int(&self, section: &str, key: &str, default: i32) -> i32 {
        match self.find(section, key) {
            Some(v) => v.trim().parse::<i32>().unwrap_or(default),
            None => default,
        }
    }

    pub fn get_bool(&self, section: &str, key: &str, default: bool) -> bool {
        match self.find(section, key) {
            Some(v) => matches!(v.trim(), "1" | "true" | "yes" | "y" | "on"),
            None => default,
        }
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.index.contains_key(&section.to_lowercase())
    }

    /// All (key, value) pairs of a section, in file order.
    pub fn section_entries<'a>(
        &'a self,
        section: &str,
    ) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        let entries = self
            .index
            .get(&section.to_lowercase())
            .map(|&idx| self.sections[idx].entries.as_slice())
            .unwrap_or(&[]);
        entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    // ------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------

    pub fn set_str(&mut self, section: &str, key: &str, value: &str) {
        let idx = self.section_index_or_create(section);
        self.sections[idx].set(key, value);
        self.dirty = true;
    }

    pub fn remove_key(&mut self, section: &str, key: &str) {
        let Some(&sidx) = self.index.get(&section.to_lowercase()) else {
            return;
        };
        let sect = &mut self.sections[sidx];
        if let Some(idx) = sect.index.remove(&key.to_lowercase()) {
            sect.entries.remove(idx);
            // reindex entries shifted down by the removal
            for v in sect.index.values_mut() {
                if *v > idx {
                    *v -= 1;
                }
            }
            self.dirty = true;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn save(&mut self) -> Result<(), ConfError> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        self.save_to(&path)
    }

    pub fn save_to(&mut self, path: &Path) -> Result<(), ConfError> {
        let mut out = String::new();
        for sect in &self.sections {
            if !sect.name.is_empty() {
                out.push_str(&format!("[{}]\n", sect.name));
            }
            for (k, v) in &sect.entries {
                out.push_str(&format!("{} = {}\n", k, v));
            }
            out.push('\n');
        }
        fs::write(path, out).map_err(|source| ConfError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.dirty = false;
        Ok(())
    }
}
