//! Container groups: directories carrying a JSON attribute file.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{DaqError, DaqResult};

/// Attribute map of a group or array.
pub type Attributes = serde_json::Map<String, Value>;

pub(crate) const ATTRS_FILE: &str = "attrs.json";
const LOG_FILE: &str = "logger.jsonl";

/// Read an attribute file, treating a missing file as empty.
pub(crate) fn read_attrs(path: &Path) -> DaqResult<Attributes> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Attributes::new()),
        Err(e) => Err(e.into()),
    }
}

/// Write an attribute file atomically (temp file + rename).
pub(crate) fn write_attrs(path: &Path, attrs: &Attributes) -> DaqResult<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(attrs)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// One entry of a scan log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// UTC timestamp, RFC 3339.
    pub timestamp: String,
    /// Severity (`info`, `warning`, `error`).
    pub level: String,
    /// Message.
    pub text: String,
}

/// A node of the hierarchical container.
#[derive(Debug, Clone)]
pub struct Group {
    path: String,
    dir: PathBuf,
}

impl Group {
    pub(crate) fn new(path: String, dir: PathBuf) -> Self {
        Self { path, dir }
    }

    /// Container path, e.g. `/Raw_datas/Scan000`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Directory backing the group.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Container path of a child node.
    pub fn child_path(&self, name: &str) -> String {
        if self.path == "/" {
            format!("/{}", name)
        } else {
            format!("{}/{}", self.path, name)
        }
    }

    /// All attributes.
    pub fn attrs(&self) -> DaqResult<Attributes> {
        read_attrs(&self.dir.join(ATTRS_FILE))
    }

    /// One attribute.
    pub fn attr(&self, key: &str) -> DaqResult<Option<Value>> {
        Ok(self.attrs()?.remove(key))
    }

    /// Set one attribute, keeping the others.
    pub fn set_attr(&self, key: &str, value: impl Serialize) -> DaqResult<()> {
        let mut attrs = self.attrs()?;
        attrs.insert(key.to_string(), serde_json::to_value(value)?);
        write_attrs(&self.dir.join(ATTRS_FILE), &attrs)
    }

    /// Merge several attributes at once.
    pub fn set_attrs(&self, values: Attributes) -> DaqResult<()> {
        let mut attrs = self.attrs()?;
        attrs.extend(values);
        write_attrs(&self.dir.join(ATTRS_FILE), &attrs)
    }

    /// Names of child groups, sorted.
    pub fn child_groups(&self) -> DaqResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Append a timestamped entry to the group's log.
    pub fn append_log(&self, level: &str, text: &str) -> DaqResult<()> {
        let entry = LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string(),
            text: text.to_string(),
        };
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(LOG_FILE))?;
        file.write_all(&line)?;
        Ok(())
    }

    /// Log entries, oldest first.
    pub fn log_entries(&self) -> DaqResult<Vec<LogEntry>> {
        let text = match std::fs::read_to_string(self.dir.join(LOG_FILE)) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(DaqError::from))
            .collect()
    }
}
