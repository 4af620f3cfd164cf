//! Hierarchical scan container.
//!
//! A container is a directory tree. Groups are directories with an `attrs.json`, arrays
//! are memory-mapped files (`<name>.arr`) with their attributes in a `<name>.attrs.json`
//! sidecar. Paths inside the container use `/` separators and start at the root group,
//! e.g. `/Raw_datas/Scan000/Det000/Data0D/CH000`.
//!
//! [`ScanStore`] offers the generic operations (groups, array allocation, random-access
//! writes); [`ScanSaver`] lays a scan out on top of them.

pub mod array;
pub mod group;
pub mod saver;

use chrono::Utc;
use serde_json::json;
use std::path::{Path, PathBuf};

use crate::error::{DaqError, DaqResult};

pub use array::PersistedArray;
pub use group::{Attributes, Group, LogEntry};
pub use saver::{ScanLayout, ScanSaver};

const ARRAY_EXT: &str = "arr";

/// Version of the on-disk layout, stored in the root attributes.
pub const FILE_VERSION: &str = "1.0";

/// Handle on a container directory.
#[derive(Debug, Clone)]
pub struct ScanStore {
    root: PathBuf,
}

impl ScanStore {
    /// Open the container at `root`, creating it (with its root attributes) if needed.
    pub fn create_or_open(root: &Path, application: &str) -> DaqResult<Self> {
        let is_new = !root.join(group::ATTRS_FILE).exists();
        std::fs::create_dir_all(root).map_err(|e| {
            DaqError::Persistence(format!("failed to create container {:?}: {}", root, e))
        })?;
        let store = Self {
            root: root.to_path_buf(),
        };
        if is_new {
            let host = hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_default();
            let mut attrs = Attributes::new();
            attrs.insert("creation_time".into(), json!(Utc::now().to_rfc3339()));
            attrs.insert("application".into(), json!(application));
            attrs.insert("hostname".into(), json!(host));
            attrs.insert("file_version".into(), json!(FILE_VERSION));
            store.root_group().set_attrs(attrs)?;
            tracing::info!(path = %root.display(), "Created scan container");
        } else {
            tracing::info!(path = %root.display(), "Reopened scan container");
        }
        Ok(store)
    }

    /// Directory of the container.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The root group `/`.
    pub fn root_group(&self) -> Group {
        Group::new("/".to_string(), self.root.clone())
    }

    fn segments(path: &str) -> DaqResult<Vec<&str>> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        for segment in &segments {
            if *segment == "." || *segment == ".." || segment.contains('\\') {
                return Err(DaqError::Persistence(format!(
                    "invalid container path '{}'",
                    path
                )));
            }
        }
        Ok(segments)
    }

    fn resolve(&self, path: &str) -> DaqResult<(String, PathBuf)> {
        let segments = Self::segments(path)?;
        let dir = segments
            .iter()
            .fold(self.root.clone(), |dir, segment| dir.join(segment));
        Ok((format!("/{}", segments.join("/")), dir))
    }

    /// Create-or-fetch the group at `path`, creating missing parents. Idempotent.
    pub fn ensure_group(&self, path: &str) -> DaqResult<Group> {
        let (path, dir) = self.resolve(path)?;
        std::fs::create_dir_all(&dir).map_err(|e| {
            DaqError::Persistence(format!("failed to create group '{}': {}", path, e))
        })?;
        let attrs = dir.join(group::ATTRS_FILE);
        if !attrs.exists() {
            group::write_attrs(&attrs, &Attributes::new())?;
        }
        Ok(Group::new(path, dir))
    }

    /// Existing group at `path`.
    pub fn group(&self, path: &str) -> DaqResult<Group> {
        let (path, dir) = self.resolve(path)?;
        if !dir.is_dir() {
            return Err(DaqError::Persistence(format!("no group at '{}'", path)));
        }
        Ok(Group::new(path, dir))
    }

    /// Allocate a zero-filled array `name` of `shape` inside `group`, tagged with `attrs`.
    pub fn allocate_channel_array(
        &self,
        group: &Group,
        name: &str,
        shape: &[usize],
        attrs: Attributes,
    ) -> DaqResult<PersistedArray> {
        Self::segments(name)?;
        let array = PersistedArray::create(&group.dir().join(format!("{}.{}", name, ARRAY_EXT)), shape)?;
        group::write_attrs(&group.dir().join(format!("{}.attrs.json", name)), &attrs)?;
        tracing::debug!(
            array = %group.child_path(name),
            shape = ?shape,
            "Allocated array"
        );
        Ok(array)
    }

    /// Random-access write of `values` at `index`; the last write to an index wins.
    pub fn write_at(array: &mut PersistedArray, index: &[usize], values: &[f64]) -> DaqResult<()> {
        array.write_at(index, values)
    }

    fn split_array_path(&self, path: &str) -> DaqResult<(PathBuf, String)> {
        let segments = Self::segments(path)?;
        let (name, parents) = segments
            .split_last()
            .ok_or_else(|| DaqError::Persistence(format!("invalid array path '{}'", path)))?;
        let dir = parents
            .iter()
            .fold(self.root.clone(), |dir, segment| dir.join(segment));
        Ok((dir, name.to_string()))
    }

    /// Map the existing array at `path`.
    pub fn open_array(&self, path: &str) -> DaqResult<PersistedArray> {
        let (dir, name) = self.split_array_path(path)?;
        PersistedArray::open(&dir.join(format!("{}.{}", name, ARRAY_EXT)))
    }

    /// Attributes of the array at `path`.
    pub fn array_attrs(&self, path: &str) -> DaqResult<Attributes> {
        let (dir, name) = self.split_array_path(path)?;
        group::read_attrs(&dir.join(format!("{}.attrs.json", name)))
    }

    /// True when an array exists at `path`.
    pub fn has_array(&self, path: &str) -> bool {
        self.split_array_path(path)
            .map(|(dir, name)| dir.join(format!("{}.{}", name, ARRAY_EXT)).is_file())
            .unwrap_or(false)
    }

    /// Name of the next `Scan{NNN}` group under `raw`.
    pub fn next_scan_name(&self, raw: &Group) -> DaqResult<String> {
        let next = raw
            .child_groups()?
            .iter()
            .filter_map(|name| name.strip_prefix("Scan")?.parse::<usize>().ok())
            .max()
            .map_or(0, |last| last + 1);
        Ok(format!("Scan{:03}", next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_root_attributes_written_once() {
        let dir = tempdir().unwrap();
        let store = ScanStore::create_or_open(dir.path(), "rust_daq_scan").unwrap();
        let created = store.root_group().attr("creation_time").unwrap();
        assert!(created.is_some());
        assert_eq!(
            store.root_group().attr("application").unwrap(),
            Some(json!("rust_daq_scan"))
        );

        let reopened = ScanStore::create_or_open(dir.path(), "other").unwrap();
        assert_eq!(reopened.root_group().attr("creation_time").unwrap(), created);
        assert_eq!(
            reopened.root_group().attr("application").unwrap(),
            Some(json!("rust_daq_scan"))
        );
    }

    #[test]
    fn test_ensure_group_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = ScanStore::create_or_open(dir.path(), "test").unwrap();
        let group = store.ensure_group("/Raw_datas/Scan000").unwrap();
        group.set_attr("scan_type", "Scan1D").unwrap();
        let again = store.ensure_group("Raw_datas/Scan000/").unwrap();
        assert_eq!(again.path(), "/Raw_datas/Scan000");
        assert_eq!(again.attr("scan_type").unwrap(), Some(json!("Scan1D")));
        assert!(store.ensure_group("/Raw_datas/../escape").is_err());
    }

    #[test]
    fn test_allocate_and_reopen_array() {
        let dir = tempdir().unwrap();
        let store = ScanStore::create_or_open(dir.path(), "test").unwrap();
        let group = store.ensure_group("/Raw_datas").unwrap();
        let mut attrs = Attributes::new();
        attrs.insert("data_type".into(), json!("Data0D"));
        let mut array = store
            .allocate_channel_array(&group, "CH000", &[4], attrs)
            .unwrap();
        ScanStore::write_at(&mut array, &[2], &[1.25]).unwrap();
        array.flush().unwrap();

        assert!(store.has_array("/Raw_datas/CH000"));
        let reopened = store.open_array("/Raw_datas/CH000").unwrap();
        assert_eq!(reopened.to_vec().unwrap(), vec![0.0, 0.0, 1.25, 0.0]);
        assert_eq!(
            store.array_attrs("/Raw_datas/CH000").unwrap()["data_type"],
            "Data0D"
        );
    }

    #[test]
    fn test_next_scan_name() {
        let dir = tempdir().unwrap();
        let store = ScanStore::create_or_open(dir.path(), "test").unwrap();
        let raw = store.ensure_group("/Raw_datas").unwrap();
        assert_eq!(store.next_scan_name(&raw).unwrap(), "Scan000");
        store.ensure_group("/Raw_datas/Scan000").unwrap();
        store.ensure_group("/Raw_datas/Scan001").unwrap();
        assert_eq!(store.next_scan_name(&raw).unwrap(), "Scan002");
    }
}
