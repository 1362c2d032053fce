//! Durable gallery record (`gallery.json`)
//!
//! A JSON object mapping each label to its reference image path, relative
//! to the gallery directory, in enrollment order:
//!
//! ```json
//! {"alice": "faces/alice.png", "bob": "faces/bob.png"}
//! ```
//!
//! The whole record is rewritten on every mutation. Shape is validated on
//! load: duplicate keys (ignoring case), invalid labels, non-string paths,
//! and paths that would resolve outside the gallery directory are rejected.

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::validation::{validate_label, validate_relative_path};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordEntry {
    pub label: String,
    /// Reference image, relative to the gallery directory
    pub image: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GalleryRecord {
    entries: Vec<RecordEntry>,
}

impl GalleryRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[RecordEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, label: &str) -> bool {
        self.entries.iter().any(|e| e.label == label)
    }

    /// Entry whose label equals `label` ignoring ASCII case
    ///
    /// Labels name files under `faces/`, which collide on case-insensitive
    /// filesystems.
    pub fn conflicting(&self, label: &str) -> Option<&RecordEntry> {
        self.entries
            .iter()
            .find(|e| e.label.eq_ignore_ascii_case(label))
    }

    /// Append an entry; returns false if the label (ignoring case) is already present
    pub fn insert(&mut self, label: &str, image: PathBuf) -> bool {
        if self.conflicting(label).is_some() {
            return false;
        }
        self.entries.push(RecordEntry {
            label: label.to_string(),
            image,
        });
        true
    }

    pub fn remove(&mut self, label: &str) -> Option<RecordEntry> {
        let index = self.entries.iter().position(|e| e.label == label)?;
        Some(self.entries.remove(index))
    }

    /// Read the record; `Ok(None)` if the file does not exist
    pub fn load(path: &Path) -> Result<Option<Self>, RecordError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(RecordError::Io(e)),
        };
        let record = serde_json::from_str(&content)?;
        Ok(Some(record))
    }

    /// Atomically replace the record on disk
    pub fn save(&self, path: &Path) -> Result<(), RecordError> {
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum RecordError {
    #[error("Failed to access gallery record: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed gallery record: {0}")]
    Format(#[from] serde_json::Error),
}

impl Serialize for GalleryRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for entry in &self.entries {
            map.serialize_entry(&entry.label, &entry.image.to_string_lossy())?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for GalleryRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RecordVisitor;

        impl<'de> Visitor<'de> for RecordVisitor {
            type Value = GalleryRecord;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of label to reference image path")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut record = GalleryRecord::new();
                while let Some((label, image)) = access.next_entry::<String, String>()? {
                    validate_label(&label)
                        .map_err(|e| de::Error::custom(format!("label '{}': {}", label, e)))?;
                    let image = validate_relative_path(&image).map_err(|e| {
                        de::Error::custom(format!("image path for '{}': {}", label, e))
                    })?;
                    if !record.insert(&label, image) {
                        return Err(de::Error::custom(format!("duplicate label '{}'", label)));
                    }
                }
                Ok(record)
            }
        }

        deserializer.deserialize_map(RecordVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_as_label_map_in_order() {
        let mut record = GalleryRecord::new();
        assert!(record.insert("zoe", PathBuf::from("faces/zoe.png")));
        assert!(record.insert("alice", PathBuf::from("faces/alice.png")));
        assert!(!record.insert("zoe", PathBuf::from("faces/other.png")));

        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(
            json,
            r#"{"zoe":"faces/zoe.png","alice":"faces/alice.png"}"#
        );

        let parsed: GalleryRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_rejects_malformed_shapes() {
        assert!(serde_json::from_str::<GalleryRecord>(r#"["alice"]"#).is_err());
        assert!(serde_json::from_str::<GalleryRecord>(r#"{"alice": 3}"#).is_err());
        assert!(serde_json::from_str::<GalleryRecord>(r#"{"alice": ""}"#).is_err());
        assert!(serde_json::from_str::<GalleryRecord>(r#"{"../etc": "x.png"}"#).is_err());
        assert!(
            serde_json::from_str::<GalleryRecord>(r#"{"a": "a.png", "a": "b.png"}"#).is_err()
        );
        assert!(
            serde_json::from_str::<GalleryRecord>(r#"{"a": "a.png", "A": "b.png"}"#).is_err()
        );
    }

    #[test]
    fn test_rejects_paths_outside_gallery() {
        for image in ["/tmp/victim.txt", "../victim.txt", "faces/../../victim.txt"] {
            let json = serde_json::json!({ "alice": image }).to_string();
            assert!(
                serde_json::from_str::<GalleryRecord>(&json).is_err(),
                "accepted {}",
                image
            );
        }
    }

    #[test]
    fn test_insert_ignores_case() {
        let mut record = GalleryRecord::new();
        assert!(record.insert("alice", PathBuf::from("faces/alice.png")));
        assert!(!record.insert("Alice", PathBuf::from("faces/Alice.png")));
        assert_eq!(record.conflicting("ALICE").unwrap().label, "alice");
        assert!(!record.contains("Alice"));
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(GalleryRecord::load(&dir.path().join("gallery.json"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_save_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.json");

        let mut record = GalleryRecord::new();
        record.insert("alice", PathBuf::from("faces/alice.png"));
        record.insert("bob", PathBuf::from("faces/bob.png"));
        record.save(&path).unwrap();

        let mut loaded = GalleryRecord::load(&path).unwrap().unwrap();
        assert_eq!(loaded.len(), 2);
        let removed = loaded.remove("alice").unwrap();
        assert_eq!(removed.image, PathBuf::from("faces/alice.png"));
        assert!(loaded.remove("alice").is_none());
        assert_eq!(loaded.entries()[0].label, "bob");
        assert!(!dir.path().join("gallery.json.tmp").exists());
    }
}
