//! On-disk state.
//!
//! Two YAML documents live in the state directory:
//! - `places.yaml`: place configuration, read back at start-up
//! - `resources.yaml`: the resources published at the last save, for
//!   diagnostics only
//!
//! Ownership (`acquired`, `acquired_resources`, `allowed`) and reservations
//! are runtime state and are never written. Every save writes a temp file
//! and renames it over the previous document.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::model::{ModelError, ParamValue, Place, ResourceMatch};
use crate::session::ExporterSession;

pub const PLACES_FILE: &str = "places.yaml";
pub const RESOURCES_FILE: &str = "resources.yaml";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to (de)serialize {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("place '{place}' has an invalid match: {source}")]
    InvalidMatch {
        place: String,
        #[source]
        source: ModelError,
    },

    #[error("save task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct MatchDoc {
    exporter: String,
    group: String,
    cls: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rename: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PlaceDoc {
    #[serde(default)]
    aliases: BTreeSet<String>,
    #[serde(default)]
    comment: String,
    #[serde(default)]
    tags: BTreeMap<String, String>,
    #[serde(default)]
    matches: Vec<MatchDoc>,
    created: DateTime<Utc>,
    changed: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ResourceDoc {
    cls: String,
    #[serde(default)]
    params: BTreeMap<String, ParamValue>,
    avail: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    acquired: Option<String>,
}

type ResourcesDoc = BTreeMap<String, BTreeMap<String, BTreeMap<String, ResourceDoc>>>;

/// A point-in-time copy of what gets written, taken under the coordinator
/// lock and serialized outside of it.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    places: BTreeMap<String, PlaceDoc>,
    resources: ResourcesDoc,
}

impl Snapshot {
    pub fn capture<'a>(
        places: impl IntoIterator<Item = &'a Place>,
        exporters: &[std::sync::Arc<ExporterSession>],
    ) -> Self {
        let places = places
            .into_iter()
            .map(|place| (place.name.clone(), place_doc(place)))
            .collect();

        let resources = exporters
            .iter()
            .map(|exporter| {
                let groups = exporter
                    .get_resources()
                    .into_iter()
                    .map(|(group, resources)| {
                        let resources = resources
                            .into_iter()
                            .map(|(name, handle)| {
                                let entry = handle.snapshot();
                                let doc = ResourceDoc {
                                    cls: entry.cls,
                                    params: entry.params,
                                    avail: entry.avail,
                                    acquired: entry.acquired,
                                };
                                (name, doc)
                            })
                            .collect();
                        (group, resources)
                    })
                    .collect();
                (exporter.name.clone(), groups)
            })
            .collect();

        Self { places, resources }
    }
}

fn place_doc(place: &Place) -> PlaceDoc {
    PlaceDoc {
        aliases: place.aliases.clone(),
        comment: place.comment.clone(),
        tags: place.tags.clone(),
        matches: place
            .matches
            .iter()
            .map(|m| {
                let wire = m.to_proto();
                MatchDoc {
                    exporter: wire.exporter,
                    group: wire.group,
                    cls: wire.cls,
                    name: wire.name,
                    rename: wire.rename,
                }
            })
            .collect(),
        created: place.created,
        changed: place.changed,
    }
}

fn place_from_doc(name: String, doc: PlaceDoc) -> Result<Place, PersistenceError> {
    let mut place = Place::new(name);
    place.aliases = doc.aliases;
    place.comment = doc.comment;
    place.tags = doc.tags;
    place.created = doc.created;
    place.changed = doc.changed;
    for m in doc.matches {
        let mut pattern = format!("{}/{}/{}", m.exporter, m.group, m.cls);
        if let Some(name) = m.name {
            pattern.push('/');
            pattern.push_str(&name);
        }
        let parsed =
            ResourceMatch::parse(&pattern, m.rename).map_err(|source| {
                PersistenceError::InvalidMatch {
                    place: place.name.clone(),
                    source,
                }
            })?;
        place.matches.push(parsed);
    }
    Ok(place)
}

/// Reads and writes the state directory.
#[derive(Debug, Clone)]
pub struct StatePersistence {
    dir: PathBuf,
}

impl StatePersistence {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Load places. A missing file means a fresh start.
    pub fn load_places(&self) -> Result<BTreeMap<String, Place>, PersistenceError> {
        let path = self.dir.join(PLACES_FILE);
        if !path.exists() {
            debug!(path = %path.display(), "No places file, starting fresh");
            return Ok(BTreeMap::new());
        }

        let content = fs::read_to_string(&path).map_err(|source| PersistenceError::Io {
            path: path.clone(),
            source,
        })?;
        let docs: Option<BTreeMap<String, PlaceDoc>> = serde_yaml::from_str(&content)
            .map_err(|source| PersistenceError::Yaml {
                path: path.clone(),
                source,
            })?;

        let places = docs
            .unwrap_or_default()
            .into_iter()
            .map(|(name, doc)| Ok((name.clone(), place_from_doc(name, doc)?)))
            .collect::<Result<BTreeMap<_, _>, PersistenceError>>()?;

        info!(path = %path.display(), place_count = places.len(), "Loaded places from disk");
        Ok(places)
    }

    /// Write both documents.
    pub fn save(&self, snapshot: &Snapshot) -> Result<(), PersistenceError> {
        fs::create_dir_all(&self.dir).map_err(|source| PersistenceError::Io {
            path: self.dir.clone(),
            source,
        })?;
        write_atomic(&self.dir.join(PLACES_FILE), &snapshot.places)?;
        write_atomic(&self.dir.join(RESOURCES_FILE), &snapshot.resources)?;
        debug!(
            dir = %self.dir.display(),
            place_count = snapshot.places.len(),
            "Saved state to disk"
        );
        Ok(())
    }

    /// [`save`](Self::save) on the blocking pool.
    pub async fn save_in_background(&self, snapshot: Snapshot) -> Result<(), PersistenceError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.save(&snapshot)).await?
    }
}

fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistenceError> {
    let content = serde_yaml::to_string(value).map_err(|source| PersistenceError::Yaml {
        path: path.to_path_buf(),
        source,
    })?;

    let tmp_path = path.with_extension("yaml.tmp");
    fs::write(&tmp_path, content).map_err(|source| PersistenceError::Io {
        path: tmp_path.clone(),
        source,
    })?;
    fs::rename(&tmp_path, path).map_err(|source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn configured_place() -> Place {
        let mut place = Place::new("rpi-3");
        place.aliases.insert("pi".into());
        place.comment = "rack 2".into();
        place.tags.insert("board".into(), "rpi".into());
        place
            .matches
            .push(ResourceMatch::parse("lab/1/RawSerialPort/console", Some("serial".into())).unwrap());
        place.matches.push(ResourceMatch::parse("lab/1/*", None).unwrap());
        place.acquired = Some("host/alice".into());
        place.allowed.insert("host/bob".into());
        place
    }

    #[test]
    fn places_survive_a_restart_unacquired() {
        let dir = tempdir().unwrap();
        let persistence = StatePersistence::new(dir.path());
        let original = configured_place();

        persistence
            .save(&Snapshot::capture([&original], &[]))
            .unwrap();
        let loaded = persistence.load_places().unwrap();

        let place = &loaded["rpi-3"];
        assert_eq!(place.aliases, original.aliases);
        assert_eq!(place.comment, "rack 2");
        assert_eq!(place.tags, original.tags);
        assert_eq!(place.matches, original.matches);
        assert_eq!(place.matches[0].rename.as_deref(), Some("serial"));
        assert_eq!(place.created, original.created);
        assert_eq!(place.acquired, None);
        assert!(place.allowed.is_empty());
    }

    #[test]
    fn ownership_is_not_written() {
        let dir = tempdir().unwrap();
        let persistence = StatePersistence::new(dir.path());
        persistence
            .save(&Snapshot::capture([&configured_place()], &[]))
            .unwrap();

        let raw = fs::read_to_string(dir.path().join(PLACES_FILE)).unwrap();
        assert!(!raw.contains("alice"));
        assert!(!raw.contains("bob"));
        assert!(dir.path().join(RESOURCES_FILE).exists());
        assert!(!dir.path().join("places.yaml.tmp").exists());
    }

    #[test]
    fn missing_file_is_a_fresh_start() {
        let dir = tempdir().unwrap();
        let persistence = StatePersistence::new(dir.path().join("nested"));
        assert!(persistence.load_places().unwrap().is_empty());
    }

    #[test]
    fn empty_file_is_a_fresh_start() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(PLACES_FILE), "").unwrap();
        let persistence = StatePersistence::new(dir.path());
        assert!(persistence.load_places().unwrap().is_empty());
    }

    #[test]
    fn corrupt_match_is_reported() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(PLACES_FILE),
            "bad:\n  matches:\n  - {exporter: '', group: g, cls: c}\n  created: 2024-01-01T00:00:00Z\n  changed: 2024-01-01T00:00:00Z\n",
        )
        .unwrap();
        let persistence = StatePersistence::new(dir.path());
        assert!(matches!(
            persistence.load_places(),
            Err(PersistenceError::InvalidMatch { .. })
        ));
    }

    #[tokio::test]
    async fn save_on_blocking_pool() {
        let dir = tempdir().unwrap();
        let persistence = StatePersistence::new(dir.path());
        persistence
            .save_in_background(Snapshot::capture([&configured_place()], &[]))
            .await
            .unwrap();
        assert_eq!(persistence.load_places().unwrap().len(), 1);
    }
}
