//! Resources imported from exporters.
//!
//! A [`ResourceImport`] is created the first time an exporter publishes a
//! resource and is shared through [`ResourceHandle`]s: the exporter session
//! keeps one in its namespace, an acquired place keeps one in its
//! `acquired_resources`. Updates merge into the existing import so every
//! handle observes them. Identity is the allocation, not the path: once an
//! exporter reconnects it publishes fresh imports for the same paths.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use labhub_proto::coordinator::v1 as pb;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Value of `acquired` reported for a resource whose state the exporter
/// could not determine.
pub const BROKEN_MARKER: &str = "<broken>";

pub type ResourceHandle = Arc<ResourceImport>;

/// exporter/group/cls/name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourcePath {
    pub exporter: String,
    pub group: String,
    pub cls: String,
    pub name: String,
}

impl ResourcePath {
    pub fn new(
        exporter: impl Into<String>,
        group: impl Into<String>,
        cls: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            exporter: exporter.into(),
            group: group.into(),
            cls: cls.into(),
            name: name.into(),
        }
    }

    pub fn to_proto(&self) -> pb::resource::Path {
        pb::resource::Path {
            exporter_name: Some(self.exporter.clone()),
            group_name: self.group.clone(),
            resource_name: self.name.clone(),
        }
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.exporter, self.group, self.cls, self.name)
    }
}

/// Opaque resource parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl ParamValue {
    pub fn from_proto(value: &pb::MapValue) -> Option<Self> {
        use pb::map_value::Kind;
        Some(match value.kind.as_ref()? {
            Kind::BoolValue(v) => Self::Bool(*v),
            Kind::IntValue(v) => Self::Int(*v),
            Kind::FloatValue(v) => Self::Float(*v),
            Kind::StringValue(v) => Self::String(v.clone()),
        })
    }

    pub fn to_proto(&self) -> pb::MapValue {
        use pb::map_value::Kind;
        let kind = match self {
            Self::Bool(v) => Kind::BoolValue(*v),
            Self::Int(v) => Kind::IntValue(*v),
            Self::Float(v) => Kind::FloatValue(*v),
            Self::String(v) => Kind::StringValue(v.clone()),
        };
        pb::MapValue { kind: Some(kind) }
    }
}

/// Mutable part of an imported resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceEntry {
    pub cls: String,
    pub params: BTreeMap<String, ParamValue>,
    pub avail: bool,
    /// Place holding the resource, as reported by the exporter.
    pub acquired: Option<String>,
    /// Deleted by its exporter while acquired. Cleared only when
    /// reconciliation swaps in a fresh import.
    pub orphaned: bool,
}

impl ResourceEntry {
    /// Build an entry from an exporter update. Unknown parameter kinds are dropped.
    pub fn from_proto(resource: &pb::Resource) -> Self {
        Self {
            cls: resource.cls.clone(),
            params: resource
                .params
                .iter()
                .filter_map(|(k, v)| Some((k.clone(), ParamValue::from_proto(v)?)))
                .collect(),
            avail: resource.avail,
            acquired: (!resource.acquired.is_empty()).then(|| resource.acquired.clone()),
            orphaned: false,
        }
    }

    pub fn is_broken(&self) -> bool {
        self.acquired.as_deref() == Some(BROKEN_MARKER)
    }
}

#[derive(Debug)]
pub struct ResourceImport {
    pub path: ResourcePath,
    entry: Mutex<ResourceEntry>,
}

impl ResourceImport {
    pub fn new(path: ResourcePath, entry: ResourceEntry) -> ResourceHandle {
        Arc::new(Self {
            path,
            entry: Mutex::new(entry),
        })
    }

    pub fn snapshot(&self) -> ResourceEntry {
        self.entry.lock().clone()
    }

    /// Apply an exporter update. The orphan flag is left alone.
    pub fn merge(&self, update: ResourceEntry) {
        let mut entry = self.entry.lock();
        entry.cls = update.cls;
        entry.params = update.params;
        entry.avail = update.avail;
        entry.acquired = update.acquired;
    }

    pub fn acquired(&self) -> Option<String> {
        self.entry.lock().acquired.clone()
    }

    pub fn set_acquired(&self, place: Option<String>) {
        self.entry.lock().acquired = place;
    }

    pub fn is_orphaned(&self) -> bool {
        self.entry.lock().orphaned
    }

    pub fn set_orphaned(&self, orphaned: bool) {
        self.entry.lock().orphaned = orphaned;
    }

    pub fn to_proto(&self) -> pb::Resource {
        let entry = self.entry.lock();
        pb::Resource {
            path: Some(self.path.to_proto()),
            cls: entry.cls.clone(),
            params: entry
                .params
                .iter()
                .map(|(k, v)| (k.clone(), v.to_proto()))
                .collect(),
            acquired: entry.acquired.clone().unwrap_or_default(),
            avail: entry.avail,
            orphaned: entry.orphaned,
        }
    }
}
