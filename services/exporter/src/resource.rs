//! Exported resources.
//!
//! A resource is a typed bag of connection parameters for a piece of lab
//! hardware. Classes are looked up by name in a [`ResourceRegistry`], and
//! each constructor deserializes its parameters from the YAML config.
//!
//! ```yaml
//! "1":
//!   console:
//!     cls: RawSerialPort
//!     port: /dev/ttyUSB0
//!   power:
//!     cls: PowerPort
//!     model: gude
//!     host: pdu-1
//!     index: 3
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::path::Path;

use labhub_proto::coordinator::v1 as pb;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ExporterError, Result};

/// A parameter value as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl ParamValue {
    pub fn to_proto(&self) -> pb::MapValue {
        use pb::map_value::Kind;
        let kind = match self {
            ParamValue::Bool(v) => Kind::BoolValue(*v),
            ParamValue::Int(v) => Kind::IntValue(*v),
            ParamValue::Float(v) => Kind::FloatValue(*v),
            ParamValue::String(v) => Kind::StringValue(v.clone()),
        };
        pb::MapValue { kind: Some(kind) }
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::String(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::String(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

pub trait Resource: Send + Sync + Debug {
    /// Class name published to the coordinator.
    fn class(&self) -> &'static str;

    fn params(&self) -> BTreeMap<String, ParamValue>;

    fn avail(&self) -> bool {
        true
    }
}

/// A network host reachable over SSH or similar.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkService {
    pub address: String,
    pub username: String,
    #[serde(default)]
    pub port: Option<i64>,
}

impl Resource for NetworkService {
    fn class(&self) -> &'static str {
        "NetworkService"
    }

    fn params(&self) -> BTreeMap<String, ParamValue> {
        let mut params = BTreeMap::from([
            ("address".to_string(), self.address.as_str().into()),
            ("username".to_string(), self.username.as_str().into()),
        ]);
        if let Some(port) = self.port {
            params.insert("port".into(), port.into());
        }
        params
    }
}

/// A serial console attached to the exporter host.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawSerialPort {
    pub port: String,
    #[serde(default = "default_speed")]
    pub speed: i64,
}

fn default_speed() -> i64 {
    115_200
}

impl Resource for RawSerialPort {
    fn class(&self) -> &'static str {
        "RawSerialPort"
    }

    fn params(&self) -> BTreeMap<String, ParamValue> {
        BTreeMap::from([
            ("port".to_string(), self.port.as_str().into()),
            ("speed".to_string(), self.speed.into()),
        ])
    }
}

/// One outlet of a network power switch.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PowerPort {
    pub model: String,
    pub host: String,
    pub index: i64,
}

impl Resource for PowerPort {
    fn class(&self) -> &'static str {
        "PowerPort"
    }

    fn params(&self) -> BTreeMap<String, ParamValue> {
        BTreeMap::from([
            ("model".to_string(), self.model.as_str().into()),
            ("host".to_string(), self.host.as_str().into()),
            ("index".to_string(), self.index.into()),
        ])
    }
}

type Constructor = fn(serde_yaml::Value) -> std::result::Result<Box<dyn Resource>, serde_yaml::Error>;

fn construct<R>(params: serde_yaml::Value) -> std::result::Result<Box<dyn Resource>, serde_yaml::Error>
where
    R: Resource + DeserializeOwned + 'static,
{
    Ok(Box::new(serde_yaml::from_value::<R>(params)?))
}

/// Resource constructors by class name.
pub struct ResourceRegistry {
    constructors: HashMap<&'static str, Constructor>,
}

impl ResourceRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register::<NetworkService>("NetworkService");
        registry.register::<RawSerialPort>("RawSerialPort");
        registry.register::<PowerPort>("PowerPort");
        registry
    }

    pub fn register<R>(&mut self, class: &'static str)
    where
        R: Resource + DeserializeOwned + 'static,
    {
        self.constructors.insert(class, construct::<R>);
    }

    pub fn classes(&self) -> Vec<&'static str> {
        let mut classes: Vec<_> = self.constructors.keys().copied().collect();
        classes.sort_unstable();
        classes
    }

    pub fn build(&self, class: &str, params: serde_yaml::Value) -> Result<Box<dyn Resource>> {
        let constructor = self
            .constructors
            .get(class)
            .ok_or_else(|| ExporterError::UnknownClass(class.to_string()))?;
        constructor(params).map_err(|source| ExporterError::InvalidParams {
            cls: class.to_string(),
            source,
        })
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[derive(Debug, Deserialize)]
struct ResourceSpec {
    cls: String,
    #[serde(flatten)]
    params: serde_yaml::Mapping,
}

/// group -> resource name -> resource
pub type ResourceGroups = BTreeMap<String, BTreeMap<String, Box<dyn Resource>>>;

/// Build resources from a YAML document.
pub fn parse_resources(
    content: &str,
    registry: &ResourceRegistry,
    path: &Path,
) -> Result<ResourceGroups> {
    let specs: Option<BTreeMap<String, BTreeMap<String, ResourceSpec>>> =
        serde_yaml::from_str(content).map_err(|source| ExporterError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;

    let mut groups = ResourceGroups::new();
    for (group, resources) in specs.unwrap_or_default() {
        let mut built = BTreeMap::new();
        for (name, spec) in resources {
            let resource = registry.build(&spec.cls, serde_yaml::Value::Mapping(spec.params))?;
            built.insert(name, resource);
        }
        groups.insert(group, built);
    }
    Ok(groups)
}

pub fn load_resources(path: &Path, registry: &ResourceRegistry) -> Result<ResourceGroups> {
    let content = std::fs::read_to_string(path).map_err(|source| ExporterError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_resources(&content, registry, path)
}
