//! Local resource state and request handling.
//!
//! The exporter is the authority on which place holds each of its
//! resources. Every `set_acquired_request` gets a resource update (on
//! success) followed by exactly one response.

use std::collections::BTreeMap;

use labhub_proto::coordinator::v1 as pb;
use tracing::{debug, info, warn};

use crate::error::{ExporterError, Result};
use crate::resource::{Resource, ResourceGroups};

#[derive(Debug)]
struct Exported {
    resource: Box<dyn Resource>,
    acquired: Option<String>,
}

#[derive(Debug)]
pub struct ExporterState {
    name: String,
    groups: BTreeMap<String, BTreeMap<String, Exported>>,
}

impl ExporterState {
    pub fn new(name: impl Into<String>, groups: ResourceGroups) -> Self {
        let groups = groups
            .into_iter()
            .map(|(group, resources)| {
                let resources = resources
                    .into_iter()
                    .map(|(name, resource)| {
                        (
                            name,
                            Exported {
                                resource,
                                acquired: None,
                            },
                        )
                    })
                    .collect();
                (group, resources)
            })
            .collect();
        Self {
            name: name.into(),
            groups,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resource_count(&self) -> usize {
        self.groups.values().map(BTreeMap::len).sum()
    }

    pub fn acquired(&self, group: &str, name: &str) -> Option<&str> {
        self.groups.get(group)?.get(name)?.acquired.as_deref()
    }

    fn resource_message(&self, group: &str, name: &str, exported: &Exported) -> pb::ExporterInMessage {
        let resource = pb::Resource {
            path: Some(pb::resource::Path {
                exporter_name: Some(self.name.clone()),
                group_name: group.to_string(),
                resource_name: name.to_string(),
            }),
            cls: exported.resource.class().to_string(),
            params: exported
                .resource
                .params()
                .iter()
                .map(|(k, v)| (k.clone(), v.to_proto()))
                .collect(),
            acquired: exported.acquired.clone().unwrap_or_default(),
            avail: exported.resource.avail(),
            orphaned: false,
        };
        pb::ExporterInMessage {
            kind: Some(pb::exporter_in_message::Kind::Resource(resource)),
        }
    }

    /// Startup followed by every resource, as sent on each (re)connect.
    pub fn announce(&self, version: &str) -> Vec<pb::ExporterInMessage> {
        let startup = pb::ExporterInMessage {
            kind: Some(pb::exporter_in_message::Kind::Startup(pb::StartupDone {
                version: version.to_string(),
                name: self.name.clone(),
            })),
        };
        std::iter::once(startup)
            .chain(self.groups.iter().flat_map(|(group, resources)| {
                resources
                    .iter()
                    .map(move |(name, exported)| self.resource_message(group, name, exported))
            }))
            .collect()
    }

    /// Mark a resource as held by `place`, or free it.
    pub fn set_acquired(&mut self, group: &str, name: &str, place: Option<&str>) -> Result<()> {
        let exported = self
            .groups
            .get_mut(group)
            .and_then(|r| r.get_mut(name))
            .ok_or_else(|| ExporterError::UnknownResource {
                group: group.to_string(),
                name: name.to_string(),
            })?;

        match (place, exported.acquired.as_deref()) {
            (Some(place), Some(holder)) if holder != place => {
                return Err(ExporterError::AlreadyAcquired {
                    resource: format!("{group}/{name}"),
                    holder: holder.to_string(),
                });
            }
            (None, None) => debug!(group = %group, resource = %name, "Release of a free resource"),
            _ => {}
        }
        exported.acquired = place.map(str::to_string);
        info!(group = %group, resource = %name, place = ?place, "Resource acquisition changed");
        Ok(())
    }

    /// Apply a coordinator request and build the messages that answer it.
    pub fn handle_request(
        &mut self,
        request: &pb::ExporterSetAcquiredRequest,
    ) -> Vec<pb::ExporterInMessage> {
        let group = &request.group_name;
        let name = &request.resource_name;
        let place = request.place_name.as_deref().filter(|p| !p.is_empty());

        let mut messages = Vec::with_capacity(2);
        let response = match self.set_acquired(group, name, place) {
            Ok(()) => {
                if let Some(exported) = self.groups.get(group).and_then(|r| r.get(name)) {
                    messages.push(self.resource_message(group, name, exported));
                }
                pb::ExporterResponse {
                    success: true,
                    reason: None,
                }
            }
            Err(e) => {
                warn!(group = %group, resource = %name, error = %e, "Refusing acquisition change");
                pb::ExporterResponse {
                    success: false,
                    reason: Some(e.to_string()),
                }
            }
        };
        messages.push(pb::ExporterInMessage {
            kind: Some(pb::exporter_in_message::Kind::Response(response)),
        });
        messages
    }
}
