use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use labhub_id::{RequestId, SessionId};
use labhub_proto::coordinator::v1 as pb;
use parking_lot::{Mutex, MutexGuard, RwLock};
use tokio::sync::{mpsc, oneshot};
use tonic::Status;
use tracing::{debug, warn};

use super::command::{ExporterCommand, Outbound};
use super::{ClientRegistry, CommandError};
use crate::model::{ResourceEntry, ResourceHandle, ResourceImport, ResourcePath};

/// group -> resource name -> handle
pub type ResourceTree = BTreeMap<String, BTreeMap<String, ResourceHandle>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetResourceAction {
    Add,
    Update,
    Delete,
}

/// One connected exporter, registered once it has sent `startup`.
pub struct ExporterSession {
    pub id: SessionId,
    pub peer: Option<SocketAddr>,
    pub name: String,
    pub version: String,
    groups: Mutex<ResourceTree>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl ExporterSession {
    pub(crate) fn new(
        peer: Option<SocketAddr>,
        name: String,
        version: String,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            id: SessionId::new(),
            peer,
            name,
            version,
            groups: Mutex::new(BTreeMap::new()),
            outbound,
        }
    }

    /// Upsert or delete one resource and fan the change out to clients.
    ///
    /// `update = None`, or an update without a class, deletes. A deleted
    /// resource that a place still holds is marked orphaned.
    pub fn set_resource(
        &self,
        group: &str,
        name: &str,
        update: Option<&pb::Resource>,
        clients: &ClientRegistry,
    ) -> Option<(SetResourceAction, ResourceHandle)> {
        let update = update.filter(|r| !r.cls.is_empty());
        let mut groups = self.groups.lock();

        let result = match update {
            Some(resource) => {
                let entry = ResourceEntry::from_proto(resource);
                let resources = groups.entry(group.to_string()).or_default();
                match resources.get(name) {
                    Some(existing) if existing.path.cls == entry.cls => {
                        existing.merge(entry);
                        Some((SetResourceAction::Update, Arc::clone(existing)))
                    }
                    existing => {
                        if let Some(old) = existing {
                            warn!(
                                resource = %old.path,
                                cls = %entry.cls,
                                "Resource changed class, replacing import"
                            );
                            if old.acquired().is_some() {
                                old.set_orphaned(true);
                            }
                        }
                        let path = ResourcePath::new(&self.name, group, &entry.cls, name);
                        let handle = ResourceImport::new(path, entry);
                        resources.insert(name.to_string(), Arc::clone(&handle));
                        Some((SetResourceAction::Add, handle))
                    }
                }
            }
            None => {
                let removed = groups.get_mut(group).and_then(|r| r.remove(name));
                if groups.get(group).is_some_and(BTreeMap::is_empty) {
                    groups.remove(group);
                }
                removed.map(|handle| {
                    if handle.acquired().is_some() {
                        handle.set_orphaned(true);
                    }
                    (SetResourceAction::Delete, handle)
                })
            }
        };

        if let Some((action, handle)) = &result {
            use pb::update_response::Kind;
            let kind = match action {
                SetResourceAction::Delete => Kind::DelResource(handle.path.to_proto()),
                _ => Kind::Resource(handle.to_proto()),
            };
            clients.broadcast_resource(pb::UpdateResponse { kind: Some(kind) });
        }

        result
    }

    pub fn get_resources(&self) -> ResourceTree {
        self.groups.lock().clone()
    }

    pub fn lookup(&self, group: &str, name: &str) -> Option<ResourceHandle> {
        self.groups.lock().get(group)?.get(name).cloned()
    }

    /// Hold the resource tree still, e.g. while a client takes a snapshot.
    pub(crate) fn lock_groups(&self) -> MutexGuard<'_, ResourceTree> {
        self.groups.lock()
    }

    /// Ask the exporter to mark a resource acquired for `place`, or released
    /// when `place` is `None`, and wait for its answer.
    pub async fn set_acquired(
        &self,
        handle: &ResourceImport,
        place: Option<&str>,
        timeout: Duration,
    ) -> Result<(), CommandError> {
        let id = RequestId::new();
        let (reply, rx) = oneshot::channel();
        let request = pb::ExporterSetAcquiredRequest {
            group_name: handle.path.group.clone(),
            resource_name: handle.path.name.clone(),
            place_name: place.map(str::to_string),
        };
        debug!(
            request_id = %id,
            resource = %handle.path,
            place = place.unwrap_or(""),
            "Sending exporter command"
        );

        self.outbound
            .send(Outbound::Command(ExporterCommand { id, request, reply }))
            .map_err(|_| CommandError::Disconnected)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(()))) => {
                handle.set_acquired(place.map(str::to_string));
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(CommandError::Disconnected),
            Err(_) => {
                warn!(request_id = %id, resource = %handle.path, "Exporter command expired");
                Err(CommandError::Expired)
            }
        }
    }

    /// End the exporter's stream with an error.
    pub(crate) fn abort(&self, status: Status) {
        let _ = self.outbound.send(Outbound::Abort(status));
    }
}

/// Connected exporters, by session.
#[derive(Default)]
pub struct ExporterRegistry {
    sessions: RwLock<BTreeMap<SessionId, Arc<ExporterSession>>>,
}

impl ExporterRegistry {
    /// Register a session unless another one already uses its name.
    pub(crate) fn insert(&self, session: Arc<ExporterSession>) -> bool {
        let mut sessions = self.sessions.write();
        if sessions.values().any(|s| s.name == session.name) {
            return false;
        }
        sessions.insert(session.id, session);
        true
    }

    pub(crate) fn remove(&self, id: SessionId) -> Option<Arc<ExporterSession>> {
        self.sessions.write().remove(&id)
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<ExporterSession>> {
        self.sessions
            .read()
            .values()
            .find(|s| s.name == name)
            .cloned()
    }

    /// Snapshot ordered by exporter name.
    pub fn all(&self) -> Vec<Arc<ExporterSession>> {
        let mut all: Vec<_> = self.sessions.read().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Run `f` over all sessions, ordered by name, with registrations
    /// blocked until it returns.
    pub(crate) fn with_all<R>(&self, f: impl FnOnce(&[Arc<ExporterSession>]) -> R) -> R {
        let sessions = self.sessions.read();
        let mut all: Vec<_> = sessions.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        f(&all)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
