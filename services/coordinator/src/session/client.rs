use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use labhub_id::SessionId;
use labhub_proto::coordinator::v1 as pb;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::debug;

use super::ExporterSession;
use crate::model::Place;

/// Resources per message when a client subscribes to all resources.
pub const RESOURCE_BATCH_SIZE: usize = 100;

#[derive(Debug, Default, Clone, Copy)]
struct Subscriptions {
    places: bool,
    resources: bool,
}

#[derive(Debug, Clone)]
struct Identity {
    name: String,
    version: String,
}

/// One connected client stream.
///
/// Everything sent to the client goes through a single FIFO queue, so a
/// `sync` echo is delivered after every update enqueued before it.
pub struct ClientSession {
    pub id: SessionId,
    pub peer: Option<SocketAddr>,
    identity: RwLock<Option<Identity>>,
    subscriptions: Mutex<Subscriptions>,
    tx: mpsc::UnboundedSender<pb::ClientOutMessage>,
}

impl ClientSession {
    pub fn new(peer: Option<SocketAddr>, tx: mpsc::UnboundedSender<pb::ClientOutMessage>) -> Self {
        Self {
            id: SessionId::new(),
            peer,
            identity: RwLock::new(None),
            subscriptions: Mutex::new(Subscriptions::default()),
            tx,
        }
    }

    pub fn startup(&self, name: String, version: String) {
        debug!(session = %self.id, name = %name, version = %version, "Client startup");
        *self.identity.write() = Some(Identity { name, version });
    }

    /// The principal name announced at startup.
    pub fn principal(&self) -> Option<String> {
        self.identity.read().as_ref().map(|i| i.name.clone())
    }

    pub fn version(&self) -> Option<String> {
        self.identity.read().as_ref().map(|i| i.version.clone())
    }

    fn send(&self, message: pb::ClientOutMessage) {
        // A closed queue means the stream is being torn down.
        let _ = self.tx.send(message);
    }

    pub fn send_updates(&self, updates: Vec<pb::UpdateResponse>) {
        if updates.is_empty() {
            return;
        }
        self.send(pb::ClientOutMessage {
            sync: None,
            updates,
        });
    }

    pub fn sync(&self, id: u64) {
        self.send(pb::ClientOutMessage {
            sync: Some(pb::SyncMessage { id }),
            updates: Vec::new(),
        });
    }

    pub fn wants_places(&self) -> bool {
        self.subscriptions.lock().places
    }

    pub fn wants_resources(&self) -> bool {
        self.subscriptions.lock().resources
    }

    /// Enable or disable place updates. On enable, one update per existing
    /// place is queued first. Callers hold the coordinator state lock so no
    /// place change can slip between the snapshot and the flag.
    pub fn subscribe_places<'a>(&self, enable: bool, places: impl IntoIterator<Item = &'a Place>) {
        let mut subscriptions = self.subscriptions.lock();
        if enable && !subscriptions.places {
            use pb::update_response::Kind;
            let updates = places
                .into_iter()
                .map(|place| pb::UpdateResponse {
                    kind: Some(Kind::Place(place.to_proto())),
                })
                .collect();
            self.send_updates(updates);
        }
        subscriptions.places = enable;
    }

    /// Enable or disable resource updates. On enable, every published
    /// resource is queued in batches while all exporter trees are locked.
    pub fn subscribe_resources(&self, enable: bool, exporters: &[Arc<ExporterSession>]) {
        use pb::update_response::Kind;

        let trees: Vec<_> = exporters.iter().map(|e| e.lock_groups()).collect();
        let mut subscriptions = self.subscriptions.lock();
        if enable && !subscriptions.resources {
            let updates: Vec<pb::UpdateResponse> = trees
                .iter()
                .flat_map(|tree| tree.values().flat_map(BTreeMap::values))
                .map(|handle| pb::UpdateResponse {
                    kind: Some(Kind::Resource(handle.to_proto())),
                })
                .collect();
            for chunk in updates.chunks(RESOURCE_BATCH_SIZE) {
                self.send_updates(chunk.to_vec());
            }
        }
        subscriptions.resources = enable;
    }
}

/// Connected clients, by session.
#[derive(Default)]
pub struct ClientRegistry {
    sessions: RwLock<BTreeMap<SessionId, Arc<ClientSession>>>,
}

impl ClientRegistry {
    pub fn insert(&self, session: Arc<ClientSession>) {
        self.sessions.write().insert(session.id, session);
    }

    pub fn remove(&self, id: SessionId) -> Option<Arc<ClientSession>> {
        self.sessions.write().remove(&id)
    }

    /// The session whose stream arrived over the same connection.
    pub fn by_peer(&self, peer: SocketAddr) -> Option<Arc<ClientSession>> {
        self.sessions
            .read()
            .values()
            .find(|s| s.peer == Some(peer))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn broadcast_place(&self, update: pb::UpdateResponse) {
        for session in self.sessions.read().values() {
            if session.wants_places() {
                session.send_updates(vec![update.clone()]);
            }
        }
    }

    pub fn broadcast_resource(&self, update: pb::UpdateResponse) {
        for session in self.sessions.read().values() {
            if session.wants_resources() {
                session.send_updates(vec![update.clone()]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exporter_with(count: usize, clients: &ClientRegistry) -> Arc<ExporterSession> {
        let (tx, _rx) = mpsc::unbounded_channel();
        let exporter = ExporterSession::new(None, "lab".into(), "1.0".into(), tx);
        for i in 0..count {
            let resource = pb::Resource {
                path: None,
                cls: "NetworkService".into(),
                params: Default::default(),
                acquired: String::new(),
                avail: true,
                orphaned: false,
            };
            exporter.set_resource("1", &format!("r{i:03}"), Some(&resource), clients);
        }
        Arc::new(exporter)
    }

    #[test]
    fn subscribe_resources_batches() {
        let clients = ClientRegistry::default();
        let exporter = exporter_with(250, &clients);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = ClientSession::new(None, tx);

        client.subscribe_resources(true, &[exporter]);

        let sizes: Vec<usize> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|m| m.updates.len())
            .collect();
        assert_eq!(sizes, vec![100, 100, 50]);
        assert!(client.wants_resources());
    }

    #[test]
    fn subscribe_places_sends_snapshot_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = ClientSession::new(None, tx);
        let places = [Place::new("a"), Place::new("b")];

        client.subscribe_places(true, &places);
        client.subscribe_places(true, &places);

        let first = rx.try_recv().unwrap();
        assert_eq!(first.updates.len(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn broadcast_honors_subscriptions() {
        let registry = ClientRegistry::default();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = Arc::new(ClientSession::new(None, tx_a));
        let b = Arc::new(ClientSession::new(None, tx_b));
        a.subscribe_places(true, std::iter::empty());
        registry.insert(a);
        registry.insert(b);

        registry.broadcast_place(pb::UpdateResponse {
            kind: Some(pb::update_response::Kind::DelPlace("x".into())),
        });

        assert_eq!(rx_a.try_recv().unwrap().updates.len(), 1);
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn sync_is_queued_behind_updates() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = ClientSession::new(None, tx);
        client.subscribe_places(true, &[Place::new("a")]);
        client.sync(7);

        assert_eq!(rx.try_recv().unwrap().updates.len(), 1);
        assert_eq!(rx.try_recv().unwrap().sync, Some(pb::SyncMessage { id: 7 }));
    }

    #[test]
    fn principal_after_startup() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = ClientSession::new(None, tx);
        assert_eq!(client.principal(), None);
        client.startup("host/alice".into(), "1.0".into());
        assert_eq!(client.principal().as_deref(), Some("host/alice"));
    }
}
