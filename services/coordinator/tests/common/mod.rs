//! In-process exporter and client doubles for coordinator tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use labhub_coordinator::config::CoordinatorConfig;
use labhub_coordinator::Coordinator;
use labhub_proto::coordinator::v1 as pb;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tonic::Status;

pub fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        command_timeout: Duration::from_millis(200),
        ..CoordinatorConfig::default()
    }
}

pub fn coordinator() -> Arc<Coordinator> {
    Coordinator::new(test_config()).unwrap()
}

/// Poll `check` until it holds, panicking after two seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

pub async fn place(coordinator: &Coordinator, name: &str) -> pb::Place {
    coordinator
        .get_places()
        .await
        .into_iter()
        .find(|p| p.name == name)
        .unwrap_or_else(|| panic!("place {name} missing"))
}

/// How the fake exporter answers commands for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Accept,
    Reject,
    Ignore,
}

type Inbound = mpsc::UnboundedSender<Result<pb::ExporterInMessage, Status>>;

#[derive(Default)]
struct FakeState {
    resources: BTreeMap<(String, String), pb::Resource>,
    behavior: BTreeMap<String, Behavior>,
    requests: Vec<pb::ExporterSetAcquiredRequest>,
    aborted: Option<Status>,
}

/// An exporter that keeps its resources in memory and answers commands
/// the way a real one does: resource update first, then the response.
pub struct FakeExporter {
    pub name: String,
    tx: Inbound,
    state: Arc<Mutex<FakeState>>,
    task: JoinHandle<()>,
}

impl FakeExporter {
    pub fn connect(coordinator: &Arc<Coordinator>, name: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut outbound = Box::pin(
            coordinator.connect_exporter(None, UnboundedReceiverStream::new(rx)),
        );
        tx.send(Ok(pb::ExporterInMessage {
            kind: Some(pb::exporter_in_message::Kind::Startup(pb::StartupDone {
                version: "test".into(),
                name: name.into(),
            })),
        }))
        .unwrap();

        let state = Arc::new(Mutex::new(FakeState::default()));
        let task = tokio::spawn({
            let state = Arc::clone(&state);
            let tx = tx.clone();
            let name = name.to_string();
            async move {
                while let Some(message) = outbound.next().await {
                    let message = match message {
                        Ok(message) => message,
                        Err(status) => {
                            state.lock().aborted = Some(status);
                            break;
                        }
                    };
                    if let Some(pb::exporter_out_message::Kind::SetAcquiredRequest(request)) =
                        message.kind
                    {
                        answer(&name, &state, &tx, request);
                    }
                }
            }
        });

        Self {
            name: name.into(),
            tx,
            state,
            task,
        }
    }

    fn send_resource(&self, resource: pb::Resource) {
        let _ = self.tx.send(Ok(pb::ExporterInMessage {
            kind: Some(pb::exporter_in_message::Kind::Resource(resource)),
        }));
    }

    pub fn add_resource(&self, group: &str, name: &str, cls: &str) {
        self.add_acquired_resource(group, name, cls, "");
    }

    pub fn add_acquired_resource(&self, group: &str, name: &str, cls: &str, acquired: &str) {
        let resource = pb::Resource {
            path: Some(pb::resource::Path {
                exporter_name: Some(self.name.clone()),
                group_name: group.into(),
                resource_name: name.into(),
            }),
            cls: cls.into(),
            params: Default::default(),
            acquired: acquired.into(),
            avail: true,
            orphaned: false,
        };
        self.state
            .lock()
            .resources
            .insert((group.into(), name.into()), resource.clone());
        self.send_resource(resource);
    }

    pub fn remove_resource(&self, group: &str, name: &str) {
        if let Some(mut resource) = self
            .state
            .lock()
            .resources
            .remove(&(group.to_string(), name.to_string()))
        {
            resource.cls.clear();
            self.send_resource(resource);
        }
    }

    pub fn set_behavior(&self, resource: &str, behavior: Behavior) {
        self.state.lock().behavior.insert(resource.into(), behavior);
    }

    /// The exporter's own view of who holds a resource, "" when free.
    pub fn acquired(&self, group: &str, name: &str) -> String {
        self.state
            .lock()
            .resources
            .get(&(group.to_string(), name.to_string()))
            .map(|r| r.acquired.clone())
            .unwrap_or_default()
    }

    /// (resource, place) pairs in the order commands arrived.
    pub fn requests(&self) -> Vec<(String, Option<String>)> {
        self.state
            .lock()
            .requests
            .iter()
            .map(|r| (r.resource_name.clone(), r.place_name.clone()))
            .collect()
    }

    pub fn aborted(&self) -> Option<Status> {
        self.state.lock().aborted.clone()
    }

    pub async fn wait_for_resources(&self, coordinator: &Coordinator, count: usize) {
        eventually("exporter resources to be published", || async {
            coordinator
                .exporters()
                .by_name(&self.name)
                .map(|e| e.get_resources().values().map(BTreeMap::len).sum::<usize>())
                == Some(count)
        })
        .await;
    }

    /// Close the stream and wait for the coordinator to forget the exporter.
    pub async fn disconnect(self, coordinator: &Coordinator) {
        let name = self.name.clone();
        drop(self.tx);
        self.task.abort();
        eventually("exporter to disconnect", || async {
            coordinator.exporters().by_name(&name).is_none()
        })
        .await;
    }
}

fn answer(
    exporter: &str,
    state: &Mutex<FakeState>,
    tx: &Inbound,
    request: pb::ExporterSetAcquiredRequest,
) {
    let mut state = state.lock();
    state.requests.push(request.clone());
    let behavior = state
        .behavior
        .get(&request.resource_name)
        .copied()
        .unwrap_or(Behavior::Accept);

    let response = match behavior {
        Behavior::Ignore => return,
        Behavior::Reject => pb::ExporterResponse {
            success: false,
            reason: Some("rejected by test".into()),
        },
        Behavior::Accept => {
            let key = (request.group_name.clone(), request.resource_name.clone());
            let Some(resource) = state.resources.get_mut(&key) else {
                return;
            };
            resource.acquired = request.place_name.clone().unwrap_or_default();
            let mut update = resource.clone();
            if let Some(path) = update.path.as_mut() {
                path.exporter_name = Some(exporter.to_string());
            }
            let _ = tx.send(Ok(pb::ExporterInMessage {
                kind: Some(pb::exporter_in_message::Kind::Resource(update)),
            }));
            pb::ExporterResponse {
                success: true,
                reason: None,
            }
        }
    };
    let _ = tx.send(Ok(pb::ExporterInMessage {
        kind: Some(pb::exporter_in_message::Kind::Response(response)),
    }));
}

/// A client stream with startup done.
pub struct FakeClient {
    tx: mpsc::UnboundedSender<Result<pb::ClientInMessage, Status>>,
    rx: std::pin::Pin<Box<dyn tokio_stream::Stream<Item = Result<pb::ClientOutMessage, Status>> + Send>>,
    next_sync: u64,
}

impl FakeClient {
    pub fn connect(coordinator: &Arc<Coordinator>, principal: &str) -> Self {
        use pb::client_in_message::Kind;

        let (tx, rx) = mpsc::unbounded_channel();
        let outbound = coordinator.connect_client(None, UnboundedReceiverStream::new(rx));
        tx.send(Ok(pb::ClientInMessage {
            kind: Some(Kind::Startup(pb::StartupDone {
                version: "test".into(),
                name: principal.into(),
            })),
        }))
        .unwrap();
        Self {
            tx,
            rx: Box::pin(outbound),
            next_sync: 1,
        }
    }

    pub fn subscribe(&self, places: Option<bool>, resources: Option<bool>) {
        self.tx
            .send(Ok(pb::ClientInMessage {
                kind: Some(pb::client_in_message::Kind::Subscribe(pb::Subscribe {
                    all_places: places,
                    all_resources: resources,
                })),
            }))
            .unwrap();
    }

    /// Send a sync and collect every update queued before its echo.
    pub async fn sync(&mut self) -> Vec<pb::UpdateResponse> {
        let id = self.next_sync;
        self.next_sync += 1;
        self.tx
            .send(Ok(pb::ClientInMessage {
                kind: Some(pb::client_in_message::Kind::Sync(pb::SyncMessage { id })),
            }))
            .unwrap();

        let mut updates = Vec::new();
        loop {
            let message = tokio::time::timeout(Duration::from_secs(2), self.rx.next())
                .await
                .expect("sync echo in time")
                .expect("stream open")
                .expect("no stream error");
            updates.extend(message.updates);
            if message.sync == Some(pb::SyncMessage { id }) {
                return updates;
            }
        }
    }
}
