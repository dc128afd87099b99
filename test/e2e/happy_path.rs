//! End-to-end happy path test.
//!
//! Runs a real coordinator gRPC server on a loopback port, a real exporter
//! client publishing two resources, and two client connections, verifying:
//!
//! 1. Exporter registration and resource publication
//! 2. Place configuration over unary RPCs
//! 3. Acquire and release, with the exporter holding the resources
//! 4. Exclusive ownership across principals
//! 5. Reservation allocation, owner-only acquire and cancellation
//!
//! ## Running
//!
//! ```bash
//! cargo test -p labhub-e2e --test happy_path
//! ```

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use labhub_coordinator::config::CoordinatorConfig;
use labhub_coordinator::grpc::CoordinatorService;
use labhub_coordinator::Coordinator;
use labhub_exporter::backoff::BackoffPolicy;
use labhub_exporter::resource::parse_resources;
use labhub_exporter::{ExporterClient, ExporterState, ResourceRegistry};
use labhub_proto::coordinator::v1::{self as pb, CoordinatorClient, ReservationState};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::{TcpListenerStream, UnboundedReceiverStream};
use tonic::transport::Channel;
use tonic::{Code, Streaming};

const RESOURCES: &str = r#"
bench:
  console:
    cls: RawSerialPort
    port: /dev/ttyUSB0
  power:
    cls: PowerPort
    model: gude
    host: pdu-1
    index: 3
"#;

async fn start_coordinator(
    shutdown: watch::Receiver<bool>,
) -> (Arc<Coordinator>, SocketAddr) {
    let coordinator = Coordinator::new(CoordinatorConfig {
        command_timeout: Duration::from_secs(2),
        ..CoordinatorConfig::default()
    })
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let service = CoordinatorService::new(Arc::clone(&coordinator)).into_server();

    tokio::spawn(async move {
        let mut shutdown = shutdown;
        tonic::transport::Server::builder()
            .add_service(service)
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                while !*shutdown.borrow() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await
            .unwrap();
    });

    (coordinator, addr)
}

async fn wait_until<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// A user session: one connection carrying the client stream and the
/// unary calls made on its behalf.
struct Session {
    rpc: CoordinatorClient<Channel>,
    tx: mpsc::UnboundedSender<pb::ClientInMessage>,
    inbound: Streaming<pb::ClientOutMessage>,
    next_sync: u64,
}

impl Session {
    async fn open(addr: SocketAddr, principal: &str) -> Self {
        let mut rpc = CoordinatorClient::connect(format!("http://{addr}"))
            .await
            .unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(pb::ClientInMessage {
            kind: Some(pb::client_in_message::Kind::Startup(pb::StartupDone {
                version: "e2e".into(),
                name: principal.into(),
            })),
        })
        .unwrap();
        let inbound = rpc
            .client_stream(UnboundedReceiverStream::new(rx))
            .await
            .unwrap()
            .into_inner();

        let mut session = Self {
            rpc,
            tx,
            inbound,
            next_sync: 1,
        };
        session.sync().await;
        session
    }

    /// Round-trip a sync so every earlier message has been processed.
    async fn sync(&mut self) -> Vec<pb::UpdateResponse> {
        let id = self.next_sync;
        self.next_sync += 1;
        self.tx
            .send(pb::ClientInMessage {
                kind: Some(pb::client_in_message::Kind::Sync(pb::SyncMessage { id })),
            })
            .unwrap();

        let mut updates = Vec::new();
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), self.inbound.message())
                .await
                .expect("sync echo in time")
                .unwrap()
                .expect("stream open");
            updates.extend(message.updates);
            if message.sync == Some(pb::SyncMessage { id }) {
                return updates;
            }
        }
    }

    async fn acquire(&mut self, place: &str) -> Result<(), tonic::Status> {
        self.rpc
            .acquire_place(pb::AcquirePlaceRequest {
                placename: place.into(),
            })
            .await
            .map(|_| ())
    }

    async fn release(&mut self, place: &str) -> Result<(), tonic::Status> {
        self.rpc
            .release_place(pb::ReleasePlaceRequest {
                placename: place.into(),
                fromuser: None,
            })
            .await
            .map(|_| ())
    }

    async fn place(&mut self, name: &str) -> pb::Place {
        self.rpc
            .get_places(pb::GetPlacesRequest {})
            .await
            .unwrap()
            .into_inner()
            .places
            .into_iter()
            .find(|p| p.name == name)
            .unwrap()
    }
}

#[tokio::test]
async fn happy_path() {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,labhub_coordinator=debug".into()),
        )
        .with_test_writer()
        .try_init();

    let (coordinator, addr) = start_coordinator(shutdown_rx.clone()).await;
    tracing::info!(%addr, "Coordinator listening");

    // Exporter
    let groups = parse_resources(
        RESOURCES,
        &ResourceRegistry::with_builtins(),
        std::path::Path::new("e2e.yaml"),
    )
    .unwrap();
    let mut exporter = ExporterClient::new(
        format!("http://{addr}"),
        ExporterState::new("lab", groups),
    )
    .with_backoff(BackoffPolicy {
        base: Duration::from_millis(20),
        max: Duration::from_millis(200),
        jitter: 0.0,
    });
    let exporter_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { exporter.run(shutdown_rx).await }
    });

    wait_until("exporter resources", || {
        coordinator
            .exporters()
            .by_name("lab")
            .is_some_and(|e| e.get_resources().get("bench").map(BTreeMap::len) == Some(2))
    })
    .await;

    // Place configuration
    let mut alice = Session::open(addr, "host/alice").await;
    alice
        .tx
        .send(pb::ClientInMessage {
            kind: Some(pb::client_in_message::Kind::Subscribe(pb::Subscribe {
                all_places: Some(true),
                all_resources: Some(true),
            })),
        })
        .unwrap();
    let snapshot = alice.sync().await;
    assert_eq!(snapshot.len(), 2, "two resources, no places yet");

    alice
        .rpc
        .add_place(pb::AddPlaceRequest {
            name: "board".into(),
        })
        .await
        .unwrap();
    alice
        .rpc
        .add_place_match(pb::AddPlaceMatchRequest {
            placename: "board".into(),
            pattern: "lab/bench/*".into(),
            rename: None,
        })
        .await
        .unwrap();
    alice
        .rpc
        .set_place_tags(pb::SetPlaceTagsRequest {
            placename: "board".into(),
            tags: HashMap::from([("board".to_string(), "rpi".to_string())]),
        })
        .await
        .unwrap();

    // Acquire and release
    alice.acquire("board").await.unwrap();
    let board = alice.place("board").await;
    assert_eq!(board.acquired.as_deref(), Some("host/alice"));
    assert_eq!(board.acquired_resources.len(), 2);
    let console = coordinator
        .exporters()
        .by_name("lab")
        .and_then(|e| e.lookup("bench", "console"))
        .unwrap();
    assert_eq!(console.acquired().as_deref(), Some("board"));

    let mut bob = Session::open(addr, "host/bob").await;
    let err = bob.acquire("board").await.unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);

    alice.release("board").await.unwrap();
    assert_eq!(console.acquired(), None);
    let err = alice.release("board").await.unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);

    // Reservations
    let reservation = bob
        .rpc
        .create_reservation(pb::CreateReservationRequest {
            filters: HashMap::from([(
                "main".to_string(),
                pb::reservation::Filter {
                    filter: HashMap::from([("board".to_string(), "rpi".to_string())]),
                },
            )]),
            prio: 0.0,
        })
        .await
        .unwrap()
        .into_inner()
        .reservation
        .unwrap();
    assert_eq!(reservation.state, ReservationState::Allocated as i32);
    assert!(reservation.token.starts_with("rsv_"));

    let err = alice.acquire("board").await.unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);
    bob.acquire("board").await.unwrap();

    let polled = bob
        .rpc
        .poll_reservation(pb::PollReservationRequest {
            token: reservation.token.clone(),
        })
        .await
        .unwrap()
        .into_inner()
        .reservation
        .unwrap();
    assert_eq!(polled.state, ReservationState::Acquired as i32);

    bob.release("board").await.unwrap();
    bob.rpc
        .cancel_reservation(pb::CancelReservationRequest {
            token: reservation.token,
        })
        .await
        .unwrap();
    assert_eq!(alice.place("board").await.reservation, None);

    // Alice saw the place change over her subscription.
    let updates = alice.sync().await;
    assert!(updates.iter().any(|u| matches!(
        &u.kind,
        Some(pb::update_response::Kind::Place(p)) if p.name == "board"
    )));

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), exporter_handle)
        .await
        .unwrap()
        .unwrap();
}
