//! gRPC surface of the coordinator.

mod coordinator;

pub use coordinator::CoordinatorService;
