pub mod coordinator {
    pub mod v1 {
        tonic::include_proto!("labhub.coordinator.v1");

        pub use coordinator_client::CoordinatorClient;
        pub use coordinator_server::{Coordinator, CoordinatorServer};
    }
}
