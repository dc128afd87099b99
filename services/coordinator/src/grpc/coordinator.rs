use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;

use labhub_proto::coordinator::v1::{self as pb, Coordinator as CoordinatorRpc};
use tokio_stream::Stream;
use tonic::{Request, Response, Status, Streaming};
use tracing::debug;

use crate::coordinator::Coordinator;

type RpcResult<T> = Result<Response<T>, Status>;
type ResponseStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

pub struct CoordinatorService {
    coordinator: Arc<Coordinator>,
}

impl CoordinatorService {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    pub fn into_server(self) -> pb::CoordinatorServer<Self> {
        pb::CoordinatorServer::new(self)
    }

    /// The principal of the client stream sharing this request's connection.
    fn principal<T>(&self, request: &Request<T>) -> Result<String, Status> {
        let peer = request
            .remote_addr()
            .ok_or_else(|| Status::failed_precondition("request has no peer address"))?;
        self.coordinator
            .clients()
            .by_peer(peer)
            .and_then(|session| session.principal())
            .ok_or_else(|| {
                Status::failed_precondition("no client stream with completed startup on this connection")
            })
    }
}

fn optional(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

#[tonic::async_trait]
impl CoordinatorRpc for CoordinatorService {
    type ClientStreamStream = ResponseStream<pb::ClientOutMessage>;
    type ExporterStreamStream = ResponseStream<pb::ExporterOutMessage>;

    async fn client_stream(
        &self,
        request: Request<Streaming<pb::ClientInMessage>>,
    ) -> RpcResult<Self::ClientStreamStream> {
        let peer = request.remote_addr();
        debug!(peer = ?peer, "Client stream opened");
        let outbound = self.coordinator.connect_client(peer, request.into_inner());
        Ok(Response::new(Box::pin(outbound)))
    }

    async fn exporter_stream(
        &self,
        request: Request<Streaming<pb::ExporterInMessage>>,
    ) -> RpcResult<Self::ExporterStreamStream> {
        let peer = request.remote_addr();
        debug!(peer = ?peer, "Exporter stream opened");
        let outbound = self.coordinator.connect_exporter(peer, request.into_inner());
        Ok(Response::new(Box::pin(outbound)))
    }

    async fn add_place(&self, request: Request<pb::AddPlaceRequest>) -> RpcResult<pb::AddPlaceResponse> {
        let req = request.into_inner();
        self.coordinator.add_place(&req.name).await?;
        Ok(Response::new(pb::AddPlaceResponse {}))
    }

    async fn delete_place(
        &self,
        request: Request<pb::DeletePlaceRequest>,
    ) -> RpcResult<pb::DeletePlaceResponse> {
        let req = request.into_inner();
        self.coordinator.delete_place(&req.name).await?;
        Ok(Response::new(pb::DeletePlaceResponse {}))
    }

    async fn get_places(
        &self,
        _request: Request<pb::GetPlacesRequest>,
    ) -> RpcResult<pb::GetPlacesResponse> {
        let places = self.coordinator.get_places().await;
        Ok(Response::new(pb::GetPlacesResponse { places }))
    }

    async fn add_place_alias(
        &self,
        request: Request<pb::AddPlaceAliasRequest>,
    ) -> RpcResult<pb::AddPlaceAliasResponse> {
        let req = request.into_inner();
        self.coordinator
            .add_place_alias(&req.placename, &req.alias)
            .await?;
        Ok(Response::new(pb::AddPlaceAliasResponse {}))
    }

    async fn delete_place_alias(
        &self,
        request: Request<pb::DeletePlaceAliasRequest>,
    ) -> RpcResult<pb::DeletePlaceAliasResponse> {
        let req = request.into_inner();
        self.coordinator
            .delete_place_alias(&req.placename, &req.alias)
            .await?;
        Ok(Response::new(pb::DeletePlaceAliasResponse {}))
    }

    async fn set_place_tags(
        &self,
        request: Request<pb::SetPlaceTagsRequest>,
    ) -> RpcResult<pb::SetPlaceTagsResponse> {
        let req = request.into_inner();
        let tags: BTreeMap<String, String> = req.tags.into_iter().collect();
        self.coordinator.set_place_tags(&req.placename, &tags).await?;
        Ok(Response::new(pb::SetPlaceTagsResponse {}))
    }

    async fn set_place_comment(
        &self,
        request: Request<pb::SetPlaceCommentRequest>,
    ) -> RpcResult<pb::SetPlaceCommentResponse> {
        let req = request.into_inner();
        self.coordinator
            .set_place_comment(&req.placename, &req.comment)
            .await?;
        Ok(Response::new(pb::SetPlaceCommentResponse {}))
    }

    async fn add_place_match(
        &self,
        request: Request<pb::AddPlaceMatchRequest>,
    ) -> RpcResult<pb::AddPlaceMatchResponse> {
        let req = request.into_inner();
        self.coordinator
            .add_place_match(&req.placename, &req.pattern, optional(req.rename))
            .await?;
        Ok(Response::new(pb::AddPlaceMatchResponse {}))
    }

    async fn delete_place_match(
        &self,
        request: Request<pb::DeletePlaceMatchRequest>,
    ) -> RpcResult<pb::DeletePlaceMatchResponse> {
        let req = request.into_inner();
        self.coordinator
            .delete_place_match(&req.placename, &req.pattern, optional(req.rename))
            .await?;
        Ok(Response::new(pb::DeletePlaceMatchResponse {}))
    }

    async fn acquire_place(
        &self,
        request: Request<pb::AcquirePlaceRequest>,
    ) -> RpcResult<pb::AcquirePlaceResponse> {
        let principal = self.principal(&request)?;
        let req = request.into_inner();
        self.coordinator
            .acquire_place(&req.placename, &principal)
            .await?;
        Ok(Response::new(pb::AcquirePlaceResponse {}))
    }

    async fn release_place(
        &self,
        request: Request<pb::ReleasePlaceRequest>,
    ) -> RpcResult<pb::ReleasePlaceResponse> {
        let req = request.into_inner();
        let fromuser = optional(req.fromuser);
        self.coordinator
            .release_place(&req.placename, fromuser.as_deref())
            .await?;
        Ok(Response::new(pb::ReleasePlaceResponse {}))
    }

    async fn allow_place(
        &self,
        request: Request<pb::AllowPlaceRequest>,
    ) -> RpcResult<pb::AllowPlaceResponse> {
        let principal = self.principal(&request)?;
        let req = request.into_inner();
        self.coordinator
            .allow_place(&req.placename, &principal, &req.user)
            .await?;
        Ok(Response::new(pb::AllowPlaceResponse {}))
    }

    async fn create_reservation(
        &self,
        request: Request<pb::CreateReservationRequest>,
    ) -> RpcResult<pb::CreateReservationResponse> {
        let principal = self.principal(&request)?;
        let req = request.into_inner();
        let filters = req
            .filters
            .into_iter()
            .map(|(name, f)| (name, f.filter.into_iter().collect()))
            .collect();
        let reservation = self
            .coordinator
            .create_reservation(&principal, filters, req.prio)
            .await?;
        Ok(Response::new(pb::CreateReservationResponse {
            reservation: Some(reservation),
        }))
    }

    async fn cancel_reservation(
        &self,
        request: Request<pb::CancelReservationRequest>,
    ) -> RpcResult<pb::CancelReservationResponse> {
        let req = request.into_inner();
        self.coordinator.cancel_reservation(&req.token).await?;
        Ok(Response::new(pb::CancelReservationResponse {}))
    }

    async fn poll_reservation(
        &self,
        request: Request<pb::PollReservationRequest>,
    ) -> RpcResult<pb::PollReservationResponse> {
        let req = request.into_inner();
        let reservation = self.coordinator.poll_reservation(&req.token).await?;
        Ok(Response::new(pb::PollReservationResponse {
            reservation: Some(reservation),
        }))
    }

    async fn get_reservations(
        &self,
        _request: Request<pb::GetReservationsRequest>,
    ) -> RpcResult<pb::GetReservationsResponse> {
        let reservations = self.coordinator.get_reservations().await;
        Ok(Response::new(pb::GetReservationsResponse { reservations }))
    }
}
