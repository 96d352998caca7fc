//! NPM gRPC server.
//!
//! Terminates the wire protocol and nothing else: ids are validated here,
//! demand goes to the [`CapacityManager`], membership comes back from it.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tonic::transport::server::TcpIncoming;
use tonic::transport::{Server, ServerTlsConfig};
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use nodepool_capacity::CapacityManager;
use nodepool_core::{CapacitySnapshotList, LbGroupMembership, validate_group_id};

use crate::error::{TransportError, TransportResult};
use crate::proto;
use crate::proto::node_pool_scaler_server::{NodePoolScaler, NodePoolScalerServer};
use crate::proto::peer_resolver_server::{PeerResolver, PeerResolverServer};
use crate::proto::runner_manager_server::{RunnerManager, RunnerManagerServer};
use crate::resolver::PeerDirectory;

#[derive(Clone)]
pub struct NodePoolServer {
    manager: Arc<CapacityManager>,
    peers: Arc<PeerDirectory>,
}

impl NodePoolServer {
    pub fn new(manager: Arc<CapacityManager>, peers: PeerDirectory) -> Self {
        Self {
            manager,
            peers: Arc::new(peers),
        }
    }

    /// Serve all three services over mTLS until `shutdown` flips.
    pub async fn serve(
        self,
        listener: TcpListener,
        tls: ServerTlsConfig,
        mut shutdown: watch::Receiver<bool>,
    ) -> TransportResult<()> {
        let addr = listener.local_addr()?;
        let incoming = TcpIncoming::from_listener(listener, true, None)
            .map_err(|e| TransportError::Io(std::io::Error::other(e)))?;

        info!(%addr, "npm gRPC server starting");
        Server::builder()
            .tls_config(tls)?
            .add_service(NodePoolScalerServer::new(self.clone()))
            .add_service(RunnerManagerServer::new(self.clone()))
            .add_service(PeerResolverServer::new(self))
            .serve_with_incoming_shutdown(incoming, async move {
                let _ = shutdown.changed().await;
            })
            .await?;
        info!(%addr, "npm gRPC server stopped");
        Ok(())
    }
}

#[tonic::async_trait]
impl NodePoolScaler for NodePoolServer {
    async fn advertise_capacity(
        &self,
        request: Request<proto::CapacitySnapshotList>,
    ) -> Result<Response<proto::Empty>, Status> {
        let list = CapacitySnapshotList::from(request.into_inner());
        list.validate()
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        debug!(lb = %list.lb_id, snapshots = list.snapshots.len(), "capacity advertised");
        self.manager.merge(&list).await;
        Ok(Response::new(proto::Empty {}))
    }
}

#[tonic::async_trait]
impl RunnerManager for NodePoolServer {
    async fn get_lb_group(
        &self,
        request: Request<proto::LbGroupId>,
    ) -> Result<Response<proto::LbGroupMembership>, Status> {
        let id = request.into_inner().id;
        validate_group_id(&id).map_err(|e| Status::invalid_argument(e.to_string()))?;

        let runners = self.manager.lb_group_members(&id).await;
        Ok(Response::new(
            LbGroupMembership {
                group_id: id,
                runners,
            }
            .into(),
        ))
    }
}

#[tonic::async_trait]
impl PeerResolver for NodePoolServer {
    async fn resolve_address(
        &self,
        request: Request<proto::ResolveAddressRequest>,
    ) -> Result<Response<proto::ResolveAddressResponse>, Status> {
        let peer_id = request.into_inner().peer_id;
        if peer_id.is_empty() {
            return Err(Status::invalid_argument("peer_id is empty"));
        }
        let address = self
            .peers
            .resolve(&peer_id)
            .ok_or_else(|| Status::not_found(format!("unknown peer {peer_id:?}")))?;
        Ok(Response::new(proto::ResolveAddressResponse {
            address: address.to_string(),
        }))
    }
}
