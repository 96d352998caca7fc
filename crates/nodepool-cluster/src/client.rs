//! NPM gRPC client, used by routers and by `npmd probe`.

use std::time::Duration;

use async_trait::async_trait;
use tonic::transport::Channel;
use tracing::debug;

use nodepool_core::{CapacitySnapshotList, LbGroupMembership};

use crate::advertiser::NodePoolManager;
use crate::dial::Dialer;
use crate::error::{TransportError, TransportResult};
use crate::proto;
use crate::proto::node_pool_scaler_client::NodePoolScalerClient;
use crate::proto::peer_resolver_client::PeerResolverClient;
use crate::proto::runner_manager_client::RunnerManagerClient;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct NodePoolClient {
    scaler: NodePoolScalerClient<Channel>,
    runners: RunnerManagerClient<Channel>,
    resolver: PeerResolverClient<Channel>,
    request_timeout: Duration,
}

impl NodePoolClient {
    /// A client for the NPM at `address`. Connects on first use.
    pub fn connect(dialer: &Dialer, address: &str) -> TransportResult<Self> {
        Ok(Self::from_channel(dialer.channel(address)?))
    }

    pub fn from_channel(channel: Channel) -> Self {
        Self {
            scaler: NodePoolScalerClient::new(channel.clone()),
            runners: RunnerManagerClient::new(channel.clone()),
            resolver: PeerResolverClient::new(channel),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Deadline applied to every call.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn request<T>(&self, message: T) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        request.set_timeout(self.request_timeout);
        request
    }

    pub async fn advertise_capacity(&self, list: &CapacitySnapshotList) -> TransportResult<()> {
        let request = self.request(proto::CapacitySnapshotList::from(list));
        self.deadline(self.scaler.clone().advertise_capacity(request))
            .await?;
        debug!(lb = %list.lb_id, snapshots = list.snapshots.len(), "advertised capacity");
        Ok(())
    }

    pub async fn get_lb_group(&self, group_id: &str) -> TransportResult<LbGroupMembership> {
        let request = self.request(proto::LbGroupId {
            id: group_id.to_string(),
        });
        let response = self
            .deadline(self.runners.clone().get_lb_group(request))
            .await?;
        Ok(response.into_inner().into())
    }

    pub async fn resolve_address(&self, peer_id: &str) -> TransportResult<String> {
        let request = self.request(proto::ResolveAddressRequest {
            peer_id: peer_id.to_string(),
        });
        let response = self
            .deadline(self.resolver.clone().resolve_address(request))
            .await?;
        Ok(response.into_inner().address)
    }

    /// Bound the whole call, connecting included, by the request timeout.
    async fn deadline<F, T>(&self, call: F) -> TransportResult<T>
    where
        F: Future<Output = Result<T, tonic::Status>>,
    {
        match tokio::time::timeout(self.request_timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(TransportError::Timeout(self.request_timeout)),
        }
    }
}

#[async_trait]
impl NodePoolManager for NodePoolClient {
    async fn advertise_capacity(&self, list: &CapacitySnapshotList) -> TransportResult<()> {
        NodePoolClient::advertise_capacity(self, list).await
    }

    async fn get_runners(&self, group_id: &str) -> TransportResult<Vec<String>> {
        Ok(self.get_lb_group(group_id).await?.runners)
    }
}
