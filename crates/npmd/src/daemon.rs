//! Daemon assembly: config in, running subsystems out.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tonic::transport::ServerTlsConfig;
use tracing::{info, warn};

use nodepool_capacity::{CapacityManager, ConservativePolicy, Reconciler, ReconcilerConfig};
use nodepool_cluster::{NodePoolServer, PeerDirectory, TlsMaterial};
use nodepool_controlplane::ControlPlaneRegistry;
use nodepool_core::NpmConfig;

use crate::admin;

/// A fully wired NPM with its listeners bound but nothing running yet.
pub struct Daemon {
    manager: Arc<CapacityManager>,
    reconciler: Reconciler,
    server: NodePoolServer,
    tls: ServerTlsConfig,
    grpc_listener: TcpListener,
    admin_listener: Option<TcpListener>,
}

impl Daemon {
    /// Validate `config`, load TLS material, build the control plane, and
    /// bind the gRPC and admin ports. Every failure here is fatal.
    pub async fn bind(config: NpmConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let (cert, key, ca) = config.tls_paths()?;
        let material = TlsMaterial::load(cert, key, ca).context("loading TLS material")?;

        let control_plane = ControlPlaneRegistry::with_builtin()
            .build(&config.control_plane)
            .with_context(|| format!("building control plane {:?}", config.control_plane.backend))?;

        let manager = Arc::new(CapacityManager::new());
        let policy = ConservativePolicy::new(config.capacity.min_runners, config.capacity.max_runners);
        let reconciler = Reconciler::new(
            Arc::clone(&manager),
            control_plane,
            ReconcilerConfig::from_config(&config),
        )?
        .with_policy(policy);

        let peers = PeerDirectory::new(config.peers.clone());
        if peers.is_empty() {
            warn!("no peers configured, ResolveAddress will answer not found");
        } else {
            info!(peers = peers.len(), "peer directory loaded");
        }
        let server = NodePoolServer::new(Arc::clone(&manager), peers);

        let grpc_addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
        let grpc_listener = TcpListener::bind(grpc_addr)
            .await
            .with_context(|| format!("binding gRPC port {grpc_addr}"))?;

        let admin_listener = match config.server.admin_port {
            Some(port) => {
                let addr = SocketAddr::from(([0, 0, 0, 0], port));
                Some(
                    TcpListener::bind(addr)
                        .await
                        .with_context(|| format!("binding admin port {addr}"))?,
                )
            }
            None => None,
        };

        Ok(Self {
            manager,
            reconciler,
            server,
            tls: material.server_tls_config(),
            grpc_listener,
            admin_listener,
        })
    }

    pub fn grpc_addr(&self) -> std::io::Result<SocketAddr> {
        self.grpc_listener.local_addr()
    }

    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin_listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn manager(&self) -> Arc<CapacityManager> {
        Arc::clone(&self.manager)
    }

    /// Run every subsystem until `shutdown` flips.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let reconciler = tokio::spawn(self.reconciler.run(shutdown.clone()));

        let admin = self.admin_listener.map(|listener| {
            let router = admin::build_router(Arc::clone(&self.manager));
            tokio::spawn(admin::serve(listener, router, shutdown.clone()))
        });

        let grpc = self
            .server
            .serve(self.grpc_listener, self.tls, shutdown)
            .await;
        if let Err(e) = grpc {
            reconciler.abort();
            if let Some(admin) = &admin {
                admin.abort();
            }
            return Err(e).context("gRPC server failed");
        }

        reconciler.await.context("reconciler task panicked")?;
        if let Some(admin) = admin {
            admin.await.context("admin task panicked")??;
        }
        info!("npm stopped");
        Ok(())
    }
}
