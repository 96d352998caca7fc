//! nodepool-cluster — the wire side of the node pool manager.
//!
//! Provides the gRPC protocol between routers and the NPM, the mutual-TLS
//! transport both ends use, the NPM service and client, and the
//! router-side capacity advertiser.
//!
//! # Architecture
//!
//! ```text
//! Router
//!   └── CapacityAdvertiser
//!       ├── assign/release → bounded queue (drop on full)
//!       └── tick → AdvertiseCapacity (full aggregate, fire-and-forget)
//!                     │  mTLS, Dialer with backoff
//!                     ▼
//! NPM
//!   └── NodePoolServer (gRPC)
//!       ├── AdvertiseCapacity() → CapacityManager::merge
//!       ├── GetLBGroup()        → active runner addresses
//!       └── ResolveAddress()    → PeerDirectory
//! ```

pub mod advertiser;
pub mod client;
pub mod convert;
pub mod dial;
pub mod error;
pub mod resolver;
pub mod server;
pub mod tls;

/// Generated protobuf types and gRPC service stubs.
pub mod proto {
    tonic::include_proto!("nodepool");
}

pub use advertiser::{AdvertiserConfig, CapacityAdvertiser, NodePoolManager};
pub use client::NodePoolClient;
pub use dial::{Backoff, Dialer};
pub use error::{TransportError, TransportResult};
pub use resolver::PeerDirectory;
pub use server::NodePoolServer;
pub use tls::TlsMaterial;
