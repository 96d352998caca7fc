//! Outbound dialing — TCP, then our own TLS handshake, with backoff.
//!
//! tonic is handed a plain `http://` endpoint and a custom connector that
//! does the TLS handshake itself. That keeps dial failures and handshake
//! failures apart in the logs. Reconnects after a failure wait out the
//! standard gRPC connection backoff.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tracing::{debug, warn};

use crate::error::{TransportError, TransportResult};
use crate::tls::TlsMaterial;

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// gRPC connection backoff: exponential growth with jitter, capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub base: Duration,
    pub multiplier: f64,
    /// Fraction of the delay randomly added or removed.
    pub jitter: f64,
    pub max: Duration,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 1.6, 0.2, Duration::from_secs(120))
    }
}

impl Backoff {
    pub fn new(base: Duration, multiplier: f64, jitter: f64, max: Duration) -> Self {
        Self {
            base,
            multiplier,
            jitter,
            max,
            current: base,
        }
    }

    /// Delay before the next attempt, growing the backoff for the one after.
    pub fn next_delay(&mut self) -> Duration {
        let spread = self.jitter * (2.0 * unit_random() - 1.0);
        let delay = self.current.mul_f64((1.0 + spread).max(0.0));
        self.current = self.current.mul_f64(self.multiplier).min(self.max);
        delay.min(self.max)
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Uniform in `[0, 1)`; 0.5 (no jitter) if the OS RNG is unavailable.
fn unit_random() -> f64 {
    let mut buf = [0u8; 8];
    if getrandom::getrandom(&mut buf).is_err() {
        return 0.5;
    }
    (u64::from_le_bytes(buf) >> 11) as f64 / (1u64 << 53) as f64
}

#[derive(Debug)]
struct DialState {
    backoff: Backoff,
    wait: Duration,
}

/// Builds channels that authenticate with our certificate.
#[derive(Clone)]
pub struct Dialer {
    connector: TlsConnector,
    dial_timeout: Duration,
    server_name: Option<String>,
    backoff: Backoff,
}

impl Dialer {
    pub fn new(material: &TlsMaterial) -> TransportResult<Self> {
        Ok(Self {
            connector: TlsConnector::from(material.client_config()?),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            server_name: None,
            backoff: Backoff::default(),
        })
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Name to verify the server certificate against, instead of the
    /// host part of the dialed address.
    pub fn with_server_name(mut self, name: Option<String>) -> Self {
        self.server_name = name;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// A lazily connected channel to `address` (`host:port`).
    pub fn channel(&self, address: &str) -> TransportResult<Channel> {
        let host = split_host(address)?;
        let name = self.server_name.clone().unwrap_or(host);
        let server_name = ServerName::try_from(name.clone())
            .map_err(|e| TransportError::Address {
                address: name,
                reason: e.to_string(),
            })?;

        let endpoint = Endpoint::from_shared(format!("http://{address}"))
            .map_err(|e| TransportError::Address {
                address: address.to_string(),
                reason: e.to_string(),
            })?
            .connect_timeout(self.dial_timeout);

        let state = Arc::new(Mutex::new(DialState {
            backoff: self.backoff.clone(),
            wait: Duration::ZERO,
        }));
        let connector = self.connector.clone();
        let timeout = self.dial_timeout;
        let address = address.to_string();

        Ok(endpoint.connect_with_connector_lazy(tower::service_fn(move |_: Uri| {
            let connector = connector.clone();
            let server_name = server_name.clone();
            let state = Arc::clone(&state);
            let address = address.clone();
            async move {
                connect(&address, &connector, server_name, timeout, &state)
                    .await
                    .map(TokioIo::new)
            }
        })))
    }
}

async fn connect(
    address: &str,
    connector: &TlsConnector,
    server_name: ServerName<'static>,
    timeout: Duration,
    state: &Mutex<DialState>,
) -> io::Result<TlsStream<TcpStream>> {
    let wait = state.lock().await.wait;
    if !wait.is_zero() {
        debug!(grpc_addr = %address, ?wait, "backing off before reconnect");
        tokio::time::sleep(wait).await;
    }

    let result = handshake(address, connector, server_name, timeout).await;

    let mut state = state.lock().await;
    match &result {
        Ok(_) => {
            state.backoff.reset();
            state.wait = Duration::ZERO;
        }
        Err(_) => state.wait = state.backoff.next_delay(),
    }
    result
}

async fn handshake(
    address: &str,
    connector: &TlsConnector,
    server_name: ServerName<'static>,
    timeout: Duration,
) -> io::Result<TlsStream<TcpStream>> {
    let tcp = match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(tcp)) => tcp,
        Ok(Err(e)) => {
            warn!(grpc_addr = %address, error = %e, "failed to dial grpc connection");
            return Err(e);
        }
        Err(_) => {
            warn!(grpc_addr = %address, ?timeout, "timed out dialing grpc connection");
            return Err(io::Error::new(io::ErrorKind::TimedOut, "dial timed out"));
        }
    };
    tcp.set_nodelay(true)?;

    match tokio::time::timeout(timeout, connector.connect(server_name, tcp)).await {
        Ok(Ok(tls)) => {
            debug!(grpc_addr = %address, "grpc TLS handshake complete");
            Ok(tls)
        }
        Ok(Err(e)) => {
            warn!(grpc_addr = %address, error = %e, "failed grpc TLS handshake");
            Err(e)
        }
        Err(_) => {
            warn!(grpc_addr = %address, ?timeout, "timed out during grpc TLS handshake");
            Err(io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out"))
        }
    }
}

/// Host part of `host:port` or `[v6]:port`.
fn split_host(address: &str) -> TransportResult<String> {
    let bad = |reason: &str| TransportError::Address {
        address: address.to_string(),
        reason: reason.to_string(),
    };
    let (host, port) = address.rsplit_once(':').ok_or_else(|| bad("missing port"))?;
    port.parse::<u16>().map_err(|_| bad("invalid port"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(bad("missing host"));
    }
    Ok(host.to_string())
}
