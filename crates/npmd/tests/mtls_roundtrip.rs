//! End-to-end tests over real sockets.
//!
//! Boots a full daemon (gRPC over mTLS, reconciler with the static control
//! plane, admin API) from certificates generated into a temp directory,
//! then talks to it the way a router does.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;

use nodepool_cluster::tls::{
    BundlePaths, CertificateAuthority, generate_ca, generate_node_cert, install_crypto_provider,
    write_bundle,
};
use nodepool_cluster::{Dialer, NodePoolClient, TlsMaterial};
use nodepool_core::{CapacitySnapshot, CapacitySnapshotList, NpmConfig};
use npmd::daemon::Daemon;

fn bundle(dir: &Path, ca: &CertificateAuthority) -> BundlePaths {
    let node = generate_node_cert(ca, "npm", &["127.0.0.1".into(), "localhost".into()]).unwrap();
    write_bundle(dir, "npm", &ca.pair, &node).unwrap()
}

fn config(paths: &BundlePaths) -> NpmConfig {
    let mut config = NpmConfig::default();
    config.server.port = 0;
    config.server.admin_port = Some(0);
    config.tls.cert = Some(paths.cert.clone());
    config.tls.key = Some(paths.key.clone());
    config.tls.ca = Some(paths.ca.clone());
    config.capacity.poll_interval_ms = 50;
    config.control_plane.backend = "static".into();
    config.control_plane.runner_addresses = vec!["10.1.0.1:9190".into(), "10.1.0.2:9190".into()];
    config.control_plane.provision_delay_ms = 0;
    config.peers = BTreeMap::from([("npm-2".to_string(), "10.0.0.2:9120".to_string())]);
    config
}

fn client(material: &TlsMaterial, port: u16) -> NodePoolClient {
    let dialer = Dialer::new(material)
        .unwrap()
        .with_dial_timeout(Duration::from_secs(2));
    NodePoolClient::connect(&dialer, &format!("127.0.0.1:{port}"))
        .unwrap()
        .with_request_timeout(Duration::from_secs(2))
}

#[tokio::test]
async fn router_demand_is_served_by_provisioned_runners() {
    install_crypto_provider();
    let dir = tempfile::tempdir().unwrap();
    let ca = generate_ca().unwrap();
    let paths = bundle(dir.path(), &ca);

    let daemon = Daemon::bind(config(&paths)).await.unwrap();
    let port = daemon.grpc_addr().unwrap().port();
    let admin_port = daemon.admin_addr().unwrap().port();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(daemon.run(shutdown_rx));

    let material = TlsMaterial::load(&paths.cert, &paths.key, &paths.ca).unwrap();
    let npm = client(&material, port);

    // Two runners' worth of demand.
    let list = CapacitySnapshotList::new("lb-a", vec![CapacitySnapshot::new("web", 8192)]);
    let mut runners = Vec::new();
    for _ in 0..100 {
        npm.advertise_capacity(&list).await.unwrap();
        runners = npm.get_lb_group("web").await.unwrap().runners;
        if runners.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    runners.sort();
    assert_eq!(runners, vec!["10.1.0.1:9190", "10.1.0.2:9190"]);

    assert_eq!(npm.resolve_address("npm-2").await.unwrap(), "10.0.0.2:9120");
    assert!(npm.resolve_address("npm-9").await.is_err());

    // The admin API sees the same group.
    let mut sock = tokio::net::TcpStream::connect(("127.0.0.1", admin_port)).await.unwrap();
    sock.write_all(b"GET /api/v1/lbgroups/web HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    sock.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("\"total_wanted\":8192"));

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn client_from_foreign_ca_is_rejected() {
    install_crypto_provider();
    let dir = tempfile::tempdir().unwrap();
    let ca = generate_ca().unwrap();
    let paths = bundle(dir.path(), &ca);

    let daemon = Daemon::bind(config(&paths)).await.unwrap();
    let port = daemon.grpc_addr().unwrap().port();
    let manager = daemon.manager();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(daemon.run(shutdown_rx));

    // Trusts the NPM, but presents a certificate the NPM never issued.
    let rogue_ca = generate_ca().unwrap();
    let rogue = generate_node_cert(&rogue_ca, "rogue", &["127.0.0.1".into()]).unwrap();
    let material = TlsMaterial::from_pem(rogue.cert_pem, rogue.key_pem, ca.pair.cert_pem.clone()).unwrap();
    let npm = client(&material, port);

    let list = CapacitySnapshotList::new("lb-rogue", vec![CapacitySnapshot::new("web", 4096)]);
    assert!(npm.advertise_capacity(&list).await.is_err());
    assert!(manager.groups().await.is_empty());

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn missing_tls_material_is_fatal() {
    install_crypto_provider();
    let dir = tempfile::tempdir().unwrap();
    let ca = generate_ca().unwrap();
    let paths = bundle(dir.path(), &ca);

    let mut config = config(&paths);
    config.tls.key = Some(dir.path().join("absent-key.pem"));
    let err = Daemon::bind(config).await.err().unwrap();
    assert!(format!("{err:#}").contains("absent-key.pem"));

    let mut config = NpmConfig::default();
    config.server.port = 0;
    let err = Daemon::bind(config).await.err().unwrap();
    assert!(err.to_string().contains("tls.cert"));
}

#[tokio::test]
async fn unknown_backend_is_fatal() {
    install_crypto_provider();
    let dir = tempfile::tempdir().unwrap();
    let ca = generate_ca().unwrap();
    let paths = bundle(dir.path(), &ca);

    let mut config = config(&paths);
    config.control_plane.backend = "cloud-9".into();
    assert!(Daemon::bind(config).await.is_err());
}
