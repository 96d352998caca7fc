//! mTLS material — loading, rustls/tonic configs, dev certificate generation.
//!
//! Both ends present a certificate and verify the peer's against one
//! shared CA bundle. Development PKI is generated with rcgen; every node
//! certificate is valid for both server and client authentication so a
//! single pair serves an NPM and the routers talking to it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use tonic::transport::{Certificate, Identity, ServerTlsConfig};
use tracing::{debug, info};

use crate::error::{TransportError, TransportResult};

/// Install ring as the process-wide rustls provider. Idempotent.
pub fn install_crypto_provider() {
    // Err means a provider is already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Certificate chain, private key, and CA bundle, as PEM.
#[derive(Clone)]
pub struct TlsMaterial {
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
    ca_pem: Vec<u8>,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial").finish_non_exhaustive()
    }
}

impl TlsMaterial {
    /// Read and check all three files. Any failure is fatal to the caller.
    pub fn load(cert: &Path, key: &Path, ca: &Path) -> TransportResult<Self> {
        let material = Self::from_pem(
            read_pem(cert, "certificate")?,
            read_pem(key, "private key")?,
            read_pem(ca, "CA bundle")?,
        )?;
        info!(cert = %cert.display(), ca = %ca.display(), "loaded TLS material");
        Ok(material)
    }

    pub fn from_pem(
        cert_pem: impl Into<Vec<u8>>,
        key_pem: impl Into<Vec<u8>>,
        ca_pem: impl Into<Vec<u8>>,
    ) -> TransportResult<Self> {
        let material = Self {
            cert_pem: cert_pem.into(),
            key_pem: key_pem.into(),
            ca_pem: ca_pem.into(),
        };
        if material.certs()?.is_empty() {
            return Err(TransportError::Certificate("no certificate in chain".into()));
        }
        material.private_key()?;
        if material.roots()?.is_empty() {
            return Err(TransportError::Certificate("no certificate in CA bundle".into()));
        }
        Ok(material)
    }

    /// Client config presenting our certificate and trusting only the CA.
    pub fn client_config(&self) -> TransportResult<Arc<ClientConfig>> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_root_certificates(self.roots()?)
            .with_client_auth_cert(self.certs()?, self.private_key()?)?;
        config.alpn_protocols = vec![b"h2".to_vec()];
        Ok(Arc::new(config))
    }

    /// Server config that requires a CA-signed client certificate.
    pub fn server_tls_config(&self) -> ServerTlsConfig {
        install_crypto_provider();
        ServerTlsConfig::new()
            .identity(Identity::from_pem(&self.cert_pem, &self.key_pem))
            .client_ca_root(Certificate::from_pem(&self.ca_pem))
    }

    fn certs(&self) -> TransportResult<Vec<CertificateDer<'static>>> {
        parse_certs(&self.cert_pem, "certificate")
    }

    fn private_key(&self) -> TransportResult<PrivateKeyDer<'static>> {
        rustls_pemfile::private_key(&mut self.key_pem.as_slice())
            .map_err(|e| TransportError::Certificate(format!("failed to parse private key: {e}")))?
            .ok_or_else(|| TransportError::Certificate("no private key found".into()))
    }

    fn roots(&self) -> TransportResult<RootCertStore> {
        let mut roots = RootCertStore::empty();
        for cert in parse_certs(&self.ca_pem, "CA bundle")? {
            roots
                .add(cert)
                .map_err(|e| TransportError::Certificate(format!("failed to add CA certificate: {e}")))?;
        }
        Ok(roots)
    }
}

fn read_pem(path: &Path, what: &str) -> TransportResult<Vec<u8>> {
    let bytes = std::fs::read(path).map_err(|e| {
        TransportError::Certificate(format!("failed to read {what} {}: {e}", path.display()))
    })?;
    if bytes.is_empty() {
        return Err(TransportError::Certificate(format!(
            "{what} {} is empty",
            path.display()
        )));
    }
    Ok(bytes)
}

fn parse_certs(pem: &[u8], what: &str) -> TransportResult<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Certificate(format!("failed to parse {what}: {e}")))
}

// ── Development PKI ────────────────────────────────────────────────

/// A generated certificate and private key pair.
#[derive(Debug, Clone)]
pub struct CertKeyPair {
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// PEM-encoded private key.
    pub key_pem: String,
}

/// A CA able to sign node certificates.
pub struct CertificateAuthority {
    pub pair: CertKeyPair,
    cert: rcgen::Certificate,
    key: KeyPair,
}

/// Generate a self-signed CA.
pub fn generate_ca() -> TransportResult<CertificateAuthority> {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "Node Pool Manager");
    dn.push(DnType::CommonName, "Node Pool Manager CA");
    params.distinguished_name = dn;
    params.not_after = rcgen::date_time_ymd(2036, 1, 1);

    let key = KeyPair::generate()?;
    let cert = params.self_signed(&key)?;
    info!("generated CA certificate");

    Ok(CertificateAuthority {
        pair: CertKeyPair {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        },
        cert,
        key,
    })
}

/// Generate a CA-signed certificate usable for both server and client
/// auth. `sans` entries that parse as IPs become IP SANs, the rest DNS.
pub fn generate_node_cert(
    ca: &CertificateAuthority,
    common_name: &str,
    sans: &[String],
) -> TransportResult<CertKeyPair> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "Node Pool Manager");
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;

    for san in sans {
        if let Ok(ip) = san.parse::<std::net::IpAddr>() {
            params.subject_alt_names.push(SanType::IpAddress(ip));
        } else {
            params
                .subject_alt_names
                .push(SanType::DnsName(san.clone().try_into()?));
        }
    }
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    params.not_after = rcgen::date_time_ymd(2036, 1, 1);

    let key = KeyPair::generate()?;
    let cert = params.signed_by(&key, &ca.cert, &ca.key)?;
    info!(%common_name, sans = sans.len(), "generated node certificate");

    Ok(CertKeyPair {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}

/// Paths written by [`write_bundle`].
#[derive(Debug, Clone)]
pub struct BundlePaths {
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Write `ca.pem`, `<name>.pem`, and `<name>-key.pem` into `dir`.
pub fn write_bundle(
    dir: &Path,
    name: &str,
    ca: &CertKeyPair,
    node: &CertKeyPair,
) -> TransportResult<BundlePaths> {
    std::fs::create_dir_all(dir)?;
    let paths = BundlePaths {
        ca: dir.join("ca.pem"),
        cert: dir.join(format!("{name}.pem")),
        key: dir.join(format!("{name}-key.pem")),
    };

    std::fs::write(&paths.ca, &ca.cert_pem)?;
    std::fs::write(&paths.cert, &node.cert_pem)?;
    std::fs::write(&paths.key, &node.key_pem)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&paths.key, std::fs::Permissions::from_mode(0o600))?;
    }

    debug!(dir = %dir.display(), %name, "wrote certificate bundle");
    Ok(paths)
}
