//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rcgen::{
    date_time_ymd, BasicConstraints, Certificate, CertificateParams, CertificateRevocationListParams, DnType,
    IsCa, KeyIdMethod, KeyPair, KeyUsagePurpose, RevocationReason, RevokedCertParams, SerialNumber,
};
use tempfile::TempDir;

use secure_transport::config::{ListenerConfig, TimeoutConfig, TlsConfig};
use secure_transport::net::{ClientOptions, ClientTlsOptions, Listener};

/// A throwaway CA plus leaf certificates, written as PEM into a temp dir.
pub struct TlsFixture {
    pub dir: TempDir,
    pub ca_path: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub client_cert_path: PathBuf,
    pub client_key_path: PathBuf,
    pub client_cert_der: Vec<u8>,
    ca_cert: Certificate,
    ca_key: KeyPair,
}

impl TlsFixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();

        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.distinguished_name.push(DnType::CommonName, "secure-transport test CA");
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();
        let ca_path = write(dir.path(), "ca.pem", &ca_cert.pem());

        let (server_cert, server_key) = issue(&ca_cert, &ca_key, &["localhost"], None);
        let cert_path = write(dir.path(), "server.pem", &server_cert.pem());
        let key_path = write(dir.path(), "server.key", &server_key.serialize_pem());

        let (client_cert, client_key) = issue(&ca_cert, &ca_key, &["client.test"], None);
        let client_cert_path = write(dir.path(), "client.pem", &client_cert.pem());
        let client_key_path = write(dir.path(), "client.key", &client_key.serialize_pem());

        Self {
            ca_path,
            cert_path,
            key_path,
            client_cert_path,
            client_key_path,
            client_cert_der: client_cert.der().to_vec(),
            ca_cert,
            ca_key,
            dir,
        }
    }

    /// Issue another leaf for `name`; returns (cert path, key path).
    pub fn issue_for(&self, name: &str) -> (PathBuf, PathBuf) {
        let (cert, key) = issue(&self.ca_cert, &self.ca_key, &[name], None);
        (
            write(self.dir.path(), &format!("{name}.pem"), &cert.pem()),
            write(self.dir.path(), &format!("{name}.key"), &key.serialize_pem()),
        )
    }

    /// Issue a client leaf with a fixed serial number; returns (cert path,
    /// key path).
    pub fn issue_with_serial(&self, name: &str, serial: u8) -> (PathBuf, PathBuf) {
        let (cert, key) = issue(&self.ca_cert, &self.ca_key, &[name], Some(serial));
        (
            write(self.dir.path(), &format!("{name}-{serial}.pem"), &cert.pem()),
            write(self.dir.path(), &format!("{name}-{serial}.key"), &key.serialize_pem()),
        )
    }

    /// Issue a leaf under a fresh intermediate CA. The cert file holds the
    /// leaf followed by the intermediate.
    pub fn issue_chained(&self, name: &str) -> (PathBuf, PathBuf) {
        let int_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, "secure-transport intermediate CA");
        let int_cert = params.signed_by(&int_key, &self.ca_cert, &self.ca_key).unwrap();

        let (leaf, key) = issue(&int_cert, &int_key, &[name], None);
        let chain = format!("{}{}", leaf.pem(), int_cert.pem());
        (
            write(self.dir.path(), &format!("{name}-chain.pem"), &chain),
            write(self.dir.path(), &format!("{name}-chain.key"), &key.serialize_pem()),
        )
    }

    /// Write a CRL from the CA revoking `serials`; returns its path.
    pub fn revoke(&self, serials: &[u8]) -> PathBuf {
        let params = CertificateRevocationListParams {
            this_update: date_time_ymd(2024, 1, 1),
            next_update: date_time_ymd(2099, 1, 1),
            crl_number: SerialNumber::from(vec![1]),
            issuing_distribution_point: None,
            revoked_certs: serials
                .iter()
                .map(|serial| RevokedCertParams {
                    serial_number: SerialNumber::from(vec![*serial]),
                    revocation_time: date_time_ymd(2024, 1, 1),
                    reason_code: Some(RevocationReason::KeyCompromise),
                    invalidity_date: None,
                })
                .collect(),
            key_identifier_method: KeyIdMethod::Sha256,
        };
        let crl = params.signed_by(&self.ca_cert, &self.ca_key).unwrap();
        write(self.dir.path(), "revoked.crl.pem", &crl.pem().unwrap())
    }

    pub fn server_tls(&self) -> TlsConfig {
        TlsConfig::new(
            self.cert_path.display().to_string(),
            self.key_path.display().to_string(),
        )
    }

    /// Client options presenting `identity` as the client certificate.
    pub fn client_with_identity(&self, identity: (PathBuf, PathBuf)) -> ClientOptions {
        let mut options = self.client("localhost", &[]);
        if let Some(tls) = options.tls.as_mut() {
            tls.identity = Some(identity);
        }
        options
    }

    pub fn client(&self, server_name: &str, protocols: &[&str]) -> ClientOptions {
        ClientOptions {
            tls: Some(ClientTlsOptions {
                root_cert_files: vec![self.ca_path.clone()],
                server_name: server_name.to_string(),
                next_protocols: protocols.iter().map(|p| p.to_string()).collect(),
                identity: None,
            }),
            connect_timeout: Duration::from_secs(5),
            ..ClientOptions::default()
        }
    }
}

fn issue(ca_cert: &Certificate, ca_key: &KeyPair, names: &[&str], serial: Option<u8>) -> (Certificate, KeyPair) {
    let key = KeyPair::generate().unwrap();
    let common_name = names.first().copied().unwrap_or("leaf");
    let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
    let mut params = CertificateParams::new(names).unwrap();
    params.distinguished_name.push(DnType::CommonName, common_name);
    params.serial_number = serial.map(|s| SerialNumber::from(vec![s]));
    let cert = params.signed_by(&key, ca_cert, ca_key).unwrap();
    (cert, key)
}

fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

/// Loopback listener config, optionally secured.
pub fn listener_config(tls: Option<TlsConfig>) -> ListenerConfig {
    ListenerConfig {
        bind_address: "127.0.0.1:0".into(),
        tls,
        ..ListenerConfig::default()
    }
}

pub fn quick_timeouts() -> TimeoutConfig {
    TimeoutConfig {
        socket_ms: 2_000,
        ..TimeoutConfig::default()
    }
}

pub async fn bind(tls: Option<TlsConfig>) -> Arc<Listener> {
    Arc::new(
        Listener::bind(&listener_config(tls), &quick_timeouts())
            .await
            .unwrap(),
    )
}

/// A port that was free a moment ago.
pub fn free_port() -> std::net::SocketAddr {
    let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap()
}
