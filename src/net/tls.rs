//! TLS context construction and the server-side handshake.
//!
//! A [`TlsContext`] is built once per listener from [`TlsConfig`] and is
//! immutable afterwards. Accepted connections share it through an `Arc`.
//! The only mutable state behind it is the session cache, which serializes
//! its own updates.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, CertificateRevocationListDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{
    Acceptor, ClientHello, NoServerSessionStorage, ResolvesServerCert, WebPkiClientVerifier,
};
use rustls::sign::CertifiedKey;
use rustls::{
    DigitallySignedStruct, DistinguishedName, RootCertStore, ServerConfig, SignatureScheme,
    SupportedCipherSuite, SupportedProtocolVersion,
};
use tokio::net::TcpStream;
use tokio_rustls::{LazyConfigAcceptor, TlsStream};

use crate::config::{ServerCertConfig, TlsConfig, VerifyClient};
use crate::error::{Result, TransportError};
use crate::net::negotiate::{Negotiator, ProtocolList};
use crate::net::session::{SessionCache, DEFAULT_SESSION_CAPACITY};

/// Protocol-version bitmask.
///
/// The two SSL versions and TLS 1.0/1.1 are recognized so existing
/// configurations parse, but only TLS 1.2 and 1.3 are ever enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolFlags(u32);

impl ProtocolFlags {
    pub const SSL2: u32 = 0x01;
    pub const SSL3: u32 = 0x02;
    pub const TLS1: u32 = 0x04;
    pub const TLS1_1: u32 = 0x08;
    pub const TLS1_2: u32 = 0x10;
    pub const TLS1_3: u32 = 0x20;
    pub const ALL: u32 = 0x3f;

    const LEGACY: u32 = Self::SSL2 | Self::SSL3 | Self::TLS1 | Self::TLS1_1;

    pub fn all() -> Self {
        Self(Self::ALL)
    }

    pub fn from_bits(bits: u32) -> Self {
        Self(bits & Self::ALL)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, flag: u32) -> bool {
        self.0 & flag == flag
    }

    /// Parse a whitespace-separated list such as `"-all +tlsv1.2 +tlsv1.3"`.
    ///
    /// Tokens apply left to right, starting from every version enabled.
    pub fn parse(setting: &str) -> Result<Self> {
        let mut bits = Self::ALL;
        for token in setting.split_whitespace() {
            let lower = token.to_ascii_lowercase();
            let (enable, name) = match lower.split_at_checked(1) {
                Some(("+", name)) => (true, name),
                Some(("-", name)) => (false, name),
                _ => return Err(unknown_protocol(token)),
            };
            let flag = match name {
                "all" => Self::ALL,
                "sslv2" => Self::SSL2,
                "sslv3" => Self::SSL3,
                "tlsv1" => Self::TLS1,
                "tlsv1.1" => Self::TLS1_1,
                "tlsv1.2" => Self::TLS1_2,
                "tlsv1.3" => Self::TLS1_3,
                _ => return Err(unknown_protocol(token)),
            };
            if enable {
                bits |= flag;
            } else {
                bits &= !flag;
            }
        }
        Ok(Self(bits))
    }

    /// Versions the TLS stack will actually negotiate.
    pub fn supported_versions(self) -> Vec<&'static SupportedProtocolVersion> {
        let mut versions = Vec::new();
        if self.contains(Self::TLS1_3) {
            versions.push(&rustls::version::TLS13);
        }
        if self.contains(Self::TLS1_2) {
            versions.push(&rustls::version::TLS12);
        }
        versions
    }

    fn has_legacy(self) -> bool {
        self.0 & Self::LEGACY != 0
    }
}

impl Default for ProtocolFlags {
    fn default() -> Self {
        Self::all()
    }
}

fn unknown_protocol(token: &str) -> TransportError {
    TransportError::config(format!("unknown protocol value '{}'", token))
}

/// Resolve a colon, comma or whitespace separated list of suite names.
pub fn parse_cipher_suites(list: &str) -> Result<Vec<SupportedCipherSuite>> {
    let mut suites = Vec::new();
    for name in list
        .split(|c: char| c == ':' || c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
    {
        let suite = ring::ALL_CIPHER_SUITES
            .iter()
            .find(|s| format!("{:?}", s.suite()).eq_ignore_ascii_case(name))
            .ok_or_else(|| TransportError::config(format!("unknown cipher suite '{}'", name)))?;
        suites.push(*suite);
    }
    if suites.is_empty() {
        return Err(TransportError::config("cipher suite list is empty"));
    }
    Ok(suites)
}

pub(crate) fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        TransportError::config(format!("cannot read certificate file {}: {}", path.display(), e))
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| TransportError::config(format!("invalid PEM in {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(TransportError::config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

pub(crate) fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = fs::read(path).map_err(|e| {
        TransportError::config(format!("cannot read key file {}: {}", path.display(), e))
    })?;
    if pem.windows(b"ENCRYPTED".len()).any(|w| w == b"ENCRYPTED") {
        return Err(TransportError::config(format!(
            "{} holds an encrypted private key; password-protected keys are not supported",
            path.display()
        )));
    }
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| TransportError::config(format!("invalid PEM in {}: {}", path.display(), e)))?
        .ok_or_else(|| TransportError::config(format!("no private key found in {}", path.display())))
}

/// PEM files directly inside `dir`, sorted for deterministic load order.
fn pem_files(dir: &Path) -> Result<Vec<std::path::PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|e| {
        TransportError::config(format!("cannot read directory {}: {}", dir.display(), e))
    })?;
    let mut files: Vec<_> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    files.sort();
    Ok(files)
}

fn load_roots(config: &TlsConfig) -> Result<RootCertStore> {
    let mut certs = Vec::new();
    if let Some(file) = &config.ca_certificate_file {
        certs.extend(load_certs(Path::new(file))?);
    }
    if let Some(dir) = &config.ca_certificate_path {
        for path in pem_files(Path::new(dir))? {
            match load_certs(&path) {
                Ok(found) => certs.extend(found),
                Err(e) => tracing::debug!(path = %path.display(), error = %e, "Skipping non-certificate file"),
            }
        }
    }

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if ignored > 0 {
        tracing::warn!(added, ignored, "Some CA certificates could not be parsed");
    }
    Ok(roots)
}

fn load_crls(config: &TlsConfig) -> Result<Vec<CertificateRevocationListDer<'static>>> {
    let mut paths = Vec::new();
    if let Some(file) = &config.ca_revocation_file {
        paths.push(Path::new(file).to_path_buf());
    }
    if let Some(dir) = &config.ca_revocation_path {
        paths.extend(pem_files(Path::new(dir))?);
    }

    let mut crls = Vec::new();
    for path in paths {
        let file = File::open(&path).map_err(|e| {
            TransportError::config(format!("cannot read revocation list {}: {}", path.display(), e))
        })?;
        let found = rustls_pemfile::crls(&mut BufReader::new(file))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| TransportError::config(format!("invalid PEM in {}: {}", path.display(), e)))?;
        crls.extend(found);
    }
    Ok(crls)
}

fn certified_key(
    provider: &CryptoProvider,
    cert_path: &Path,
    key_path: &Path,
    chain_file: Option<&str>,
) -> Result<Arc<CertifiedKey>> {
    let mut certs = load_certs(cert_path)?;
    if let Some(chain) = chain_file {
        certs.extend(load_certs(Path::new(chain))?);
    }
    let key = provider
        .key_provider
        .load_private_key(load_key(key_path)?)
        .map_err(|e| TransportError::config(format!("unusable key {}: {}", key_path.display(), e)))?;
    Ok(Arc::new(CertifiedKey::new(certs, key)))
}

/// Picks the certificate for a ClientHello by SNI, falling back to the
/// listener's default certificate.
#[derive(Debug)]
struct SniResolver {
    default: Arc<CertifiedKey>,
    by_name: HashMap<String, Arc<CertifiedKey>>,
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let named = client_hello
            .server_name()
            .and_then(|name| self.by_name.get(&name.to_ascii_lowercase()));
        Some(Arc::clone(named.unwrap_or(&self.default)))
    }
}

/// Requests a client certificate and accepts any chain, checking only the
/// handshake signatures.
#[derive(Debug)]
struct AcceptAnyClientCert {
    provider: Arc<CryptoProvider>,
}

impl ClientCertVerifier for AcceptAnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

fn check_engine(config: &TlsConfig) -> Result<()> {
    match config.engine.as_deref() {
        None | Some("ring") | Some("default") => {}
        Some(other) => {
            return Err(TransportError::config(format!("unknown crypto engine '{}'", other)));
        }
    }
    if !config.engine_commands.is_empty() {
        return Err(TransportError::config("the built-in crypto engine accepts no engine commands"));
    }
    if config.engine_key.is_some() {
        return Err(TransportError::config("engine-held keys are not supported; configure key_path"));
    }
    Ok(())
}

/// Shared, immutable server TLS state for one listener.
pub struct TlsContext {
    negotiator: Negotiator,
    by_protocol: Vec<(Vec<u8>, Arc<ServerConfig>)>,
    no_protocol: Arc<ServerConfig>,
    verify_depth: Option<u32>,
    unclean_shutdown: bool,
    handshake_timeout: Duration,
    protocol_flags: ProtocolFlags,
}

impl TlsContext {
    /// Build and validate a context. Any unusable setting fails here.
    pub fn from_config(config: &TlsConfig) -> Result<Self> {
        check_engine(config)?;

        let protocol_flags = match &config.protocol {
            Some(setting) => ProtocolFlags::parse(setting)?,
            None => ProtocolFlags::all(),
        };
        if protocol_flags.has_legacy() && config.protocol.is_some() {
            tracing::warn!(
                protocol = ?config.protocol,
                "SSLv2, SSLv3, TLSv1 and TLSv1.1 are never negotiated"
            );
        }
        let versions = protocol_flags.supported_versions();
        if versions.is_empty() {
            return Err(TransportError::config(
                "protocol setting leaves no supported version (tlsv1.2, tlsv1.3)",
            ));
        }

        let mut provider = ring::default_provider();
        if let Some(list) = &config.cipher_suite {
            provider.cipher_suites = parse_cipher_suites(list)?;
        }
        let provider = Arc::new(provider);

        if config.compression {
            tracing::warn!("TLS compression requested but not implemented; continuing without it");
        }
        if config.password.is_some() {
            tracing::warn!("Key password configured but the key is not encrypted; ignoring it");
        }

        let default = certified_key(
            &provider,
            Path::new(&config.cert_path),
            Path::new(&config.key_path),
            config.certificate_chain_file.as_deref(),
        )?;
        let mut by_name = HashMap::new();
        for ServerCertConfig { name, cert_path, key_path } in &config.servers {
            let key = certified_key(&provider, Path::new(cert_path), Path::new(key_path), None)?;
            by_name.insert(name.to_ascii_lowercase(), key);
        }
        let resolver = Arc::new(SniResolver { default, by_name });

        let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(&versions)
            .map_err(|e| TransportError::config(e.to_string()))?;

        let builder = match config.verify_client {
            VerifyClient::None => builder.with_no_client_auth(),
            VerifyClient::OptionalNoCa => builder.with_client_cert_verifier(Arc::new(AcceptAnyClientCert {
                provider: Arc::clone(&provider),
            })),
            policy @ (VerifyClient::Optional | VerifyClient::Require) => {
                let roots = load_roots(config)?;
                if roots.is_empty() {
                    return Err(TransportError::config(
                        "verify_client requires ca_certificate_file or ca_certificate_path",
                    ));
                }
                let mut verifier =
                    WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
                        .with_crls(load_crls(config)?);
                if policy == VerifyClient::Optional {
                    verifier = verifier.allow_unauthenticated();
                }
                let verifier = verifier
                    .build()
                    .map_err(|e| TransportError::config(e.to_string()))?;
                builder.with_client_cert_verifier(verifier)
            }
        };

        let mut base = builder.with_cert_resolver(resolver);
        base.ignore_client_order = config.honor_cipher_order;
        if config.session_cache {
            base.session_storage = Arc::new(SessionCache::new(
                DEFAULT_SESSION_CAPACITY,
                Duration::from_secs(config.session_cache_timeout_secs),
            ));
        } else {
            base.session_storage = Arc::new(NoServerSessionStorage {});
            base.send_tls13_tickets = 0;
        }

        let negotiator = Negotiator::from_names(config.next_protocols.iter().map(String::as_bytes))?;
        let by_protocol = negotiator
            .preferences()
            .into_iter()
            .map(|protocol| {
                let mut cfg = base.clone();
                cfg.alpn_protocols = vec![protocol.clone()];
                (protocol, Arc::new(cfg))
            })
            .collect();

        tracing::info!(
            versions = ?versions.iter().map(|v| v.version).collect::<Vec<_>>(),
            verify_client = ?config.verify_client,
            session_cache = config.session_cache,
            next_protocols = ?negotiator.advertise(),
            virtual_servers = config.servers.len(),
            "TLS context ready"
        );

        Ok(Self {
            negotiator,
            by_protocol,
            no_protocol: Arc::new(base),
            verify_depth: config.verify_depth,
            unclean_shutdown: config.unclean_shutdown,
            handshake_timeout: Duration::from_millis(config.handshake_timeout_ms),
            protocol_flags,
        })
    }

    pub fn negotiator(&self) -> &Negotiator {
        &self.negotiator
    }

    pub fn protocol_flags(&self) -> ProtocolFlags {
        self.protocol_flags
    }

    pub fn tolerates_unclean_shutdown(&self) -> bool {
        self.unclean_shutdown
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    fn config_for(&self, selected: Option<&[u8]>) -> Arc<ServerConfig> {
        selected
            .and_then(|p| self.by_protocol.iter().find(|(name, _)| name == p))
            .map(|(_, cfg)| Arc::clone(cfg))
            .unwrap_or_else(|| Arc::clone(&self.no_protocol))
    }

    /// Run the server handshake on an accepted socket.
    ///
    /// The ClientHello is read first so the protocol can be chosen with
    /// [`Negotiator::select_for_client`] before the rest of the handshake
    /// runs. The client's order decides among protocols both sides know.
    pub async fn handshake(&self, tcp: TcpStream) -> Result<TlsStream<TcpStream>> {
        let handshake = async {
            let start = LazyConfigAcceptor::new(Acceptor::default(), tcp)
                .await
                .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?;

            let selected = {
                let hello = start.client_hello();
                hello.alpn().and_then(|client_list| {
                    let client_list = ProtocolList::encode(client_list).ok()?;
                    self.negotiator.select_for_client(&client_list)
                })
            };
            if self.negotiator.is_enabled() && selected.is_none() {
                tracing::debug!("No common application protocol; continuing without one");
            }

            let stream = start
                .into_stream(self.config_for(selected.as_deref()))
                .await
                .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?;
            Ok::<_, TransportError>(stream)
        };

        let stream = tokio::time::timeout(self.handshake_timeout, handshake)
            .await
            .map_err(|_| TransportError::HandshakeFailed("handshake timed out".into()))??;

        if let Some(depth) = self.verify_depth {
            let chain_len = stream.get_ref().1.peer_certificates().map_or(0, |c| c.len());
            if chain_len > depth as usize + 1 {
                return Err(TransportError::HandshakeFailed(format!(
                    "client chain of {} certificates exceeds verify depth {}",
                    chain_len, depth
                )));
            }
        }

        Ok(TlsStream::Server(stream))
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("protocol_flags", &self.protocol_flags)
            .field("next_protocols", self.negotiator.advertise())
            .field("verify_depth", &self.verify_depth)
            .field("unclean_shutdown", &self.unclean_shutdown)
            .finish()
    }
}
