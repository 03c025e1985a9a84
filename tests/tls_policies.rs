//! Client verification, revocation, session reuse and shutdown policies.

use std::sync::Arc;
use std::time::Duration;

use secure_transport::config::{TlsConfig, VerifyClient};
use secure_transport::net::{ClientOptions, Connection, Connector, Listener};
use secure_transport::TransportError;

mod common;
use common::TlsFixture;

const WAIT: Option<Duration> = Some(Duration::from_secs(2));

/// Dial once and run the server side of the handshake by hand, so a
/// rejected client surfaces as the server's error instead of a retry.
async fn handshake(
    listener: &Arc<Listener>,
    options: &ClientOptions,
) -> (Result<Connection, TransportError>, Result<Connection, TransportError>) {
    let addr = listener.local_addr();
    let server = async {
        let mut conn = listener.accept_pending().await?;
        conn.init().await?;
        Ok::<_, TransportError>(conn)
    };
    tokio::join!(server, secure_transport::net::connect(addr, options))
}

fn verifying(fx: &TlsFixture, policy: VerifyClient) -> TlsConfig {
    let mut tls = fx.server_tls();
    tls.verify_client = policy;
    tls.ca_certificate_file = Some(fx.ca_path.display().to_string());
    tls
}

#[tokio::test]
async fn optional_verification_admits_anonymous_client() {
    let fx = TlsFixture::new();
    let listener = common::bind(Some(verifying(&fx, VerifyClient::Optional))).await;

    let (server, client) = handshake(&listener, &fx.client("localhost", &[])).await;
    let server = server.unwrap();
    client.unwrap();
    assert_eq!(server.peer_certificate().unwrap(), None);

    let identity = (fx.client_cert_path.clone(), fx.client_key_path.clone());
    let (server, _client) = handshake(&listener, &fx.client_with_identity(identity)).await;
    let cert = server.unwrap().peer_certificate().unwrap().unwrap();
    assert_eq!(cert.as_ref(), fx.client_cert_der.as_slice());
}

#[tokio::test]
async fn optional_no_ca_accepts_unknown_issuer() {
    let fx = TlsFixture::new();
    let stranger = TlsFixture::new();
    let mut tls = fx.server_tls();
    tls.verify_client = VerifyClient::OptionalNoCa;
    let listener = common::bind(Some(tls)).await;

    let identity = (stranger.client_cert_path.clone(), stranger.client_key_path.clone());
    let (server, client) = handshake(&listener, &fx.client_with_identity(identity)).await;
    client.unwrap();
    let cert = server.unwrap().peer_certificate().unwrap().unwrap();
    assert_eq!(cert.as_ref(), stranger.client_cert_der.as_slice());

    // presenting nothing is also fine
    let (server, _client) = handshake(&listener, &fx.client("localhost", &[])).await;
    assert_eq!(server.unwrap().peer_certificate().unwrap(), None);
}

#[tokio::test]
async fn required_verification_rejects_unknown_issuer() {
    let fx = TlsFixture::new();
    let stranger = TlsFixture::new();
    let listener = common::bind(Some(verifying(&fx, VerifyClient::Require))).await;

    let identity = (stranger.client_cert_path.clone(), stranger.client_key_path.clone());
    let (server, _client) = handshake(&listener, &fx.client_with_identity(identity)).await;
    assert!(matches!(server, Err(TransportError::HandshakeFailed(_))));

    let (server, _client) = handshake(&listener, &fx.client("localhost", &[])).await;
    assert!(matches!(server, Err(TransportError::HandshakeFailed(_))));
}

#[tokio::test]
async fn chain_longer_than_verify_depth_is_rejected() {
    let fx = TlsFixture::new();
    let chained = fx.issue_chained("client.test");

    let mut tls = verifying(&fx, VerifyClient::Require);
    tls.verify_depth = Some(0);
    let listener = common::bind(Some(tls)).await;
    let (server, _client) = handshake(&listener, &fx.client_with_identity(chained.clone())).await;
    assert!(matches!(server, Err(TransportError::HandshakeFailed(_))));

    // a direct leaf fits depth 0
    let direct = (fx.client_cert_path.clone(), fx.client_key_path.clone());
    let (server, _client) = handshake(&listener, &fx.client_with_identity(direct)).await;
    assert!(server.is_ok());

    let mut tls = verifying(&fx, VerifyClient::Require);
    tls.verify_depth = Some(1);
    let listener = common::bind(Some(tls)).await;
    let (server, _client) = handshake(&listener, &fx.client_with_identity(chained)).await;
    assert!(server.unwrap().peer_certificate().unwrap().is_some());
}

#[tokio::test]
async fn revoked_client_certificate_is_rejected() {
    let fx = TlsFixture::new();
    let good = fx.issue_with_serial("client.test", 41);
    let revoked = fx.issue_with_serial("client.test", 42);
    let crl = fx.revoke(&[42]);

    let mut tls = verifying(&fx, VerifyClient::Require);
    tls.ca_revocation_file = Some(crl.display().to_string());
    let listener = common::bind(Some(tls)).await;

    let (server, _client) = handshake(&listener, &fx.client_with_identity(revoked)).await;
    assert!(matches!(server, Err(TransportError::HandshakeFailed(_))));

    let (server, _client) = handshake(&listener, &fx.client_with_identity(good)).await;
    assert!(server.unwrap().peer_certificate().unwrap().is_some());
}

/// Connect twice through one connector, reading a byte each time so the
/// client picks up the server's session tickets.
async fn connect_twice(listener: &Arc<Listener>, connector: &Connector) -> [(bool, bool); 2] {
    let mut seen = [(false, false); 2];
    for slot in &mut seen {
        let server = tokio::spawn({
            let listener = Arc::clone(listener);
            async move {
                let mut conn = listener.accept().await.unwrap();
                conn.write(b"!").await.unwrap();
                conn
            }
        });
        let mut client = connector.connect(listener.local_addr()).await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf, WAIT).await.unwrap(), 1);
        let mut server = server.await.unwrap();
        *slot = (server.is_resumed(), client.is_resumed());
        client.close().await.unwrap();
        server.close().await.unwrap();
    }
    seen
}

#[tokio::test]
async fn session_cache_resumes_second_connection() {
    let fx = TlsFixture::new();
    let listener = common::bind(Some(fx.server_tls())).await;
    let connector = Connector::new(&fx.client("localhost", &[])).unwrap();

    let [first, second] = connect_twice(&listener, &connector).await;
    assert_eq!(first, (false, false));
    assert_eq!(second, (true, true));
}

#[tokio::test]
async fn disabled_session_cache_never_resumes() {
    let fx = TlsFixture::new();
    let mut tls = fx.server_tls();
    tls.session_cache = false;
    let listener = common::bind(Some(tls)).await;
    let connector = Connector::new(&fx.client("localhost", &[])).unwrap();

    let [first, second] = connect_twice(&listener, &connector).await;
    assert_eq!(first, (false, false));
    assert_eq!(second, (false, false));
}

/// Drop the client without close_notify and return what the server's next
/// read reports.
async fn read_after_abrupt_close(unclean_shutdown: bool) -> (Result<usize, TransportError>, Connection) {
    let fx = TlsFixture::new();
    let mut tls = fx.server_tls();
    tls.unclean_shutdown = unclean_shutdown;
    let listener = common::bind(Some(tls)).await;

    let server = tokio::spawn({
        let listener = listener.clone();
        async move {
            let mut conn = listener.accept().await.unwrap();
            conn.write(b"!").await.unwrap();
            conn
        }
    });
    let mut client = secure_transport::net::connect(listener.local_addr(), &fx.client("localhost", &[]))
        .await
        .unwrap();
    let mut server = server.await.unwrap();

    // drain everything the server sent so closing the socket sends FIN, not RST
    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf, WAIT).await.unwrap(), 1);
    drop(client);
    let mut buf = [0u8; 16];
    let result = server.read(&mut buf, WAIT).await;
    (result, server)
}

#[tokio::test]
async fn unclean_shutdown_reads_as_end_of_stream() {
    let (result, server) = read_after_abrupt_close(true).await;
    assert_eq!(result.unwrap(), 0);
    assert!(server.is_half_closed());
}

#[tokio::test]
async fn missing_close_notify_is_disconnect_by_default() {
    let (result, server) = read_after_abrupt_close(false).await;
    assert!(matches!(result, Err(TransportError::Disconnect)));
    assert!(!server.is_half_closed());
}
