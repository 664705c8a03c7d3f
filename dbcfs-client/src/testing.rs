//! In-process server side of the protocol, for tests.

use dbcfs_protocol::bytesafe::encode_byte;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

pub(crate) const LEGACY_GREETING: &str = "DB/C FS 2.1";
pub(crate) const MODERN_GREETING: &str = "DB/C FS 16.1";

/// CA that signed the test server certificate. The leaf is issued for
/// `localhost` and `127.0.0.1`.
pub(crate) const CA_CERT_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/ca.pem");

const SERVER_CERT: &str = include_str!("../testdata/server.pem");
const SERVER_KEY: &str = include_str!("../testdata/server-key.pem");

/// A request as the server sees it.
#[derive(Debug, Clone)]
pub(crate) struct Request {
    pub id: [u8; 8],
    pub connection_id: [u8; 8],
    pub target: [u8; 8],
    pub function: String,
    pub payload: Vec<u8>,
}

async fn read_logical<S: AsyncRead + Unpin>(
    sock: &mut S,
    buf: &mut [u8],
    byte_safe: bool,
) -> io::Result<()> {
    if !byte_safe {
        sock.read_exact(buf).await?;
        return Ok(());
    }
    for slot in buf.iter_mut() {
        let lead = sock.read_u8().await?;
        *slot = match lead {
            0x00..=0x7F => lead,
            0xC0..=0xDF => {
                let cont = sock.read_u8().await?;
                ((lead - 0xC0) << 6) | (cont - 0x80)
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("bad lead byte {:#04x}", other),
                ))
            }
        };
    }
    Ok(())
}

/// Reads one request frame. Malformed headers are an error.
pub(crate) async fn read_request<S: AsyncRead + Unpin>(
    sock: &mut S,
    byte_safe: bool,
) -> io::Result<Request> {
    let mut id = [0u8; 8];
    read_logical(sock, &mut id, byte_safe).await?;
    read_request_after(sock, id, byte_safe).await
}

/// Reads the rest of a request whose first 8 bytes were already consumed.
pub(crate) async fn read_request_after<S: AsyncRead + Unpin>(
    sock: &mut S,
    id: [u8; 8],
    byte_safe: bool,
) -> io::Result<Request> {
    let mut rest = [0u8; 32];
    read_logical(sock, &mut rest, byte_safe).await?;

    let length_field = &rest[24..32];
    let digits = String::from_utf8_lossy(length_field);
    let len: usize = digits
        .trim()
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed length field"))?;

    let mut payload = vec![0u8; len];
    read_logical(sock, &mut payload, byte_safe).await?;

    let mut connection_id = [0u8; 8];
    connection_id.copy_from_slice(&rest[..8]);
    let mut target = [0u8; 8];
    target.copy_from_slice(&rest[8..16]);
    Ok(Request {
        id,
        connection_id,
        target,
        function: String::from_utf8_lossy(&rest[16..24]).trim().to_string(),
        payload,
    })
}

/// Writes a reply frame echoing `id`.
pub(crate) async fn write_reply<S: AsyncWrite + Unpin>(
    sock: &mut S,
    id: &[u8; 8],
    status: &str,
    payload: &[u8],
    byte_safe: bool,
) -> io::Result<()> {
    let mut plain = Vec::with_capacity(24 + payload.len());
    plain.extend_from_slice(id);
    plain.extend_from_slice(format!("{:<8}", status).as_bytes());
    plain.extend_from_slice(format!("{:08}", payload.len()).as_bytes());
    plain.extend_from_slice(payload);

    let wire = if byte_safe {
        let mut wire = Vec::with_capacity(plain.len() * 2);
        for &b in &plain {
            encode_byte(b, &mut wire);
        }
        wire
    } else {
        plain
    };
    sock.write_all(&wire).await?;
    sock.flush().await
}

/// Accepts one probe connection and answers `HELLO` with `greeting`.
pub(crate) async fn serve_hello(listener: &TcpListener, greeting: &str) {
    let (mut sock, _) = listener.accept().await.unwrap();
    answer_hello(&mut sock, greeting).await;
}

/// Same as [`serve_hello`] over TLS.
pub(crate) async fn serve_hello_tls(listener: &TcpListener, acceptor: &TlsAcceptor, greeting: &str) {
    let (sock, _) = listener.accept().await.unwrap();
    let mut sock = acceptor.accept(sock).await.unwrap();
    answer_hello(&mut sock, greeting).await;
}

async fn answer_hello<S: AsyncRead + AsyncWrite + Unpin>(sock: &mut S, greeting: &str) {
    let request = read_request(sock, false).await.unwrap();
    assert_eq!(request.function, "HELLO");
    assert!(request.payload.is_empty());
    write_reply(sock, &request.id, "OK", greeting.as_bytes(), false)
        .await
        .unwrap();
}

/// Server side TLS: TLS 1.2 only, presenting the test certificate.
pub(crate) fn tls_acceptor() -> TlsAcceptor {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut SERVER_CERT.as_bytes())
        .collect::<Result<_, _>>()
        .unwrap();
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut SERVER_KEY.as_bytes())
        .unwrap()
        .unwrap();
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS12])
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

/// Asserts the server half of a TLS session negotiated TLS 1.2 with an
/// ECDHE_RSA AES-GCM suite.
pub(crate) fn assert_tls12_ecdhe_rsa(session: &rustls::ServerConnection) {
    assert_eq!(
        session.protocol_version(),
        Some(rustls::ProtocolVersion::TLSv1_2)
    );
    let suite = session.negotiated_cipher_suite().unwrap().suite();
    assert!(
        matches!(
            suite,
            rustls::CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256
                | rustls::CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384
        ),
        "unexpected suite {:?}",
        suite
    );
}
