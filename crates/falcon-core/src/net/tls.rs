//! TLS transport: sans-IO rustls session for the event-driven path, plus a
//! blocking stream for segment workers.
//!
//! The scheduler never blocks, so the handshake is driven one step at a time:
//! `handshake_step` performs as much I/O as the socket allows and the caller
//! suspends on `wanted_interest()` until the socket is ready again.

use super::socket::TcpSocket;
use crate::error::EngineError;
use crate::poll::interest;
use rustls::pki_types::ServerName;
use std::io;
use std::io::{Read, Write};
use std::sync::Arc;

/// Client TLS configuration: WebPKI roots, or no verification when the user
/// disabled `verify_ssl`.
pub fn client_config(verify: bool) -> Arc<rustls::ClientConfig> {
    if verify {
        let roots = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    } else {
        let provider = rustls::crypto::CryptoProvider::get_default()
            .cloned()
            .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));
        let verifier = Arc::new(NoCertVerification(provider));
        Arc::new(
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(verifier)
                .with_no_client_auth(),
        )
    }
}

/// Certificate verifier that accepts everything (`verify_ssl = false`).
#[derive(Debug)]
struct NoCertVerification(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for NoCertVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn server_name(host: &str) -> Result<ServerName<'static>, EngineError> {
    ServerName::try_from(host.to_string())
        .map_err(|_| EngineError::InvalidInput(format!("invalid TLS server name: {host}")))
}

/// Non-blocking transport: plain TCP or TLS over it.
///
/// TLS connections are not returned to the socket pool; the session state
/// cannot be parked on a raw fd, so they are closed after use.
pub enum Transport {
    Plain(TcpSocket),
    Tls {
        sock: TcpSocket,
        conn: Box<rustls::ClientConnection>,
    },
}

impl Transport {
    /// Wrap an established TCP connection in a client TLS session.
    pub fn start_tls(sock: TcpSocket, host: &str, verify: bool) -> Result<Transport, EngineError> {
        let config = client_config(verify);
        let conn = rustls::ClientConnection::new(config, server_name(host)?)
            .map_err(|e| EngineError::Network(format!("TLS setup: {e}")))?;
        Ok(Transport::Tls {
            sock,
            conn: Box::new(conn),
        })
    }

    pub fn fd(&self) -> std::os::unix::io::RawFd {
        match self {
            Transport::Plain(s) => s.as_raw_fd(),
            Transport::Tls { sock, .. } => sock.as_raw_fd(),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls { .. })
    }

    /// Interest to wait on when the transport said it needs more I/O.
    pub fn wanted_interest(&self) -> u8 {
        match self {
            Transport::Plain(_) => interest::READ,
            Transport::Tls { conn, .. } => {
                if conn.wants_write() {
                    interest::WRITE
                } else {
                    interest::READ
                }
            }
        }
    }

    /// Advance the TLS handshake as far as the socket allows. Returns true
    /// when the handshake is complete (immediately, for plain transports).
    pub fn handshake_step(&mut self) -> io::Result<bool> {
        match self {
            Transport::Plain(_) => Ok(true),
            Transport::Tls { sock, conn } => match conn.complete_io(sock) {
                Ok(_) => Ok(!conn.is_handshaking()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
                Err(e) => Err(e),
            },
        }
    }

    /// Read decrypted bytes. `WouldBlock` is the suspension signal; `Ok(0)`
    /// means the peer closed.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.recv(buf),
            Transport::Tls { sock, conn } => loop {
                match conn.reader().read(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        match conn.read_tls(sock) {
                            Ok(0) => return Ok(0),
                            Ok(_) => {
                                conn.process_new_packets().map_err(|e| {
                                    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
                                })?;
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    Err(e) => return Err(e),
                }
            },
        }
    }

    /// Write plaintext bytes. For TLS the plaintext is buffered in the
    /// session and flushed opportunistically; callers follow with
    /// `flush_write` until it reports done.
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.send(buf),
            Transport::Tls { sock, conn } => {
                let n = conn.writer().write(buf)?;
                while conn.wants_write() {
                    match conn.write_tls(sock) {
                        Ok(_) => {}
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => return Err(e),
                    }
                }
                Ok(n)
            }
        }
    }

    /// Flush buffered TLS records. Returns true when nothing is pending.
    pub fn flush_write(&mut self) -> io::Result<bool> {
        match self {
            Transport::Plain(_) => Ok(true),
            Transport::Tls { sock, conn } => {
                while conn.wants_write() {
                    match conn.write_tls(sock) {
                        Ok(_) => {}
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                        Err(e) => return Err(e),
                    }
                }
                Ok(true)
            }
        }
    }

    /// Recover the raw socket for pooling. Only plain transports are
    /// poolable.
    pub fn into_plain_socket(self) -> Option<TcpSocket> {
        match self {
            Transport::Plain(s) => Some(s),
            Transport::Tls { .. } => None,
        }
    }
}

/// Blocking TLS stream for segment workers and other synchronous fetches.
pub fn blocking_stream(
    host: &str,
    verify: bool,
    tcp: std::net::TcpStream,
) -> Result<rustls::StreamOwned<rustls::ClientConnection, std::net::TcpStream>, EngineError> {
    let config = client_config(verify);
    let conn = rustls::ClientConnection::new(config, server_name(host)?)
        .map_err(|e| EngineError::Network(format!("TLS setup: {e}")))?;
    Ok(rustls::StreamOwned::new(conn, tcp))
}
