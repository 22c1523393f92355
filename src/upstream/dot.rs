use std::io;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hickory_proto::op::Message;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::{split_host_port, DnsResolver, QueryContext, UpstreamError};
use crate::codec;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

static VERIFYING_CONFIG: LazyLock<Arc<ClientConfig>> = LazyLock::new(|| {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let config = ClientConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS13,
        &rustls::version::TLS12,
    ])
    .with_root_certificates(root_store)
    .with_no_client_auth();

    Arc::new(config)
});

/// Accept-anything verifier behind the explicit insecure opt-out. Signature
/// checks still run so a garbled handshake fails fast.
#[derive(Debug)]
struct NoCertificateVerification(rustls::crypto::CryptoProvider);

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn insecure_config() -> Arc<ClientConfig> {
    let provider = rustls::crypto::aws_lc_rs::default_provider();
    let _ = provider.clone().install_default();

    let config = ClientConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS13,
        &rustls::version::TLS12,
    ])
    .dangerous()
    .with_custom_certificate_verifier(Arc::new(NoCertificateVerification(provider)))
    .with_no_client_auth();

    Arc::new(config)
}

/// 按 RFC 7858 加两字节长度前缀写出报文 / write one length-prefixed frame.
pub(crate) async fn send_framed<W: AsyncWrite + Unpin>(
    stream: &mut W,
    payload: &[u8],
) -> Result<(), UpstreamError> {
    if payload.is_empty() || payload.len() > u16::MAX as usize {
        return Err(UpstreamError::BadFrame(payload.len()));
    }
    let prefix = (payload.len() as u16).to_be_bytes();
    stream.write_all(&prefix).await.map_err(UpstreamError::Send)?;
    stream.write_all(payload).await.map_err(UpstreamError::Send)?;
    Ok(())
}

/// Reads one length-prefixed frame. A zero-length prefix is a protocol
/// violation and is rejected before any payload read.
pub(crate) async fn read_framed<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<Vec<u8>, UpstreamError> {
    let mut prefix = [0u8; 2];
    stream
        .read_exact(&mut prefix)
        .await
        .map_err(UpstreamError::Receive)?;
    let length = u16::from_be_bytes(prefix) as usize;
    if length == 0 {
        return Err(UpstreamError::BadFrame(0));
    }

    let mut payload = vec![0u8; length];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(UpstreamError::Receive)?;
    Ok(payload)
}

/// DNS over TLS (RFC 7858). Certificate verification is on unless the
/// operator explicitly opts out.
pub struct DotResolver {
    server_addr: String,
    identity: String,
    connector: TlsConnector,
}

impl DotResolver {
    pub fn new(addr: &str, insecure: bool) -> Self {
        let server_addr = match split_host_port(addr, 853) {
            Ok((host, port)) => format!("{host}:{port}"),
            Err(_) => addr.to_string(),
        };
        let config = if insecure {
            insecure_config()
        } else {
            VERIFYING_CONFIG.clone()
        };
        Self {
            identity: format!("tls://{server_addr}"),
            server_addr,
            connector: TlsConnector::from(config),
        }
    }

    async fn exchange(&self, ctx: &QueryContext, packed: &[u8]) -> Result<Bytes, UpstreamError> {
        let (host, port) = split_host_port(&self.server_addr, 853)?;
        let target = format!("{host}:{port}");

        let handshake_started = std::time::Instant::now();
        let tcp = TcpStream::connect(&target)
            .await
            .map_err(|source| UpstreamError::Connect {
                addr: target.clone(),
                source,
            })?;

        // SNI carries the bare host, without IPv6 brackets
        let sni = host.trim_start_matches('[').trim_end_matches(']').to_string();
        let server_name = ServerName::try_from(sni).map_err(|err| UpstreamError::Tls {
            addr: target.clone(),
            source: io::Error::new(io::ErrorKind::InvalidInput, err),
        })?;

        let mut stream = self
            .connector
            .connect(server_name, tcp)
            .await
            .map_err(|source| UpstreamError::Tls {
                addr: target.clone(),
                source,
            })?;
        debug!(
            request_id = %ctx.request_id,
            upstream = %self.identity,
            handshake_ms = handshake_started.elapsed().as_millis() as u64,
            "tls session established"
        );

        send_framed(&mut stream, packed).await?;
        let payload = read_framed(&mut stream).await?;
        Ok(Bytes::from(payload))
    }
}

#[async_trait]
impl DnsResolver for DotResolver {
    async fn request(&self, ctx: &QueryContext, message: &Message) -> Result<Bytes, UpstreamError> {
        if ctx.cancel.is_cancelled() {
            return Err(UpstreamError::Canceled);
        }

        let packed = codec::encode(message)?;
        let budget = ctx.budget_or(DEFAULT_TIMEOUT);

        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(UpstreamError::Canceled),
            result = tokio::time::timeout(budget, self.exchange(ctx, &packed)) => {
                result.map_err(|_| UpstreamError::Timeout)?
            }
        }
    }

    fn identity(&self) -> &str {
        &self.identity
    }
}
