use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hickory_proto::op::Message;
use tokio::net::UdpSocket;
use tracing::debug;

use super::{split_host_port, DnsResolver, QueryContext, UpstreamError};
use crate::codec;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
// Plain DNS over UDP caps responses at 512 bytes without EDNS(0).
const MAX_RESPONSE_SIZE: usize = 512;

/// Plain DNS over UDP, one datagram each way.
pub struct UdpResolver {
    server_addr: String,
}

impl UdpResolver {
    pub fn new(addr: &str) -> Self {
        // normalize the identity up front so journaled rows always carry a
        // port; a malformed port keeps the raw string and fails at request time
        let server_addr = match split_host_port(addr, 53) {
            Ok((host, port)) => format!("{host}:{port}"),
            Err(_) => addr.to_string(),
        };
        Self { server_addr }
    }

    async fn exchange(&self, packed: &[u8]) -> Result<Bytes, UpstreamError> {
        let (host, port) = split_host_port(&self.server_addr, 53)?;
        let target = format!("{host}:{port}");

        let bind_addr = if target.starts_with('[') {
            "[::]:0"
        } else {
            "0.0.0.0:0"
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|source| UpstreamError::Connect {
                addr: target.clone(),
                source,
            })?;
        socket
            .connect(&target)
            .await
            .map_err(|source| UpstreamError::Connect {
                addr: target.clone(),
                source,
            })?;

        socket.send(packed).await.map_err(UpstreamError::Send)?;

        let mut buf = [0u8; MAX_RESPONSE_SIZE];
        let n = socket.recv(&mut buf).await.map_err(UpstreamError::Receive)?;
        Ok(Bytes::copy_from_slice(&buf[..n]))
    }
}

#[async_trait]
impl DnsResolver for UdpResolver {
    async fn request(&self, ctx: &QueryContext, message: &Message) -> Result<Bytes, UpstreamError> {
        if ctx.cancel.is_cancelled() {
            return Err(UpstreamError::Canceled);
        }

        let packed = codec::encode(message)?;
        let budget = ctx.budget_or(DEFAULT_TIMEOUT);

        let started = std::time::Instant::now();
        let response = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(UpstreamError::Canceled),
            result = tokio::time::timeout(budget, self.exchange(&packed)) => {
                result.map_err(|_| UpstreamError::Timeout)??
            }
        };

        debug!(
            request_id = %ctx.request_id,
            upstream = %self.server_addr,
            response_size = response.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "udp upstream answered"
        );
        Ok(response)
    }

    fn identity(&self) -> &str {
        &self.server_addr
    }
}
