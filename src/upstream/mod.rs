mod doh;
mod dot;
mod udp;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use hickory_proto::op::Message;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use doh::DohResolver;
pub use dot::DotResolver;
pub use udp::UdpResolver;

/// Per-query context handed to a resolver: a hard deadline, a cancellation
/// token and the request id for log correlation.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub request_id: Uuid,
    pub deadline: Option<Instant>,
    pub cancel: CancellationToken,
}

impl QueryContext {
    pub fn with_timeout(request_id: Uuid, budget: Duration) -> Self {
        Self {
            request_id,
            deadline: Some(Instant::now() + budget),
            cancel: CancellationToken::new(),
        }
    }

    /// Time left until the deadline, or the transport default when no
    /// deadline was set. The deadline bounds connect and read together.
    pub fn budget_or(&self, default: Duration) -> Duration {
        match self.deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => default,
        }
    }
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("invalid upstream port: {0}")]
    InvalidPort(String),
    #[error("connect {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("tls handshake with {addr}: {source}")]
    Tls {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("send query: {0}")]
    Send(#[source] std::io::Error),
    #[error("read response: {0}")]
    Receive(#[source] std::io::Error),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("http status {0}")]
    HttpStatus(u16),
    #[error("response frame length {0} out of range")]
    BadFrame(usize),
    #[error("encode query: {0}")]
    Encode(#[from] hickory_proto::error::ProtoError),
    #[error("deadline exceeded")]
    Timeout,
    #[error("canceled")]
    Canceled,
}

/// One upstream resolver: send one query, get one raw response. The reply
/// bytes are forwarded to the client verbatim, so implementations never
/// re-encode what the upstream returned.
#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn request(&self, ctx: &QueryContext, message: &Message) -> Result<Bytes, UpstreamError>;

    /// Identifying string used for journaling, e.g. `1.1.1.1:53`,
    /// `tls://dot.pub:853`, `https://doh.pub/dns-query`.
    fn identity(&self) -> &str;
}

/// 根据地址字符串选择传输 / pick the transport from the address shape.
/// `https://` means DoH, `tls://` means DoT, anything else is plain UDP.
pub fn create_resolver(addr: &str, tls_insecure: bool) -> Arc<dyn DnsResolver> {
    let lower = addr.to_ascii_lowercase();
    if lower.starts_with("https://") {
        Arc::new(DohResolver::new(addr))
    } else if lower.starts_with("tls://") {
        Arc::new(DotResolver::new(&addr["tls://".len()..], tls_insecure))
    } else {
        Arc::new(UdpResolver::new(addr))
    }
}

/// Splits `host[:port]`, applying `default_port` when none is present.
/// Bracketed IPv6 literals keep their brackets for later dialing.
pub(crate) fn split_host_port(
    addr: &str,
    default_port: u16,
) -> Result<(String, u16), UpstreamError> {
    if let Some(rest) = addr.strip_prefix('[') {
        // [v6]:port or bare [v6]
        if let Some((host, port)) = rest.split_once(']') {
            let host = format!("[{host}]");
            return match port.strip_prefix(':') {
                Some(port) => Ok((host, parse_port(port)?)),
                None => Ok((host, default_port)),
            };
        }
        return Err(UpstreamError::InvalidPort(addr.to_string()));
    }

    match addr.rsplit_once(':') {
        // more than one colon without brackets is a bare IPv6 literal
        Some((host, _)) if host.contains(':') => Ok((format!("[{addr}]"), default_port)),
        Some((host, port)) => Ok((host.to_string(), parse_port(port)?)),
        None => Ok((addr.to_string(), default_port)),
    }
}

fn parse_port(port: &str) -> Result<u16, UpstreamError> {
    match port.parse::<u16>() {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(UpstreamError::InvalidPort(port.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_identities_round_trip() {
        assert_eq!(
            create_resolver("https://doh.pub/dns-query", false).identity(),
            "https://doh.pub/dns-query"
        );
        assert_eq!(
            create_resolver("tls://dot.pub", false).identity(),
            "tls://dot.pub:853"
        );
        assert_eq!(
            create_resolver("tls://1.12.12.12:8853", false).identity(),
            "tls://1.12.12.12:8853"
        );
        assert_eq!(create_resolver("1.2.3.4", false).identity(), "1.2.3.4:53");
        assert_eq!(
            create_resolver("119.29.29.29:5353", false).identity(),
            "119.29.29.29:5353"
        );
    }

    #[test]
    fn factory_scheme_match_is_case_insensitive() {
        assert_eq!(
            create_resolver("TLS://dot.pub", false).identity(),
            "tls://dot.pub:853"
        );
        assert_eq!(
            create_resolver("HTTPS://doh.pub/dns-query", false).identity(),
            "HTTPS://doh.pub/dns-query"
        );
    }

    #[test]
    fn split_host_port_applies_default() {
        assert_eq!(
            split_host_port("1.1.1.1", 53).unwrap(),
            ("1.1.1.1".to_string(), 53)
        );
        assert_eq!(
            split_host_port("dot.pub:853", 53).unwrap(),
            ("dot.pub".to_string(), 853)
        );
        assert_eq!(
            split_host_port("::1", 53).unwrap(),
            ("[::1]".to_string(), 53)
        );
        assert_eq!(
            split_host_port("[::1]:5353", 53).unwrap(),
            ("[::1]".to_string(), 5353)
        );
    }

    #[test]
    fn split_host_port_rejects_bad_ports() {
        assert!(matches!(
            split_host_port("1.1.1.1:0", 53),
            Err(UpstreamError::InvalidPort(_))
        ));
        assert!(matches!(
            split_host_port("1.1.1.1:99999", 53),
            Err(UpstreamError::InvalidPort(_))
        ));
        assert!(matches!(
            split_host_port("1.1.1.1:abc", 53),
            Err(UpstreamError::InvalidPort(_))
        ));
    }
}
