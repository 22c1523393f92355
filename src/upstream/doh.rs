use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hickory_proto::op::Message;
use tracing::debug;

use super::{DnsResolver, QueryContext, UpstreamError};
use crate::codec;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const DNS_MESSAGE_CONTENT_TYPE: &str = "application/dns-message";

/// Shared pooled client, reused across every DoH resolver.
static SHARED_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .use_rustls_tls()
        .pool_max_idle_per_host(4)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// DNS over HTTPS (RFC 8484), POST with the raw wire message as body.
pub struct DohResolver {
    url: String,
}

impl DohResolver {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }

    async fn exchange(&self, packed: Vec<u8>, budget: Duration) -> Result<Bytes, UpstreamError> {
        let response = SHARED_CLIENT
            .post(&self.url)
            .header("Content-Type", DNS_MESSAGE_CONTENT_TYPE)
            .header("Accept", DNS_MESSAGE_CONTENT_TYPE)
            .body(packed)
            .timeout(budget)
            .send()
            .await?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(UpstreamError::HttpStatus(status.as_u16()));
        }

        Ok(response.bytes().await?)
    }
}

#[async_trait]
impl DnsResolver for DohResolver {
    async fn request(&self, ctx: &QueryContext, message: &Message) -> Result<Bytes, UpstreamError> {
        if ctx.cancel.is_cancelled() {
            return Err(UpstreamError::Canceled);
        }

        let packed = codec::encode(message)?;
        let budget = ctx.budget_or(DEFAULT_TIMEOUT);

        let started = std::time::Instant::now();
        let response = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(UpstreamError::Canceled),
            result = self.exchange(packed, budget) => result?,
        };

        debug!(
            request_id = %ctx.request_id,
            upstream = %self.url,
            response_size = response.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "doh upstream answered"
        );
        Ok(response)
    }

    fn identity(&self) -> &str {
        &self.url
    }
}
