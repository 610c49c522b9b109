//! HTTP transport routed through a SOCKS proxy.

use async_trait::async_trait;
use reqwest::redirect::Policy;
use reqwest::{Client, Proxy};
use std::time::Instant;
use tracing::debug;

use super::{ProbeError, ProbeRequest, ProbeResponse, Transport};

/// Transport sending every request through one proxy.
///
/// Use a `socks5h://` proxy so onion names are resolved by Tor rather than
/// the local resolver. Redirects are not followed and connections are not
/// kept alive between requests.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(proxy_url: &str) -> Result<Self, ProbeError> {
        let proxy = Proxy::all(proxy_url)
            .map_err(|e| ProbeError::Config(format!("invalid proxy {}: {}", proxy_url, e)))?;

        let client = Client::builder()
            .proxy(proxy)
            .redirect(Policy::none())
            .pool_max_idle_per_host(0)
            // Onion services commonly present self-signed certificates.
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| ProbeError::Config(e.to_string()))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: ProbeRequest) -> Result<ProbeResponse, ProbeError> {
        let mut builder = self.client.get(request.url.clone()).timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(*name, value.as_str());
        }

        let start = Instant::now();
        let mut response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout(request.timeout)
            } else {
                ProbeError::Network(e.to_string())
            }
        })?;
        let latency = start.elapsed();
        let status = response.status().as_u16();

        // Only the head of the body matters for challenge detection.
        let mut body = Vec::with_capacity(request.body_limit.min(64 * 1024));
        while body.len() < request.body_limit {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    let take = (request.body_limit - body.len()).min(chunk.len());
                    body.extend_from_slice(&chunk[..take]);
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("Body read from {} cut short: {}", request.url, e);
                    break;
                }
            }
        }

        Ok(ProbeResponse {
            status,
            latency,
            body,
        })
    }
}
