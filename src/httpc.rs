use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use reqwest::{StatusCode, Url};
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};

use crate::config::HttpLimits;
use crate::error::MonitorError;

/// The single shared outbound HTTP pool. Every probe and peer scrape goes
/// through here — callers never construct ad-hoc clients, so the process-wide
/// connection and body-size limits actually hold.
///
/// Idle-connection caps are enforced by the underlying client; the per-host
/// in-flight cap is a semaphore in front of it. The TLS handshake budget is
/// folded into the connect timeout, which is where the client applies it.
#[derive(Debug, Clone)]
pub struct HttpPool {
    client: reqwest::Client,
    limits: HttpLimits,
    per_host: Arc<RwLock<HashMap<String, Arc<Semaphore>>>>,
}

/// Response with the body fully read under the size cap.
#[derive(Debug)]
pub struct BoundedResponse {
    pub status: StatusCode,
    /// Milliseconds from request start to response headers.
    pub headers_ms: u64,
    pub body: Bytes,
}

impl BoundedResponse {
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, MonitorError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| MonitorError::Permanent(format!("invalid JSON response: {e}")))
    }
}

impl HttpPool {
    pub fn new(limits: HttpLimits) -> Result<Self, MonitorError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("hostbeat/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(limits.connect_timeout + limits.tls_handshake_timeout)
            .timeout(limits.request_timeout)
            .pool_max_idle_per_host(limits.max_idle_conns_per_host)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| MonitorError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            limits,
            per_host: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// GET with a cooperative deadline; the body is read under the size cap.
    pub async fn get_bounded(
        &self,
        url: &str,
        deadline: Duration,
    ) -> Result<BoundedResponse, MonitorError> {
        let url = parse_url(url)?;
        let _permit = self.host_permit(&url).await;
        let request = self.client.get(url);
        self.execute_bounded(request, deadline).await
    }

    /// POST a JSON document with a cooperative deadline.
    pub async fn post_json_bounded(
        &self,
        url: &str,
        body: &serde_json::Value,
        deadline: Duration,
    ) -> Result<BoundedResponse, MonitorError> {
        let url = parse_url(url)?;
        let _permit = self.host_permit(&url).await;
        let request = self.client.post(url).json(body);
        self.execute_bounded(request, deadline).await
    }

    async fn execute_bounded(
        &self,
        request: reqwest::RequestBuilder,
        deadline: Duration,
    ) -> Result<BoundedResponse, MonitorError> {
        let start = Instant::now();
        let fut = async {
            let mut response = request.send().await.map_err(MonitorError::from)?;
            let headers_ms = start.elapsed().as_millis() as u64;
            let status = response.status();

            let cap = self.limits.max_response_bytes;
            let mut body = BytesMut::new();
            while let Some(chunk) = response.chunk().await.map_err(MonitorError::from)? {
                if body.len() + chunk.len() > cap {
                    return Err(MonitorError::ResponseTooLarge { limit: cap });
                }
                body.extend_from_slice(&chunk);
            }

            Ok(BoundedResponse {
                status,
                headers_ms,
                body: body.freeze(),
            })
        };

        match tokio::time::timeout(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(MonitorError::Transient(format!(
                "request deadline of {deadline:?} exceeded"
            ))),
        }
    }

    /// Acquire the per-host concurrency slot, creating the semaphore on
    /// first contact with a host.
    async fn host_permit(&self, url: &Url) -> OwnedSemaphorePermit {
        let host = url.host_str().unwrap_or("").to_string();

        if let Some(sem) = self.per_host.read().await.get(&host).cloned() {
            return sem.acquire_owned().await.expect("semaphore never closed");
        }

        let sem = {
            let mut map = self.per_host.write().await;
            map.entry(host)
                .or_insert_with(|| Arc::new(Semaphore::new(self.limits.max_conns_per_host)))
                .clone()
        };
        sem.acquire_owned().await.expect("semaphore never closed")
    }
}

fn parse_url(url: &str) -> Result<Url, MonitorError> {
    Url::parse(url).map_err(|e| MonitorError::validation(format!("invalid URL {url:?}: {e}")))
}
