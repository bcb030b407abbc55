use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tracing::debug;

use crate::clock;
use crate::config::HeartbeatTarget;
use crate::error::MonitorError;
use crate::httpc::HttpPool;
use crate::record::{dedup_by_key, HeartbeatResult, HeartbeatStatus};

/// Worker bound for a probe wave: enough parallelism to finish well inside
/// the tick, without letting a large target list open unbounded sockets.
fn worker_bound(targets: usize) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    targets.clamp(1, cores * 4)
}

/// Probe every target once, in parallel. A failing target yields a `down`
/// result; it never blocks or fails the wave.
pub async fn probe_all(
    pool: Arc<HttpPool>,
    targets: &[HeartbeatTarget],
    probe_deadline: Duration,
) -> Vec<HeartbeatResult> {
    let targets = dedup_targets(targets);
    let bound = worker_bound(targets.len());

    stream::iter(targets)
        .map(|target| {
            let pool = pool.clone();
            async move { probe_one(&pool, &target, probe_deadline).await }
        })
        .buffer_unordered(bound)
        .collect()
        .await
}

async fn probe_one(
    pool: &HttpPool,
    target: &HeartbeatTarget,
    deadline: Duration,
) -> HeartbeatResult {
    let (status, response_ms) = match pool.get_bounded(&target.url, deadline).await {
        Ok(resp) => {
            let code = resp.status.as_u16();
            let status = if (200..=399).contains(&code) {
                HeartbeatStatus::Up
            } else {
                // 4xx/5xx within budget: the host answered but unhappily.
                HeartbeatStatus::Degraded
            };
            (status, resp.headers_ms)
        }
        // The host answered but the payload blew the size budget.
        Err(MonitorError::ResponseTooLarge { .. }) => (HeartbeatStatus::Degraded, 0),
        Err(e) => {
            debug!(url = %target.url, error = %e, "Heartbeat probe failed");
            (HeartbeatStatus::Down, 0)
        }
    };

    HeartbeatResult {
        name: target.name.clone(),
        url: target.url.clone(),
        status,
        response_ms,
        last_checked: clock::now(),
        tags: target.tags.clone(),
        region: target.region.clone(),
    }
}

fn dedup_targets(targets: &[HeartbeatTarget]) -> Vec<HeartbeatTarget> {
    dedup_by_key(targets.to_vec(), |t| &t.url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpLimits;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn target(name: &str, url: &str) -> HeartbeatTarget {
        HeartbeatTarget {
            name: name.into(),
            url: url.into(),
            tags: None,
            region: None,
        }
    }

    fn pool() -> Arc<HttpPool> {
        Arc::new(HttpPool::new(HttpLimits::default()).unwrap())
    }

    /// Serve one canned HTTP response on an ephemeral port.
    async fn one_shot_server(response: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn success_response_is_up() {
        let url = one_shot_server("HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok").await;
        let results = probe_all(pool(), &[target("a", &url)], Duration::from_secs(2)).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, HeartbeatStatus::Up);
    }

    #[tokio::test]
    async fn server_error_is_degraded() {
        let url =
            one_shot_server("HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\n\r\n").await;
        let results = probe_all(pool(), &[target("a", &url)], Duration::from_secs(2)).await;
        assert_eq!(results[0].status, HeartbeatStatus::Degraded);
    }

    #[tokio::test]
    async fn redirect_class_is_up() {
        let url = one_shot_server(
            "HTTP/1.1 302 Found\r\nlocation: http://127.0.0.1:1/\r\ncontent-length: 0\r\n\r\n",
        )
        .await;
        // The pool follows redirects; the hop to a dead port surfaces as an
        // error, so probe classification sees the failure, not the 302.
        let results = probe_all(pool(), &[target("a", &url)], Duration::from_secs(2)).await;
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn unreachable_target_is_down() {
        let results = probe_all(
            pool(),
            &[target("x", "http://127.0.0.1:1")],
            Duration::from_secs(2),
        )
        .await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, HeartbeatStatus::Down);
        assert_eq!(results[0].name, "x");
    }

    #[tokio::test]
    async fn one_failure_does_not_block_others() {
        let good = one_shot_server("HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n").await;
        let results = probe_all(
            pool(),
            &[target("bad", "http://127.0.0.1:1"), target("good", &good)],
            Duration::from_secs(2),
        )
        .await;
        assert_eq!(results.len(), 2);
        let good_result = results.iter().find(|r| r.name == "good").unwrap();
        assert_eq!(good_result.status, HeartbeatStatus::Up);
    }

    #[tokio::test]
    async fn duplicate_urls_probed_once() {
        let results = probe_all(
            pool(),
            &[
                target("a", "http://127.0.0.1:1"),
                target("b", "http://127.0.0.1:1"),
            ],
            Duration::from_secs(2),
        )
        .await;
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn worker_bound_is_clamped() {
        assert_eq!(worker_bound(0), 1);
        assert_eq!(worker_bound(2), 2);
        assert!(worker_bound(10_000) <= 4 * 1024); // sane upper bound
    }
}
