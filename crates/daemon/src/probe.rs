//! Node liveness probing

use async_trait::async_trait;
use divisora_common::{Node, NodeState};
use std::time::{Duration, Instant};
use tracing::debug;

/// Result of one probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub state: NodeState,
    /// Set whenever the agent answered, whatever the status code
    pub response_time: Option<Duration>,
}

impl ProbeOutcome {
    pub fn response_time_ms(&self) -> Option<u64> {
        self.response_time.map(|rtt| rtt.as_millis() as u64)
    }
}

/// Classifies a node as up, down, or in error
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, node: &Node) -> ProbeOutcome;
}

/// Plain `GET /` against the node agent.
///
/// 200 is `Up`, any other status is `Error`, and no answer within the
/// timeout is `Down`.
#[derive(Clone)]
pub struct HttpProber {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpProber {
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("divisorad/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, node: &Node) -> ProbeOutcome {
        let url = format!("{}/", node.base_url());
        let start = Instant::now();

        match self.client.get(&url).timeout(self.timeout).send().await {
            Ok(res) if res.status() == reqwest::StatusCode::OK => ProbeOutcome {
                state: NodeState::Up,
                response_time: Some(start.elapsed()),
            },
            Ok(res) => {
                debug!("Probe of {} ({}) returned {}", node.meta.name, url, res.status());
                ProbeOutcome {
                    state: NodeState::Error,
                    response_time: Some(start.elapsed()),
                }
            }
            Err(e) => {
                debug!("Probe of {} ({}) failed: {}", node.meta.name, url, e);
                ProbeOutcome {
                    state: NodeState::Down,
                    response_time: None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{closed_port, node_at, serve};
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;

    fn prober() -> HttpProber {
        HttpProber::new(Duration::from_millis(200)).unwrap()
    }

    #[tokio::test]
    async fn test_ok_is_up() {
        let port = serve(Router::new().route("/", get(|| async { "cubicle agent" }))).await;
        let outcome = prober().probe(&node_at(port)).await;
        assert_eq!(outcome.state, NodeState::Up);
        assert!(outcome.response_time.is_some());
    }

    #[tokio::test]
    async fn test_server_error_is_error() {
        let router = Router::new().route("/", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }));
        let port = serve(router).await;
        assert_eq!(prober().probe(&node_at(port)).await.state, NodeState::Error);
    }

    #[tokio::test]
    async fn test_other_success_status_is_error() {
        let router = Router::new().route("/", get(|| async { StatusCode::NO_CONTENT }));
        let port = serve(router).await;
        assert_eq!(prober().probe(&node_at(port)).await.state, NodeState::Error);
    }

    #[tokio::test]
    async fn test_refused_is_down() {
        let outcome = prober().probe(&node_at(closed_port().await)).await;
        assert_eq!(outcome.state, NodeState::Down);
        assert_eq!(outcome.response_time_ms(), None);
    }

    #[tokio::test]
    async fn test_timeout_is_down() {
        let router = Router::new().route(
            "/",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                "late"
            }),
        );
        let port = serve(router).await;
        assert_eq!(prober().probe(&node_at(port)).await.state, NodeState::Down);
    }
}
