//! Synthetic traffic gate.
//!
//! Sends HTTP requests through a test routing endpoint and checks that
//! the responses carry the signature of the new version, typically a
//! header such as `x-version: v2`.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::gate::{GateContext, GateOutcome, VerificationGate};

/// Result of a single synthetic request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    /// A response arrived: its status code and the inspected header value.
    Response { status: u16, header: Option<String> },
    /// The request could not be completed (connection error or timeout).
    Failed,
}

/// Issue `GET http://{address}{path}` and capture `header` from the response.
pub async fn probe_header(address: &str, path: &str, header: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "synthetic probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "synthetic probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "rollgate-gate/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "synthetic probe request invalid");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) => ProbeResult::Response {
                status: resp.status().as_u16(),
                header: resp
                    .headers()
                    .get(header)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string),
            },
            Err(e) => {
                debug!(error = %e, %uri, "synthetic probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    match result {
        Ok(probe) => probe,
        Err(_) => {
            debug!(%uri, "synthetic probe timed out");
            ProbeResult::Failed
        }
    }
}

/// Passes when `samples` consecutive responses are 2xx and carry
/// `header: expected`.
#[derive(Debug, Clone)]
pub struct SyntheticTrafficGate {
    pub address: String,
    pub path: String,
    pub header: String,
    pub expected: String,
    pub samples: u32,
    pub timeout: Duration,
}

#[async_trait]
impl VerificationGate for SyntheticTrafficGate {
    fn kind(&self) -> &'static str {
        "synthetic_traffic"
    }

    async fn evaluate(&self, target: &str, ctx: &GateContext) -> GateOutcome {
        for sample in 0..self.samples.max(1) {
            match probe_header(&self.address, &self.path, &self.header, self.timeout).await {
                // The test endpoint may not be routable yet.
                ProbeResult::Failed => return GateOutcome::Pending,
                ProbeResult::Response { status, .. } if !(200..300).contains(&status) => {
                    warn!(plan = %ctx.plan_id, %target, status, "synthetic request rejected");
                    return GateOutcome::Fail(format!(
                        "{} returned status {status} on sample {}",
                        self.address,
                        sample + 1
                    ));
                }
                ProbeResult::Response { header, .. } => {
                    if header.as_deref() != Some(self.expected.as_str()) {
                        warn!(plan = %ctx.plan_id, %target, ?header, "synthetic signature mismatch");
                        return GateOutcome::Fail(format!(
                            "{} was {:?} on sample {}, expected {:?}",
                            self.header,
                            header,
                            sample + 1,
                            self.expected
                        ));
                    }
                }
            }
        }
        GateOutcome::Pass
    }
}
