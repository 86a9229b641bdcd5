//! JSON-RPC over HTTP node session
//!
//! Talks to a karlsend JSON gateway: requests are JSON-RPC 2.0 POSTs to the
//! gateway root, template notifications arrive as Server-Sent Events on
//! `notifications/block-template`.
//!
//! A stock karlsend only speaks gRPC and does not serve these routes. The
//! configured `karlsend_address` must point at a gateway that translates
//! them to the node's RPC; other transports plug in through [`NodeConnector`].

use super::{BlockDagInfo, BlockTemplate, NodeConnector, NodeInfo, NodeRpc};
use crate::error::{Error, Result};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Path of the block template notification stream
const NOTIFICATIONS_PATH: &str = "notifications/block-template";

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<R> {
    result: Option<R>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HashrateEstimate {
    network_hashes_per_second: u64,
}

/// Parse a node address, defaulting to plain HTTP when no scheme is given
pub fn node_url(address: &str) -> Result<Url> {
    let with_scheme = if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    };
    Url::parse(&with_scheme)
        .map_err(|e| Error::config(format!("invalid karlsend address {}: {}", address, e)))
}

/// Session with one karlsend gateway
pub struct HttpNodeSession {
    client: Client,
    stream_client: Client,
    endpoint: Url,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl HttpNodeSession {
    /// Create a session for `address` with a per-request `timeout`
    pub fn new(address: &str, timeout: Duration) -> Result<Self> {
        let endpoint = node_url(address)?;
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(format!("{}/{}", crate::APP_NAME, crate::APP_VERSION))
            .build()?;
        let stream_client = Client::builder()
            .connect_timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            stream_client,
            endpoint,
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        })
    }

    /// Gateway endpoint
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn call<R: DeserializeOwned>(&self, method: &str, params: Value) -> Result<R> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        debug!("calling {} on {}", method, self.endpoint);

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::upstream(format!("{} request failed", method), e))?;

        if !response.status().is_success() {
            return Err(Error::upstream(
                format!("{} request failed", method),
                response.status(),
            ));
        }

        let body = response.text().await?;
        parse_response(method, &body)
    }
}

fn parse_response<R: DeserializeOwned>(method: &str, body: &str) -> Result<R> {
    let response: RpcResponse<R> = serde_json::from_str(body)?;
    if let Some(error) = response.error {
        return Err(Error::upstream(
            format!("{} returned error {}", method, error.code),
            error.message,
        ));
    }
    response
        .result
        .ok_or_else(|| Error::upstream(format!("{} returned no result", method), "empty response"))
}

impl Drop for HttpNodeSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl NodeRpc for HttpNodeSession {
    async fn get_info(&self) -> Result<NodeInfo> {
        self.call("getInfo", json!({})).await
    }

    async fn get_block_dag_info(&self) -> Result<BlockDagInfo> {
        self.call("getBlockDagInfo", json!({})).await
    }

    async fn estimate_network_hashes_per_second(
        &self,
        start_hash: &str,
        window_size: u32,
    ) -> Result<u64> {
        let estimate: HashrateEstimate = self
            .call(
                "estimateNetworkHashesPerSecond",
                json!({ "startHash": start_hash, "windowSize": window_size }),
            )
            .await?;
        Ok(estimate.network_hashes_per_second)
    }

    async fn get_block_template(
        &self,
        pay_address: &str,
        extra_data: &str,
    ) -> Result<BlockTemplate> {
        self.call(
            "getBlockTemplate",
            json!({ "payAddress": pay_address, "extraData": extra_data }),
        )
        .await
    }

    async fn register_for_new_block_template_notifications(
        &self,
        notify: mpsc::Sender<()>,
    ) -> Result<()> {
        let url = self
            .endpoint
            .join(NOTIFICATIONS_PATH)
            .map_err(|e| Error::config(format!("invalid notification url: {}", e)))?;

        let response = self
            .stream_client
            .get(url.clone())
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| Error::upstream("failed subscribing to block template notifications", e))?;

        if !response.status().is_success() {
            return Err(Error::upstream(
                "failed subscribing to block template notifications",
                response.status(),
            ));
        }
        info!("subscribed to block template notifications at {}", url);

        let shutdown = self.shutdown.clone();
        let mut events = Box::pin(response.bytes_stream().eventsource());
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = notify.closed() => break,
                    event = events.next() => match event {
                        Some(Ok(_)) => {
                            // a pending signal already covers this template
                            let _ = notify.try_send(());
                        }
                        Some(Err(e)) => {
                            warn!("block template notification stream error: {}", e);
                            break;
                        }
                        None => {
                            warn!("block template notification stream closed by node");
                            break;
                        }
                    },
                }
            }
        });

        Ok(())
    }
}

/// Opens [`HttpNodeSession`]s, checking that the node answers before
/// handing the session out
#[derive(Debug, Clone)]
pub struct HttpNodeConnector {
    timeout: Duration,
}

impl HttpNodeConnector {
    /// Create a connector with the given per-request timeout
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for HttpNodeConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl NodeConnector for HttpNodeConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn NodeRpc>> {
        let session = HttpNodeSession::new(address, self.timeout)?;
        let info = session.get_info().await?;
        info!(
            "connected to karlsend {} at {}",
            info.server_version,
            session.endpoint()
        );
        Ok(Arc::new(session))
    }
}
