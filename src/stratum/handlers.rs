//! Handshake handlers: subscribe, authorize and the default submit slot

use super::address::{self, Network};
use super::context::ConnectionContext;
use super::dispatcher::{EventHandler, HandlerMap};
use super::event::{JsonRpcEvent, JsonRpcResponse, StratumMethod, ERROR_UNAUTHORIZED_WORKER};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Protocol version acknowledged on subscribe
pub const STRATUM_PROTOCOL: &str = "EthereumStratum/1.0.0";

/// Build the handler table with the handshake handlers and the submit stub
///
/// The owning process may replace any entry, typically `mining.submit`,
/// before handing the map to [`super::MethodDispatcher::new`].
pub fn default_handlers(network: Network) -> HandlerMap {
    let mut handlers = HandlerMap::new();
    handlers.insert(
        StratumMethod::Subscribe.as_str().to_string(),
        Arc::new(SubscribeHandler) as Arc<dyn EventHandler>,
    );
    handlers.insert(
        StratumMethod::Authorize.as_str().to_string(),
        Arc::new(AuthorizeHandler::new(network)),
    );
    handlers.insert(
        StratumMethod::Submit.as_str().to_string(),
        Arc::new(SubmitHandler),
    );
    handlers
}

/// `mining.subscribe`
#[derive(Debug, Default)]
pub struct SubscribeHandler;

#[async_trait]
impl EventHandler for SubscribeHandler {
    async fn handle(&self, ctx: &mut ConnectionContext, event: JsonRpcEvent) -> Result<()> {
        let remote_app = event.string_param(0).map(str::to_string);
        ctx.reply(JsonRpcResponse::success(&event, json!([true, STRATUM_PROTOCOL])))
            .await?;

        ctx.mark_subscribed(remote_app.as_deref());
        debug!("client subscribed, app: {}", ctx.remote_app());
        Ok(())
    }
}

/// `mining.authorize`
#[derive(Debug)]
pub struct AuthorizeHandler {
    network: Network,
}

impl AuthorizeHandler {
    /// Create a handler validating addresses for `network`
    pub fn new(network: Network) -> Self {
        Self { network }
    }
}

#[async_trait]
impl EventHandler for AuthorizeHandler {
    async fn handle(&self, ctx: &mut ConnectionContext, event: JsonRpcEvent) -> Result<()> {
        let login = match event.string_param(0) {
            Some(login) if !login.is_empty() => login,
            _ => {
                return Err(Error::malformed_event(format!(
                    "malformed event from miner, expected param[0] to be address string: {:?}",
                    event.params.first()
                )))
            }
        };

        let (raw_address, worker) = login.split_once('.').unwrap_or((login, ""));
        let wallet = address::normalize(raw_address, self.network)?;

        ctx.mark_authorized(wallet, worker.to_string(), self.network);
        ctx.reply(JsonRpcResponse::success(&event, Value::Bool(true)))
            .await?;

        if !ctx.extranonce.is_empty() {
            send_extranonce(ctx).await;
        }

        info!("client authorized, address: {}", ctx.wallet_addr());
        Ok(())
    }
}

/// Push the connection's extranonce; a failed push is logged and dropped
pub async fn send_extranonce(ctx: &mut ConnectionContext) {
    let params = vec![Value::String(ctx.extranonce.clone())];
    if let Err(e) = ctx
        .push(StratumMethod::SetExtranonce.as_str(), params)
        .await
    {
        warn!("failed to set extranonce: {}", e);
    } else {
        debug!("successfully set extranonce to {}", ctx.extranonce);
    }
}

/// Reject `event` unless the connection has authorized
///
/// Replies with stratum error 24 and returns [`Error::Unauthorized`] so share
/// handlers can bail out with `?`.
pub async fn require_authorized(ctx: &mut ConnectionContext, event: &JsonRpcEvent) -> Result<()> {
    if ctx.is_authorized() {
        return Ok(());
    }

    ctx.reply(JsonRpcResponse::failure(
        event,
        ERROR_UNAUTHORIZED_WORKER,
        "Unauthorized worker",
    ))
    .await?;
    Err(Error::unauthorized(format!(
        "{} before mining.authorize",
        event.method
    )))
}

/// Placeholder `mining.submit` that only logs authorized submissions
#[derive(Debug, Default)]
pub struct SubmitHandler;

#[async_trait]
impl EventHandler for SubmitHandler {
    async fn handle(&self, ctx: &mut ConnectionContext, event: JsonRpcEvent) -> Result<()> {
        require_authorized(ctx, &event).await?;
        info!("work submission: {:?}", event.params);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stratum::context::HandshakeState;
    use assert_matches::assert_matches;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, Lines};

    const PAYLOAD: &str = "qz0s9wh2kx5pqqxw8jvqvkuyq0n3kx9p7y6ux5jklmy4x2qp4m5a7crgrghz6";

    fn context() -> (ConnectionContext, Lines<BufReader<DuplexStream>>) {
        let (client, server) = tokio::io::duplex(4096);
        let ctx = ConnectionContext::new("10.0.0.2:5000", Box::new(server));
        (ctx, BufReader::new(client).lines())
    }

    async fn next_json(lines: &mut Lines<BufReader<DuplexStream>>) -> Value {
        let line = lines.next_line().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_subscribe_records_remote_app() {
        let (mut ctx, mut lines) = context();
        let event = JsonRpcEvent::new(1, "mining.subscribe", vec![json!("BzMiner-v19.1")]);

        SubscribeHandler.handle(&mut ctx, event).await.unwrap();

        let reply = next_json(&mut lines).await;
        assert_eq!(reply["id"], 1);
        assert_eq!(reply["result"], json!([true, "EthereumStratum/1.0.0"]));
        assert_eq!(ctx.remote_app(), "BzMiner-v19.1");
        assert_eq!(ctx.state(), HandshakeState::Subscribed);
    }

    #[tokio::test]
    async fn test_subscribe_without_app_still_acknowledges() {
        let (mut ctx, mut lines) = context();
        let event = JsonRpcEvent::new(2, "mining.subscribe", vec![json!(42)]);

        SubscribeHandler.handle(&mut ctx, event).await.unwrap();

        let reply = next_json(&mut lines).await;
        assert_eq!(reply["result"][0], true);
        assert_eq!(ctx.remote_app(), "");
    }

    #[tokio::test]
    async fn test_authorize_splits_worker() {
        let (mut ctx, mut lines) = context();
        let handler = AuthorizeHandler::new(Network::Mainnet);
        let event = JsonRpcEvent::new(3, "mining.authorize", vec![json!(format!("{}.worker7", PAYLOAD))]);

        handler.handle(&mut ctx, event).await.unwrap();

        assert_eq!(ctx.wallet_addr(), format!("karlsen:{}", PAYLOAD));
        assert_eq!(ctx.worker_name(), "worker7");
        assert!(ctx.is_authorized());
        let reply = next_json(&mut lines).await;
        assert_eq!(reply["result"], true);
    }

    #[tokio::test]
    async fn test_authorize_pushes_assigned_extranonce() {
        let (mut ctx, mut lines) = context();
        ctx.extranonce = "00ab".to_string();
        let handler = AuthorizeHandler::new(Network::Mainnet);
        let event = JsonRpcEvent::new(4, "mining.authorize", vec![json!(PAYLOAD)]);

        handler.handle(&mut ctx, event).await.unwrap();

        let reply = next_json(&mut lines).await;
        assert_eq!(reply["id"], 4);
        let push = next_json(&mut lines).await;
        assert_eq!(push["method"], "set_extranonce");
        assert_eq!(push["params"], json!(["00ab"]));
        assert_eq!(ctx.worker_name(), "");
    }

    #[tokio::test]
    async fn test_failed_extranonce_push_keeps_authorization() {
        let writer = tokio_test::io::Builder::new()
            .write(b"{\"id\":8,\"result\":true,\"error\":null}\n")
            .write_error(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))
            .build();
        let mut ctx = ConnectionContext::new("10.0.0.2:5000", Box::new(writer));
        ctx.extranonce = "01".to_string();
        let handler = AuthorizeHandler::new(Network::Mainnet);
        let event = JsonRpcEvent::new(8, "mining.authorize", vec![json!(format!("{}.rig", PAYLOAD))]);

        handler.handle(&mut ctx, event).await.unwrap();

        assert_eq!(ctx.state(), HandshakeState::Authorized);
        assert_eq!(ctx.worker_name(), "rig");
    }

    #[tokio::test]
    async fn test_authorize_malformed_leaves_state() {
        let (mut ctx, _lines) = context();
        let handler = AuthorizeHandler::new(Network::Mainnet);

        for params in [vec![], vec![json!(17)], vec![json!("")]] {
            let event = JsonRpcEvent::new(5, "mining.authorize", params);
            assert_matches!(
                handler.handle(&mut ctx, event).await,
                Err(Error::MalformedEvent { .. })
            );
        }
        assert_eq!(ctx.state(), HandshakeState::New);
        assert_eq!(ctx.wallet_addr(), "");
    }

    #[tokio::test]
    async fn test_authorize_invalid_wallet_does_not_transition() {
        let (mut ctx, _lines) = context();
        let handler = AuthorizeHandler::new(Network::Mainnet);
        let event = JsonRpcEvent::new(6, "mining.authorize", vec![json!("addr123.worker7")]);

        assert_matches!(
            handler.handle(&mut ctx, event).await,
            Err(Error::InvalidWallet { .. })
        );
        assert!(!ctx.is_authorized());
        assert_eq!(ctx.worker_name(), "");
    }

    #[tokio::test]
    async fn test_submit_requires_authorization() {
        let (mut ctx, mut lines) = context();
        let event = JsonRpcEvent::new(7, "mining.submit", vec![json!("rig"), json!("1"), json!("00")]);

        assert_matches!(
            SubmitHandler.handle(&mut ctx, event).await,
            Err(Error::Unauthorized { .. })
        );
        let reply = next_json(&mut lines).await;
        assert_eq!(reply["error"][0], 24);

        ctx.mark_authorized(format!("karlsen:{}", PAYLOAD), String::new(), Network::Mainnet);
        let event = JsonRpcEvent::new(8, "mining.submit", vec![]);
        SubmitHandler.handle(&mut ctx, event).await.unwrap();
    }

    #[test]
    fn test_default_handlers_cover_handshake() {
        let handlers = default_handlers(Network::Testnet);
        for method in ["mining.subscribe", "mining.authorize", "mining.submit"] {
            assert!(handlers.contains_key(method), "missing {}", method);
        }
    }
}
