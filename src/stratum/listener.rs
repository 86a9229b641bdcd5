//! Miner-facing transport: one task per connection

use super::context::{ConnectionContext, ConnectionId};
use super::dispatcher::MethodDispatcher;
use super::event::JsonRpcEvent;
use super::extranonce::ExtranonceAllocator;
use super::jobs::{send_job, TemplateSource};
use crate::error::{Error, Result};
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Default cap on a single inbound line
pub const DEFAULT_MAX_LINE_LENGTH: usize = 16 * 1024;

/// Listener settings
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Difficulty announced to every miner before its first job
    pub min_share_diff: f64,
    /// Longest accepted inbound line in bytes
    pub max_line_length: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            min_share_diff: 4.0,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

struct Shared {
    config: ListenerConfig,
    dispatcher: MethodDispatcher,
    extranonces: ExtranonceAllocator,
    templates: Arc<dyn TemplateSource>,
    clients: DashMap<ConnectionId, String>,
}

/// Accepts miner connections and runs each on its own task
#[derive(Clone)]
pub struct StratumListener {
    shared: Arc<Shared>,
    job_tx: broadcast::Sender<()>,
}

impl StratumListener {
    /// Create a listener dispatching through `dispatcher`
    pub fn new(
        config: ListenerConfig,
        dispatcher: MethodDispatcher,
        extranonces: ExtranonceAllocator,
        templates: Arc<dyn TemplateSource>,
    ) -> Self {
        let (job_tx, _) = broadcast::channel(16);
        Self {
            shared: Arc::new(Shared {
                config,
                dispatcher,
                extranonces,
                templates,
                clients: DashMap::new(),
            }),
            job_tx,
        }
    }

    /// Job-ready callback for the upstream bridge
    ///
    /// Never blocks: it only signals connection tasks, which fetch their own
    /// templates.
    pub fn job_notifier(&self) -> impl Fn() + Send + Sync + 'static {
        let job_tx = self.job_tx.clone();
        move || {
            let receivers = job_tx.send(()).unwrap_or(0);
            debug!("new block available, notified {} clients", receivers);
        }
    }

    /// Number of live connections
    pub fn connected_clients(&self) -> usize {
        self.shared.clients.len()
    }

    /// Bind `addr` and accept connections until `cancel` fires
    pub async fn listen(&self, addr: &str, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::config(format!("failed to bind stratum port {}: {}", addr, e)))?;
        self.accept_loop(listener, cancel).await
    }

    /// Accept connections from an already bound socket until `cancel` fires
    pub async fn accept_loop(&self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        info!("stratum listener started on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("stratum listener stopping");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("failed to set TCP_NODELAY for {}: {}", addr, e);
                        }
                        self.serve(stream, addr.to_string());
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                },
            }
        }
    }

    /// Run the protocol on an accepted transport in a new task
    pub fn serve<S>(&self, stream: S, remote_addr: String) -> tokio::task::JoinHandle<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let mut ctx = ConnectionContext::new(remote_addr, Box::new(writer));
        if let Some(extranonce) = self.shared.extranonces.next() {
            ctx.extranonce = extranonce;
        }

        let shared = Arc::clone(&self.shared);
        let job_rx = self.job_tx.subscribe();
        let span = ctx.span().clone();

        tokio::spawn(
            async move {
                shared.clients.insert(ctx.id(), ctx.remote_addr().to_string());
                info!("client connected, extranonce: {:?}", ctx.extranonce);

                handle_client(reader, &mut ctx, &shared, job_rx).await;

                shared.clients.remove(&ctx.id());
                info!("client disconnected");
            }
            .instrument(span),
        )
    }
}

async fn handle_client<R>(
    reader: R,
    ctx: &mut ConnectionContext,
    shared: &Shared,
    mut job_rx: broadcast::Receiver<()>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(
        reader,
        LinesCodec::new_with_max_length(shared.config.max_line_length),
    );
    let mut jobs_open = true;

    loop {
        tokio::select! {
            line = lines.next() => match line {
                Some(Ok(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let event = match JsonRpcEvent::from_line(&line) {
                        Ok(event) => event,
                        Err(e) => {
                            warn!("failed to parse line from client: {}", e);
                            continue;
                        }
                    };
                    if let Err(Error::SendFailure { .. }) = shared.dispatcher.dispatch(ctx, event).await {
                        break;
                    }
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    warn!("discarding line longer than {} bytes", shared.config.max_line_length);
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    debug!("read error: {}", e);
                    break;
                }
                None => break,
            },
            trigger = job_rx.recv(), if jobs_open => match trigger {
                Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    match send_job(ctx, shared.templates.as_ref(), shared.config.min_share_diff).await {
                        Ok(()) => {}
                        Err(e) if e.is_retryable() => {
                            warn!(category = e.category(), "failed sending job, will retry on next block: {}", e);
                        }
                        Err(e) => {
                            debug!(category = e.category(), "closing connection: {}", e);
                            break;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    jobs_open = false;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::BlockTemplate;
    use crate::stratum::address::Network;
    use crate::stratum::handlers::default_handlers;
    use async_trait::async_trait;
    use serde_json::Value;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    struct NoTemplates;

    #[async_trait]
    impl TemplateSource for NoTemplates {
        async fn get_block_template(&self, _: &str, _: &str) -> Result<BlockTemplate> {
            Err(Error::upstream("failed fetching new block template from karlsen", "offline"))
        }
    }

    /// Node answering with a header that cannot be hashed
    struct EmptyTemplates;

    #[async_trait]
    impl TemplateSource for EmptyTemplates {
        async fn get_block_template(&self, _: &str, _: &str) -> Result<BlockTemplate> {
            Ok(BlockTemplate::default())
        }
    }

    fn listener(extranonce_size: u8) -> StratumListener {
        listener_with(extranonce_size, Arc::new(NoTemplates))
    }

    fn listener_with(extranonce_size: u8, templates: Arc<dyn TemplateSource>) -> StratumListener {
        StratumListener::new(
            ListenerConfig::default(),
            MethodDispatcher::new(default_handlers(Network::Mainnet)),
            ExtranonceAllocator::new(extranonce_size),
            templates,
        )
    }

    #[tokio::test]
    async fn test_garbage_lines_are_skipped() {
        let listener = listener(0);
        let (client, server) = tokio::io::duplex(4096);
        let handle = listener.serve(server, "test".to_string());

        let (read, mut write) = tokio::io::split(client);
        write.write_all(b"not json\n\n").await.unwrap();
        write
            .write_all(b"{\"id\":9,\"method\":\"mining.subscribe\",\"params\":[]}\n")
            .await
            .unwrap();

        let mut lines = BufReader::new(read).lines();
        let reply: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["id"], 9);

        drop(write);
        drop(lines);
        handle.await.unwrap();
        assert_eq!(listener.connected_clients(), 0);
    }

    #[tokio::test]
    async fn test_failed_template_keeps_connection() {
        let listener = listener(2);
        let (client, server) = tokio::io::duplex(4096);
        let _handle = listener.serve(server, "test".to_string());
        let (read, mut write) = tokio::io::split(client);
        let mut lines = BufReader::new(read).lines();

        let payload = "q".repeat(61);
        let auth = format!(
            "{{\"id\":1,\"method\":\"mining.authorize\",\"params\":[\"{}.rig\"]}}\n",
            payload
        );
        write.write_all(auth.as_bytes()).await.unwrap();
        let reply: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["result"], true);
        let push: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(push["params"][0], "0001");

        (listener.job_notifier())();

        write
            .write_all(b"{\"id\":2,\"method\":\"mining.subscribe\",\"params\":[]}\n")
            .await
            .unwrap();
        let reply: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["id"], 2);
        assert_eq!(listener.connected_clients(), 1);
    }

    #[tokio::test]
    async fn test_invalid_template_keeps_connection() {
        let listener = listener_with(0, Arc::new(EmptyTemplates));
        let (client, server) = tokio::io::duplex(4096);
        let _handle = listener.serve(server, "test".to_string());
        let (read, mut write) = tokio::io::split(client);
        let mut lines = BufReader::new(read).lines();

        let auth = format!(
            "{{\"id\":1,\"method\":\"mining.authorize\",\"params\":[\"{}\"]}}\n",
            "q".repeat(61)
        );
        write.write_all(auth.as_bytes()).await.unwrap();
        let reply: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["result"], true);

        (listener.job_notifier())();

        write
            .write_all(b"{\"id\":2,\"method\":\"mining.subscribe\",\"params\":[]}\n")
            .await
            .unwrap();
        // no job precedes the reply, the template was rejected
        let reply: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["id"], 2);
        assert_eq!(listener.connected_clients(), 1);
    }
}
