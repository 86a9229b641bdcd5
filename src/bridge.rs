//! Upstream side of the bridge: node session, sync monitor and job triggers
//!
//! The bridge owns a single node session shared by its loops. When a sync
//! check fails the session is recreated through the [`NodeConnector`] and
//! swapped in whole, so callers always see either the old or the new one.

use crate::error::{Error, Result};
use crate::node::{BlockTemplate, NodeConnector, NodeRpc};
use crate::stats::StatsRecorder;
use crate::stratum::jobs::TemplateSource;
use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};

/// Pause between sync checks while the node catches up
pub const SYNC_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Interval of the network stats sampler
pub const STATS_INTERVAL: Duration = Duration::from_secs(30);

/// Blocks the hashrate estimate is averaged over
const HASHRATE_WINDOW: u32 = 1000;

/// Settings of the upstream bridge
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Node address
    pub address: String,
    /// Fallback polling interval for new templates
    pub block_wait_time: Duration,
    /// Pause after a failed reconnect
    pub reconnect_backoff: Duration,
    /// Upper bound of random delay added to the reconnect backoff
    pub reconnect_jitter: Duration,
}

impl BridgeSettings {
    /// Settings with the default 5s backoff and no jitter
    pub fn new(address: impl Into<String>, block_wait_time: Duration) -> Self {
        Self {
            address: address.into(),
            block_wait_time,
            reconnect_backoff: SYNC_POLL_INTERVAL,
            reconnect_jitter: Duration::ZERO,
        }
    }
}

/// Session with the node plus the loops built on it
pub struct UpstreamBridge {
    settings: BridgeSettings,
    session: RwLock<Arc<dyn NodeRpc>>,
    connected: AtomicBool,
    connector: Arc<dyn NodeConnector>,
    stats: Arc<dyn StatsRecorder>,
    notify_tx: mpsc::Sender<()>,
    notify_rx: Mutex<Option<mpsc::Receiver<()>>>,
    span: Span,
}

impl UpstreamBridge {
    /// Open the initial session through `connector`
    pub async fn connect(
        settings: BridgeSettings,
        connector: Arc<dyn NodeConnector>,
        stats: Arc<dyn StatsRecorder>,
    ) -> Result<Arc<Self>> {
        let session = connector.connect(&settings.address).await?;
        Ok(Self::with_session(settings, session, connector, stats))
    }

    /// Build the bridge around an already open session
    pub fn with_session(
        settings: BridgeSettings,
        session: Arc<dyn NodeRpc>,
        connector: Arc<dyn NodeConnector>,
        stats: Arc<dyn StatsRecorder>,
    ) -> Arc<Self> {
        let (notify_tx, notify_rx) = mpsc::channel(1);
        let span = tracing::info_span!(
            "bridge",
            component = %format!("karlsenapi:{}", settings.address)
        );

        Arc::new(Self {
            settings,
            session: RwLock::new(session),
            connected: AtomicBool::new(true),
            connector,
            stats,
            notify_tx,
            notify_rx: Mutex::new(Some(notify_rx)),
            span,
        })
    }

    /// Current node session
    pub fn session(&self) -> Arc<dyn NodeRpc> {
        Arc::clone(&self.session.read())
    }

    /// Whether the last connection attempt succeeded
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Wait until the node reports itself synced
    ///
    /// Returns early only when the node cannot be queried.
    pub async fn wait_for_sync(&self, verbose: bool) -> Result<()> {
        if verbose {
            info!("checking karlsend sync state");
        }
        loop {
            match self.check_sync().await {
                Ok(()) => break,
                Err(Error::NotSynced { .. }) => {
                    warn!("Karlsen is not synced, waiting for sync before starting bridge");
                    sleep(SYNC_POLL_INTERVAL).await;
                }
                Err(e) => return Err(e),
            }
        }
        if verbose {
            info!("karlsend synced, starting server");
        }
        Ok(())
    }

    async fn check_sync(&self) -> Result<()> {
        let info = self.session().get_info().await.map_err(|e| {
            Error::upstream(
                format!("error fetching server info from karlsend @ {}", self.settings.address),
                e,
            )
        })?;
        if info.is_synced {
            Ok(())
        } else {
            Err(Error::not_synced(&self.settings.address))
        }
    }

    /// Replace the session with a freshly connected one
    pub async fn reconnect(&self) -> Result<()> {
        info!("reconnecting to karlsend at {}", self.settings.address);
        let session = match self.connector.connect(&self.settings.address).await {
            Ok(session) => session,
            Err(e) => {
                self.connected.store(false, Ordering::Relaxed);
                return Err(e);
            }
        };

        *self.session.write() = Arc::clone(&session);
        self.connected.store(true, Ordering::Relaxed);

        if let Err(e) = session
            .register_for_new_block_template_notifications(self.notify_tx.clone())
            .await
        {
            error!("failed to re-register for block notifications from karlsen: {}", e);
        }
        Ok(())
    }

    /// Start the template listener and the stats sampler
    ///
    /// `on_block` is called on the listener's task for every push
    /// notification and every `block_wait_time` without one; it must return
    /// quickly and tolerate redundant calls.
    pub async fn start<F>(self: &Arc<Self>, cancel: CancellationToken, on_block: F) -> Vec<JoinHandle<()>>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let span = self.span.clone();
        async {
            tokio::select! {
                _ = cancel.cancelled() => {}
                synced = self.wait_for_sync(true) => {
                    if let Err(e) = synced {
                        error!("initial sync check failed: {}", e);
                    }
                }
            }

            if let Err(e) = self
                .session()
                .register_for_new_block_template_notifications(self.notify_tx.clone())
                .await
            {
                error!("fatal: failed to register for block notifications from karlsen: {}", e);
            }
        }
        .instrument(span.clone())
        .await;

        let mut handles = Vec::with_capacity(2);
        if let Some(notify_rx) = self.notify_rx.lock().await.take() {
            let bridge = Arc::clone(self);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(
                async move { bridge.listen_for_templates(cancel, notify_rx, on_block).await }
                    .instrument(span.clone()),
            ));
        } else {
            warn!(parent: &span, "block template listener already running");
        }

        let bridge = Arc::clone(self);
        handles.push(tokio::spawn(
            async move { bridge.sample_stats(cancel).await }.instrument(span),
        ));
        handles
    }

    async fn listen_for_templates<F>(
        &self,
        cancel: CancellationToken,
        mut notify_rx: mpsc::Receiver<()>,
        on_block: F,
    ) where
        F: Fn(),
    {
        let wait = self.settings.block_wait_time;
        let mut ticker = interval_at(Instant::now() + wait, wait);
        // ticks missed while waiting for sync collapse into one refresh
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let synced = tokio::select! {
                _ = cancel.cancelled() => break,
                synced = self.wait_for_sync(false) => synced,
            };
            if let Err(e) = synced {
                error!("error checking karlsend sync state, attempting reconnect: {}", e);
                if let Err(e) = self.reconnect().await {
                    error!("error reconnecting to karlsend, waiting before retry: {}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(self.reconnect_delay()) => {}
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(()) = notify_rx.recv() => {
                    debug!("new block template notification");
                    on_block();
                    ticker.reset();
                }
                _ = ticker.tick() => {
                    on_block();
                }
            }
        }
        warn!("block template listener shutting down");
    }

    fn reconnect_delay(&self) -> Duration {
        let jitter = self.settings.reconnect_jitter.as_millis() as u64;
        if jitter == 0 {
            return self.settings.reconnect_backoff;
        }
        let extra = rand::rng().random_range(0..=jitter);
        self.settings.reconnect_backoff + Duration::from_millis(extra)
    }

    async fn sample_stats(&self, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + STATS_INTERVAL, STATS_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sample_network_stats().await {
                        warn!("failed to sample network stats: {}", e);
                    }
                }
            }
        }
        debug!("stats sampler shutting down");
    }

    async fn sample_network_stats(&self) -> Result<()> {
        let session = self.session();
        let dag_info = session
            .get_block_dag_info()
            .await
            .map_err(|e| Error::upstream("failed to get network info", e))?;

        let Some(tip) = dag_info.tip_hashes.first() else {
            warn!("node reported no tip hashes, skipping stats sample");
            return Ok(());
        };
        let hashrate = session
            .estimate_network_hashes_per_second(tip, HASHRATE_WINDOW)
            .await
            .map_err(|e| Error::upstream("failed to get network hash rate", e))?;

        self.stats
            .record_network_stats(hashrate as f64, dag_info.block_count, dag_info.difficulty);
        Ok(())
    }

    /// Request a template for `wallet_addr`, tagged with the miner's software
    pub async fn get_block_template(&self, wallet_addr: &str, remote_app: &str) -> Result<BlockTemplate> {
        let extra_data = format!(
            "'{}' via {}_v{}",
            remote_app,
            crate::APP_NAME,
            crate::APP_VERSION
        );
        self.session()
            .get_block_template(wallet_addr, &extra_data)
            .await
            .map_err(|e| Error::upstream("failed fetching new block template from karlsen", e))
    }
}

#[async_trait]
impl TemplateSource for UpstreamBridge {
    async fn get_block_template(&self, wallet_addr: &str, remote_app: &str) -> Result<BlockTemplate> {
        UpstreamBridge::get_block_template(self, wallet_addr, remote_app).await
    }
}
