//! Runtime composition and lifecycle fan-out.

use crate::settings::{multiplexer_config, request_timeout, send_worker_config};
use crate::RuntimeResult;
use client_config_and_utils::{init_logging, Config, Paths};
use outbound_send_worker::{
    DeliveryTransport, OutboundItem, SendWorker, SendWorkerHandle, SupabaseDeliveryTransport,
};
use outbound_store_sqlite::SqliteOutboundStore;
use realtime_subscription_multiplexer::{ChangeFeedTransport, LifecycleEvent, RealtimeMultiplexer};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// Signals and collaborators supplied by the host app.
pub struct RuntimeSignals {
    /// Current network reachability.
    pub reachability: watch::Receiver<bool>,
    /// Current access token; `None` while signed out.
    pub access_token: watch::Receiver<Option<String>>,
    /// Live change-feed backend.
    pub change_feed: Arc<dyn ChangeFeedTransport>,
}

/// The running delivery layer: durable store, send worker and multiplexer.
pub struct DeliveryRuntime {
    config: Config,
    paths: Paths,
    store: Arc<SqliteOutboundStore>,
    send_worker: SendWorkerHandle,
    multiplexer: RealtimeMultiplexer,
}

impl DeliveryRuntime {
    /// Loads config from `paths`, initialises logging and starts everything
    /// against the configured Supabase project.
    pub async fn start(paths: Paths, signals: RuntimeSignals) -> RuntimeResult<Self> {
        let config = Config::load(&paths)?;
        init_logging(&config.log_level);

        info!(
            supabase_url = %config.supabase_url,
            base_dir = %paths.base_dir().display(),
            "Configuration loaded"
        );

        let transport = SupabaseDeliveryTransport::new(
            config.supabase_url()?.as_str(),
            config.supabase_publishable_key.clone(),
            signals.access_token.clone(),
            request_timeout(&config.delivery),
        )?;

        Self::start_with_transport(config, paths, signals, Arc::new(transport)).await
    }

    /// Starts with an explicit delivery transport. Does not touch logging.
    pub async fn start_with_transport(
        config: Config,
        paths: Paths,
        signals: RuntimeSignals,
        transport: Arc<dyn DeliveryTransport>,
    ) -> RuntimeResult<Self> {
        paths.ensure_dirs()?;

        let store = Arc::new(
            SqliteOutboundStore::open(paths.outbox_database_file(), paths.attachments_dir())
                .await?,
        );
        info!(path = %paths.outbox_database_file().display(), "Outbound store ready");

        let send_worker = SendWorker::new(
            send_worker_config(&config.delivery),
            store.clone(),
            transport,
        )
        .start(signals.reachability);

        let multiplexer = RealtimeMultiplexer::start(
            multiplexer_config(&config.realtime),
            signals.change_feed,
            signals.access_token,
        );

        info!("Delivery runtime started");
        Ok(Self {
            config,
            paths,
            store,
            send_worker,
            multiplexer,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn store(&self) -> &Arc<SqliteOutboundStore> {
        &self.store
    }

    pub fn send_worker(&self) -> &SendWorkerHandle {
        &self.send_worker
    }

    pub fn multiplexer(&self) -> &RealtimeMultiplexer {
        &self.multiplexer
    }

    /// Persists a new outbound item and wakes the worker.
    pub async fn enqueue(&self, item: OutboundItem) -> RuntimeResult<()> {
        Ok(self.send_worker.enqueue(item).await?)
    }

    /// Forwards an app lifecycle transition. Becoming active also wakes the
    /// send worker so items queued while suspended go out promptly.
    pub async fn handle_lifecycle(&self, event: LifecycleEvent) -> RuntimeResult<()> {
        debug!(event = ?event, "Lifecycle event");
        self.multiplexer.handle_lifecycle(event).await?;
        if event == LifecycleEvent::DidBecomeActive {
            self.send_worker.notify_new_pending_message();
        }
        Ok(())
    }

    /// Stops the worker and closes every channel, forgetting configurations.
    ///
    /// Items mid-delivery stay `sending` and resume on the next start.
    pub async fn shutdown(&self) {
        self.send_worker.stop().await;
        self.multiplexer.shutdown().await;
        info!("Delivery runtime stopped");
    }
}
