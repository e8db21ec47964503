use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::chain::{ChainNotifier, Hash256, OutPoint, Transaction, TxPublisher};
use crate::channel::{ChannelStateStore, OpenChannel};
use crate::store::Store;

use super::arbitrator::{
    ChannelArbitrator, ChannelArbitratorConfig, DeliverFn, ForceCloseReq, IncubateFn, PreImageFn,
};
use super::chain_watcher::{closed_chain_event_subscription, ChainWatcher, ChannelWallet};
use super::log::{ArbitratorLog, ArbitratorState, ContractError};

/// Node-wide configuration of the contract court: the store, the chain
/// backend capabilities and the hand-offs to the switch and the sweeper.
pub struct ChainArbitratorConfig {
    pub chain_hash: Hash256,
    pub store: Store,
    pub notifier: Arc<dyn ChainNotifier>,
    pub publisher: Arc<dyn TxPublisher>,
    pub wallet: Arc<dyn ChannelWallet>,
    pub deliver_resolution_msg: Arc<DeliverFn>,
    pub incubate_outputs: Arc<IncubateFn>,
    pub lookup_pre_image: Arc<PreImageFn>,
    pub outgoing_broadcast_delta: u32,
    pub incoming_broadcast_delta: u32,
}

/// Supervises one `ChannelArbitrator` per channel: builds them at startup
/// from the store, routes force close requests, and reaps arbitrators once
/// their channel is fully resolved.
pub struct ChainArbitrator {
    cfg: Arc<ChainArbitratorConfig>,
    active: Arc<Mutex<HashMap<OutPoint, ChannelArbitrator>>>,
    resolved_tx: mpsc::Sender<OutPoint>,
    resolved_rx: Option<mpsc::Receiver<OutPoint>>,
    quit: CancellationToken,
}

impl ChainArbitrator {
    pub fn new(cfg: ChainArbitratorConfig, quit: CancellationToken) -> Self {
        let (resolved_tx, resolved_rx) = mpsc::channel(16);
        Self {
            cfg: Arc::new(cfg),
            active: Arc::new(Mutex::new(HashMap::new())),
            resolved_tx,
            resolved_rx: Some(resolved_rx),
            quit,
        }
    }

    /// Load every channel from the store and put an arbitrator in front of
    /// it: open channels get a chain watcher, channels already closed in
    /// the database resume from their persisted arbitrator state.
    pub async fn start(&mut self) -> Result<(), ContractError> {
        let channels = self.cfg.store.fetch_all_channels()?;
        info!(num_channels = channels.len(), "starting contract court");

        {
            let mut active = self.active.lock().await;
            for channel in channels {
                let chan_point = channel.funding_outpoint;
                match self.build_channel_arbitrator(channel) {
                    Ok(arbitrator) => {
                        active.insert(chan_point, arbitrator);
                    }
                    Err(err) => {
                        error!(%chan_point, %err, "unable to start channel arbitrator");
                        return Err(err);
                    }
                }
            }

            for summary in self.cfg.store.fetch_closed_channels(true)? {
                let chan_point = summary.chan_point;
                let log = Arc::new(self.cfg.store.arbitrator_log(chan_point));
                if log.current_state()? == ArbitratorState::FullyResolved {
                    continue;
                }

                let arb_cfg = self.arbitrator_config(
                    chan_point,
                    summary.short_chan_id.to_u64(),
                    true,
                    Some(summary.close_type),
                    summary.close_height,
                );
                let mut arbitrator = ChannelArbitrator::new(
                    arb_cfg,
                    closed_chain_event_subscription(),
                    HashMap::new(),
                    log,
                );
                arbitrator.start()?;
                active.insert(chan_point, arbitrator);
            }
        }

        let mut resolved_rx = self.resolved_rx.take().ok_or_else(|| {
            ContractError::Other("chain arbitrator already started".to_string())
        })?;
        let active = Arc::clone(&self.active);
        let store = self.cfg.store.clone();
        let quit = self.quit.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(chan_point) = resolved_rx.recv() => {
                        info!(%chan_point, "channel fully resolved");
                        let mut active = active.lock().await;
                        if let Some(mut arbitrator) = active.remove(&chan_point) {
                            arbitrator.stop().await;
                        }
                        let log = store.arbitrator_log(chan_point);
                        if let Err(err) = log.wipe_history() {
                            warn!(%chan_point, %err, "unable to wipe arbitrator history");
                        }
                        if let Err(err) = store.mark_chan_fully_closed(&chan_point) {
                            warn!(%chan_point, %err, "unable to mark channel fully closed");
                        }
                    }
                    _ = quit.cancelled() => return,
                }
            }
        });

        Ok(())
    }

    fn build_channel_arbitrator(
        &self,
        channel: OpenChannel,
    ) -> Result<ChannelArbitrator, ContractError> {
        let chan_point = channel.funding_outpoint;
        let log = Arc::new(self.cfg.store.arbitrator_log(chan_point));

        let watcher = ChainWatcher::new(
            channel.clone(),
            Arc::clone(&self.cfg.notifier),
            Arc::clone(&self.cfg.wallet),
            self.quit.clone(),
        );
        let chain_events = watcher.start();

        let mut htlc_sets = HashMap::new();
        htlc_sets.insert(
            super::log::HtlcSetKey::Local,
            channel.local_commitment.htlcs.clone(),
        );
        htlc_sets.insert(
            super::log::HtlcSetKey::Remote,
            channel.remote_commitment.htlcs.clone(),
        );

        let arb_cfg = self.arbitrator_config(
            chan_point,
            channel.short_chan_id().to_u64(),
            false,
            None,
            0,
        );
        let mut arbitrator = ChannelArbitrator::new(arb_cfg, chain_events, htlc_sets, log);
        arbitrator.start()?;
        Ok(arbitrator)
    }

    fn arbitrator_config(
        &self,
        chan_point: OutPoint,
        short_chan_id: u64,
        is_pending_close: bool,
        close_type: Option<crate::channel::CloseType>,
        closing_height: u32,
    ) -> ChannelArbitratorConfig {
        let cfg = Arc::clone(&self.cfg);
        let publisher = Arc::clone(&cfg.publisher);
        let resolved_tx = self.resolved_tx.clone();

        let store_for_force_close = cfg.store.clone();
        let wallet = Arc::clone(&cfg.wallet);
        let force_close_chan = move || {
            let channels = store_for_force_close.fetch_all_channels()?;
            let channel = channels
                .into_iter()
                .find(|c| c.funding_outpoint == chan_point)
                .ok_or_else(|| {
                    ContractError::Other(format!("channel {} not found", chan_point))
                })?;
            wallet
                .force_close_summary(&channel)
                .map_err(ContractError::from)
        };

        let store_for_broadcast = cfg.store.clone();
        let mark_commitment_broadcasted = move |tx: &Transaction| {
            let channels = store_for_broadcast.fetch_all_channels()?;
            if let Some(mut channel) = channels
                .into_iter()
                .find(|c| c.funding_outpoint == chan_point)
            {
                store_for_broadcast.mark_commitment_broadcasted(&mut channel, tx.clone())?;
            }
            Ok(())
        };

        let store_for_close = cfg.store.clone();
        let mark_channel_closed = move |summary: &crate::channel::ChannelCloseSummary| {
            let channels = store_for_close.fetch_all_channels()?;
            if let Some(channel) = channels
                .into_iter()
                .find(|c| c.funding_outpoint == chan_point)
            {
                store_for_close.close_channel(&channel, summary.clone())?;
            }
            Ok(())
        };

        let mark_channel_resolved = move || {
            let _ = resolved_tx.try_send(chan_point);
            Ok(())
        };

        ChannelArbitratorConfig {
            chan_point,
            short_chan_id: crate::chain::ShortChannelId::from_u64(short_chan_id),
            notifier: Arc::clone(&cfg.notifier),
            publish_tx: Arc::new(move |tx: &Transaction| publisher.publish_tx(tx)),
            deliver_resolution_msg: Arc::clone(&cfg.deliver_resolution_msg),
            force_close_chan: Arc::new(force_close_chan),
            mark_commitment_broadcasted: Arc::new(mark_commitment_broadcasted),
            mark_channel_closed: Arc::new(mark_channel_closed),
            mark_channel_resolved: Arc::new(mark_channel_resolved),
            incubate_outputs: Arc::clone(&cfg.incubate_outputs),
            lookup_pre_image: Arc::clone(&cfg.lookup_pre_image),
            is_pending_close,
            close_type,
            closing_height,
            outgoing_broadcast_delta: cfg.outgoing_broadcast_delta,
            incoming_broadcast_delta: cfg.incoming_broadcast_delta,
        }
    }

    /// Put an arbitrator in front of a freshly opened channel. The caller's
    /// cancel token is honored before the channel is enqueued, so an aborted
    /// funding flow never leaves a watcher behind.
    pub async fn add_new_channel(
        &self,
        channel: OpenChannel,
        cancel: CancellationToken,
    ) -> Result<(), ContractError> {
        if cancel.is_cancelled() {
            return Err(ContractError::Other("channel add canceled".to_string()));
        }

        let chan_point = channel.funding_outpoint;
        let arbitrator = self.build_channel_arbitrator(channel)?;
        self.active.lock().await.insert(chan_point, arbitrator);
        Ok(())
    }

    /// Request a unilateral close of the given channel and wait for the
    /// broadcast commitment transaction.
    pub async fn force_close_channel(
        &self,
        chan_point: OutPoint,
    ) -> Result<Transaction, ContractError> {
        let reqs = {
            let active = self.active.lock().await;
            let arbitrator = active.get(&chan_point).ok_or_else(|| {
                ContractError::Other(format!("no arbitrator for channel {}", chan_point))
            })?;
            arbitrator.force_close_reqs()
        };

        let (err_tx, mut err_rx) = mpsc::channel(1);
        let (close_tx_tx, mut close_tx_rx) = mpsc::channel(1);
        reqs.send(ForceCloseReq {
            err_resp: err_tx,
            close_tx_resp: close_tx_tx,
        })
        .await
        .map_err(|_| ContractError::Other("arbitrator exited".to_string()))?;

        tokio::select! {
            Some(close_tx) = close_tx_rx.recv() => Ok(close_tx),
            Some(result) = err_rx.recv() => match result {
                Ok(()) => close_tx_rx
                    .recv()
                    .await
                    .ok_or_else(|| ContractError::Other("missing close tx".to_string())),
                Err(err) => Err(err),
            },
        }
    }

    pub async fn stop(&mut self) {
        self.quit.cancel();
        let mut active = self.active.lock().await;
        for (_, arbitrator) in active.iter_mut() {
            arbitrator.stop().await;
        }
        active.clear();
    }
}
