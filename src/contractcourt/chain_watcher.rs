use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::chain::{ChainNotifier, OutPoint, SpendDetail};
use crate::channel::{
    ChannelCloseSummary, ChannelError, CloseType, HtlcResolutions, IncomingHtlcResolution,
    LocalForceCloseSummary, OpenChannel, OutgoingHtlcResolution,
};

use super::arbitrator::{
    BreachRetribution, ChainEventSubscription, CooperativeCloseInfo, LocalUnilateralCloseInfo,
    RemoteUnilateralCloseInfo,
};
use super::log::{CommitSet, HtlcSetKey};

/// Wallet-side capability the contract court consumes: producing the signed
/// local commitment and its resolution material on demand.
pub trait ChannelWallet: Send + Sync {
    fn force_close_summary(
        &self,
        channel: &OpenChannel,
    ) -> Result<LocalForceCloseSummary, ChannelError>;
}

enum CloseObservation {
    Cooperative,
    LocalUnilateral,
    RemoteUnilateral { pending: bool },
    Breach,
}

/// Watches a channel's funding outpoint and classifies the transaction that
/// eventually spends it into one of the four disjoint close events the
/// arbitrator consumes.
pub struct ChainWatcher {
    channel: OpenChannel,
    notifier: Arc<dyn ChainNotifier>,
    wallet: Arc<dyn ChannelWallet>,
    quit: CancellationToken,
}

impl ChainWatcher {
    pub fn new(
        channel: OpenChannel,
        notifier: Arc<dyn ChainNotifier>,
        wallet: Arc<dyn ChannelWallet>,
        quit: CancellationToken,
    ) -> Self {
        Self {
            channel,
            notifier,
            wallet,
            quit,
        }
    }

    /// Spawn the watch task. The returned subscription is the arbitrator's
    /// chain event bus for this channel.
    pub fn start(self) -> ChainEventSubscription {
        let (coop_tx, coop_rx) = mpsc::channel(1);
        let (local_tx, local_rx) = mpsc::channel(1);
        let (remote_tx, remote_rx) = mpsc::channel(1);
        let (breach_tx, breach_rx) = mpsc::channel(1);

        let mut spend_rx = self.notifier.register_spend(&self.channel.funding_outpoint);
        let quit = self.quit.clone();
        tokio::spawn(async move {
            let spend = tokio::select! {
                maybe_spend = spend_rx.recv() => match maybe_spend {
                    Some(spend) => spend,
                    None => return,
                },
                _ = quit.cancelled() => return,
            };

            info!(
                chan_point = %self.channel.funding_outpoint,
                spender = %spend.spender_tx_hash,
                "funding output spent"
            );

            match self.classify(&spend) {
                CloseObservation::Cooperative => {
                    let info = CooperativeCloseInfo {
                        channel_close_summary: self
                            .close_summary(&spend, CloseType::CooperativeClose),
                    };
                    let _ = coop_tx.send(info).await;
                }
                CloseObservation::LocalUnilateral => {
                    let summary = match self.wallet.force_close_summary(&self.channel) {
                        Ok(summary) => summary,
                        Err(err) => {
                            error!(%err, "unable to rebuild local close summary");
                            return;
                        }
                    };
                    let info = LocalUnilateralCloseInfo {
                        spend_detail: spend.clone(),
                        local_force_close_summary: summary,
                        channel_close_summary: self
                            .close_summary(&spend, CloseType::LocalForceClose),
                        commit_set: self.commit_set(HtlcSetKey::Local),
                    };
                    let _ = local_tx.send(info).await;
                }
                CloseObservation::RemoteUnilateral { pending } => {
                    let conf_key = if pending {
                        HtlcSetKey::RemotePending
                    } else {
                        HtlcSetKey::Remote
                    };
                    let info = RemoteUnilateralCloseInfo {
                        spend_detail: spend.clone(),
                        commit_resolution: None,
                        htlc_resolutions: self.remote_htlc_resolutions(&spend),
                        channel_close_summary: self
                            .close_summary(&spend, CloseType::RemoteForceClose),
                        commit_set: self.commit_set(conf_key),
                    };
                    let _ = remote_tx.send(info).await;
                }
                CloseObservation::Breach => {
                    warn!(
                        chan_point = %self.channel.funding_outpoint,
                        breach_txid = %spend.spender_tx_hash,
                        "revoked commitment broadcast by counterparty"
                    );
                    let _ = breach_tx
                        .send(BreachRetribution {
                            breach_txid: spend.spender_tx_hash,
                            breach_height: spend.spending_height,
                        })
                        .await;
                }
            }
        });

        ChainEventSubscription {
            cooperative_closure: coop_rx,
            local_unilateral_closure: local_rx,
            remote_unilateral_closure: remote_rx,
            contract_breach: breach_rx,
        }
    }

    // Commitment transactions encode their height in the funding input's
    // sequence field; the cooperative close uses the final sequence. That
    // is enough to tell the four cases apart without script inspection.
    fn classify(&self, spend: &SpendDetail) -> CloseObservation {
        let sequence = spend
            .spending_tx
            .inputs
            .first()
            .map(|input| input.sequence)
            .unwrap_or(u32::MAX);

        if sequence == u32::MAX {
            return CloseObservation::Cooperative;
        }
        if spend.spender_tx_hash == self.channel.local_commitment.commit_tx.txid() {
            return CloseObservation::LocalUnilateral;
        }

        let broadcast_height = (sequence & 0xff_ffff) as u64;
        let remote_height = self.channel.remote_commitment.commit_height;
        if broadcast_height < remote_height {
            CloseObservation::Breach
        } else {
            CloseObservation::RemoteUnilateral {
                pending: broadcast_height > remote_height,
            }
        }
    }

    fn close_summary(&self, spend: &SpendDetail, close_type: CloseType) -> ChannelCloseSummary {
        ChannelCloseSummary {
            chan_point: self.channel.funding_outpoint,
            short_chan_id: self.channel.short_chan_id(),
            chain_hash: self.channel.chain_hash,
            closing_txid: spend.spender_tx_hash,
            remote_pub: self.channel.identity_pub,
            capacity: self.channel.capacity,
            close_height: spend.spending_height,
            settled_balance: self.channel.local_commitment.local_balance / 1000,
            time_locked_balance: 0,
            close_type,
            is_pending: true,
        }
    }

    fn commit_set(&self, conf_key: HtlcSetKey) -> CommitSet {
        let mut commit_set = CommitSet {
            conf_commit_key: Some(conf_key),
            ..CommitSet::default()
        };
        commit_set.htlc_sets.insert(
            HtlcSetKey::Local,
            self.channel.local_commitment.htlcs.clone(),
        );
        commit_set.htlc_sets.insert(
            HtlcSetKey::Remote,
            self.channel.remote_commitment.htlcs.clone(),
        );
        commit_set
    }

    // On the counterparty's commitment our claims are first level: the
    // outputs are spendable directly once the pre-image or timeout is at
    // hand, so no second level transactions are attached.
    fn remote_htlc_resolutions(&self, spend: &SpendDetail) -> HtlcResolutions {
        let mut resolutions = HtlcResolutions::default();
        for htlc in &self.channel.remote_commitment.htlcs {
            if htlc.is_dust() {
                continue;
            }
            let claim_outpoint =
                OutPoint::new(spend.spender_tx_hash, htlc.output_index as u32);
            if htlc.incoming {
                resolutions.incoming.push(IncomingHtlcResolution {
                    htlc_index: htlc.htlc_index,
                    amount: htlc.amount,
                    expiry: htlc.refund_timeout,
                    payment_hash: htlc.payment_hash,
                    claim_outpoint,
                    signed_success_tx: None,
                });
            } else {
                resolutions.outgoing.push(OutgoingHtlcResolution {
                    htlc_index: htlc.htlc_index,
                    amount: htlc.amount,
                    expiry: htlc.refund_timeout,
                    claim_outpoint,
                    signed_timeout_tx: None,
                });
            }
        }
        resolutions
    }
}

/// An empty, already-exhausted event bus for channels closed in the
/// database before startup: their close event was consumed in a previous
/// run and only the arbitrator log drives them now.
pub fn closed_chain_event_subscription() -> ChainEventSubscription {
    ChainEventSubscription {
        cooperative_closure: mpsc::channel::<CooperativeCloseInfo>(1).1,
        local_unilateral_closure: mpsc::channel::<LocalUnilateralCloseInfo>(1).1,
        remote_unilateral_closure: mpsc::channel::<RemoteUnilateralCloseInfo>(1).1,
        contract_breach: mpsc::channel::<BreachRetribution>(1).1,
    }
}
