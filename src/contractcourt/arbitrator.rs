use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::chain::{
    BlockEpoch, ChainNotifier, Hash256, MilliAtoms, OutPoint, PublishError, ShortChannelId,
    SpendDetail, Transaction,
};
use crate::channel::{
    ChannelCloseSummary, CloseType, CommitOutputResolution, Htlc, HtlcResolutions,
    LocalForceCloseSummary,
};

use super::log::{
    ArbitratorLog, ArbitratorState, CommitSet, ContractError, ContractResolutions, HtlcSetKey,
};
use super::resolvers::{
    CommitSweepResolver, ContractResolver, FailureReason, IncomingContestResolver,
    IncubationRequest, OutgoingContestResolver, ResolutionMsg, ResolverCtx, ResolverEvent,
    ResolverKind, ResolverProgress,
};

/// A cooperative close transaction confirmed on chain.
#[derive(Clone, Debug)]
pub struct CooperativeCloseInfo {
    pub channel_close_summary: ChannelCloseSummary,
}

/// The counterparty's commitment confirmed on chain.
#[derive(Clone, Debug)]
pub struct RemoteUnilateralCloseInfo {
    pub spend_detail: SpendDetail,
    pub commit_resolution: Option<CommitOutputResolution>,
    pub htlc_resolutions: HtlcResolutions,
    pub channel_close_summary: ChannelCloseSummary,
    pub commit_set: CommitSet,
}

/// Our own commitment confirmed on chain.
#[derive(Clone, Debug)]
pub struct LocalUnilateralCloseInfo {
    pub spend_detail: SpendDetail,
    pub local_force_close_summary: LocalForceCloseSummary,
    pub channel_close_summary: ChannelCloseSummary,
    pub commit_set: CommitSet,
}

/// A revoked commitment confirmed on chain. Remediation belongs to the
/// retribution subsystem; the arbitrator only acknowledges and exits.
#[derive(Clone, Debug)]
pub struct BreachRetribution {
    pub breach_txid: Hash256,
    pub breach_height: u32,
}

/// The four disjoint close event channels of a single channel.
pub struct ChainEventSubscription {
    pub cooperative_closure: mpsc::Receiver<CooperativeCloseInfo>,
    pub local_unilateral_closure: mpsc::Receiver<LocalUnilateralCloseInfo>,
    pub remote_unilateral_closure: mpsc::Receiver<RemoteUnilateralCloseInfo>,
    pub contract_breach: mpsc::Receiver<BreachRetribution>,
}

/// A caller-initiated force close. The close transaction and the final
/// verdict travel back over the embedded reply channels.
pub struct ForceCloseReq {
    pub err_resp: mpsc::Sender<Result<(), ContractError>>,
    pub close_tx_resp: mpsc::Sender<Transaction>,
}

/// New HTLC activity on one of the three commitments, reported by the
/// channel link as updates are signed.
#[derive(Clone, Debug)]
pub struct ContractUpdate {
    pub htlc_key: HtlcSetKey,
    pub htlcs: Vec<Htlc>,
}

/// Fresh signals for an arbitrator once a channel reaches the open state.
pub struct ContractSignals {
    pub htlc_updates: mpsc::Receiver<ContractUpdate>,
    pub short_chan_id: ShortChannelId,
}

pub type PublishFn = dyn Fn(&Transaction) -> Result<(), PublishError> + Send + Sync;
pub type DeliverFn = dyn Fn(Vec<ResolutionMsg>) -> Result<(), ContractError> + Send + Sync;
pub type ForceCloseFn = dyn Fn() -> Result<LocalForceCloseSummary, ContractError> + Send + Sync;
pub type MarkTxFn = dyn Fn(&Transaction) -> Result<(), ContractError> + Send + Sync;
pub type MarkClosedFn = dyn Fn(&ChannelCloseSummary) -> Result<(), ContractError> + Send + Sync;
pub type MarkResolvedFn = dyn Fn() -> Result<(), ContractError> + Send + Sync;
pub type IncubateFn = dyn Fn(&IncubationRequest) -> Result<(), ContractError> + Send + Sync;
pub type PreImageFn = dyn Fn(&Hash256) -> Option<Hash256> + Send + Sync;

/// Everything a channel arbitrator needs from its environment. All
/// capabilities are injected so the state machine itself stays free of
/// globals.
pub struct ChannelArbitratorConfig {
    pub chan_point: OutPoint,
    pub short_chan_id: ShortChannelId,
    pub notifier: Arc<dyn ChainNotifier>,
    pub publish_tx: Arc<PublishFn>,
    pub deliver_resolution_msg: Arc<DeliverFn>,
    pub force_close_chan: Arc<ForceCloseFn>,
    pub mark_commitment_broadcasted: Arc<MarkTxFn>,
    pub mark_channel_closed: Arc<MarkClosedFn>,
    pub mark_channel_resolved: Arc<MarkResolvedFn>,
    pub incubate_outputs: Arc<IncubateFn>,
    pub lookup_pre_image: Arc<PreImageFn>,
    /// Set when the channel was already closed in the database before this
    /// arbitrator started, together with how and where it closed.
    pub is_pending_close: bool,
    pub close_type: Option<CloseType>,
    pub closing_height: u32,
    /// Force close this many blocks before the earliest outgoing HTLC
    /// expires.
    pub outgoing_broadcast_delta: u32,
    pub incoming_broadcast_delta: u32,
}

/// Snapshot of a live resolver, reported for introspection (the RPC
/// surface lists these for pending close channels).
#[derive(Clone, Debug)]
pub struct ResolverReport {
    pub kind: ResolverKind,
    pub htlc_index: Option<u64>,
    pub htlc_amount: Option<MilliAtoms>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Trigger {
    Chain,
    User,
    CoopClose,
    LocalClose,
    RemoteClose,
    Breach,
}

#[derive(Debug)]
enum Wait {
    Spend,
    Epoch(u32),
}

struct ActiveResolver {
    id: u64,
    resolver: ContractResolver,
    wait: Wait,
}

struct SharedState {
    state: Mutex<ArbitratorState>,
    resolvers: Mutex<Vec<ResolverReport>>,
}

struct EventStreams {
    chain_events: ChainEventSubscription,
    block_epochs: mpsc::Receiver<BlockEpoch>,
    force_close_reqs: mpsc::Receiver<ForceCloseReq>,
    signal_updates: mpsc::Receiver<ContractSignals>,
    spend_events: mpsc::Receiver<(u64, SpendDetail)>,
}

struct ArbCore {
    cfg: ChannelArbitratorConfig,
    log: Arc<dyn ArbitratorLog>,
    state: ArbitratorState,
    htlc_sets: HashMap<HtlcSetKey, Vec<Htlc>>,
    active_resolvers: Vec<ActiveResolver>,
    pending_force_close: Option<ForceCloseReq>,
    best_height: u32,
    next_resolver_id: u64,
    spend_tx: mpsc::Sender<(u64, SpendDetail)>,
    shared: Arc<SharedState>,
    quit: CancellationToken,
}

/// The on-chain watchdog of a single channel. One task, fed by the chain
/// event bus, a block epoch stream and a force close inbox of size one;
/// every state transition is committed to the arbitrator log before the
/// task moves on.
pub struct ChannelArbitrator {
    core: Option<(ArbCore, EventStreams)>,
    force_close_reqs: mpsc::Sender<ForceCloseReq>,
    signal_updates: mpsc::Sender<ContractSignals>,
    shared: Arc<SharedState>,
    quit: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ChannelArbitrator {
    pub fn new(
        cfg: ChannelArbitratorConfig,
        chain_events: ChainEventSubscription,
        htlc_sets: HashMap<HtlcSetKey, Vec<Htlc>>,
        log: Arc<dyn ArbitratorLog>,
    ) -> Self {
        let (force_close_tx, force_close_rx) = mpsc::channel(1);
        let (signals_tx, signals_rx) = mpsc::channel(1);
        let (spend_tx, spend_rx) = mpsc::channel(32);
        let block_epochs = cfg.notifier.register_block_epochs();
        let shared = Arc::new(SharedState {
            state: Mutex::new(ArbitratorState::Default),
            resolvers: Mutex::new(Vec::new()),
        });
        let quit = CancellationToken::new();

        let core = ArbCore {
            cfg,
            log,
            state: ArbitratorState::Default,
            htlc_sets,
            active_resolvers: Vec::new(),
            pending_force_close: None,
            best_height: 0,
            next_resolver_id: 0,
            spend_tx,
            shared: Arc::clone(&shared),
            quit: quit.clone(),
        };
        let streams = EventStreams {
            chain_events,
            block_epochs,
            force_close_reqs: force_close_rx,
            signal_updates: signals_rx,
            spend_events: spend_rx,
        };

        Self {
            core: Some((core, streams)),
            force_close_reqs: force_close_tx,
            signal_updates: signals_tx,
            shared,
            quit,
            handle: None,
        }
    }

    /// Recover the persisted state, replay any startup trigger, relaunch
    /// resolvers and begin watching the chain. Must run inside a tokio
    /// runtime.
    pub fn start(&mut self) -> Result<(), ContractError> {
        let (mut core, streams) = self
            .core
            .take()
            .ok_or_else(|| ContractError::Other("arbitrator already started".to_string()))?;

        let state = core.log.current_state()?;
        core.set_state(state);
        core.best_height = core.cfg.closing_height;
        info!(
            chan_point = %core.cfg.chan_point,
            %state,
            "starting channel arbitrator"
        );

        if state == ArbitratorState::WaitingFullResolution {
            core.relaunch_resolvers()?;
        }

        let startup_trigger = if core.cfg.is_pending_close {
            match core.cfg.close_type {
                Some(CloseType::CooperativeClose) => Some(Trigger::CoopClose),
                Some(CloseType::LocalForceClose) => Some(Trigger::LocalClose),
                Some(CloseType::RemoteForceClose) => Some(Trigger::RemoteClose),
                Some(CloseType::BreachClose) => Some(Trigger::Breach),
                _ => Some(Trigger::Chain),
            }
        } else if state != ArbitratorState::Default {
            Some(Trigger::Chain)
        } else {
            None
        };
        if let Some(trigger) = startup_trigger {
            core.advance_state(trigger, core.cfg.closing_height, None);
        }

        self.handle = Some(tokio::spawn(core.run(streams)));
        Ok(())
    }

    pub async fn stop(&mut self) {
        self.quit.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    pub fn state(&self) -> ArbitratorState {
        *self.shared.state.lock().expect("arbitrator state lock")
    }

    /// Live resolver snapshots, for introspection.
    pub fn active_resolvers(&self) -> Vec<ResolverReport> {
        self.shared
            .resolvers
            .lock()
            .expect("resolver report lock")
            .clone()
    }

    /// Inbox for force close requests. Size one: a second request while one
    /// is pending is rejected.
    pub fn force_close_reqs(&self) -> mpsc::Sender<ForceCloseReq> {
        self.force_close_reqs.clone()
    }

    /// Swap in fresh signals once the channel (re)opens.
    pub async fn update_contract_signals(&self, signals: ContractSignals) {
        let _ = self.signal_updates.send(signals).await;
    }
}

async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl ArbCore {
    async fn run(mut self, mut streams: EventStreams) {
        let quit = self.quit.clone();
        let mut htlc_updates: Option<mpsc::Receiver<ContractUpdate>> = None;

        loop {
            tokio::select! {
                Some(req) = streams.force_close_reqs.recv() => {
                    self.handle_force_close_req(req);
                }
                Some(signals) = streams.signal_updates.recv() => {
                    trace!(chan_point = %self.cfg.chan_point, "new contract signals");
                    self.cfg.short_chan_id = signals.short_chan_id;
                    htlc_updates = Some(signals.htlc_updates);
                }
                Some(update) = recv_opt(&mut htlc_updates) => {
                    trace!(
                        chan_point = %self.cfg.chan_point,
                        set = ?update.htlc_key,
                        num_htlcs = update.htlcs.len(),
                        "htlc set updated"
                    );
                    self.htlc_sets.insert(update.htlc_key, update.htlcs);
                }
                Some(info) = streams.chain_events.cooperative_closure.recv() => {
                    self.handle_coop_close(info);
                }
                Some(info) = streams.chain_events.remote_unilateral_closure.recv() => {
                    self.handle_remote_close(info);
                }
                Some(info) = streams.chain_events.local_unilateral_closure.recv() => {
                    self.handle_local_close(info);
                }
                Some(breach) = streams.chain_events.contract_breach.recv() => {
                    self.handle_breach(breach);
                }
                Some(epoch) = streams.block_epochs.recv() => {
                    self.handle_block_epoch(epoch);
                }
                Some((id, spend)) = streams.spend_events.recv() => {
                    self.handle_spend(id, spend);
                }
                _ = quit.cancelled() => {
                    debug!(chan_point = %self.cfg.chan_point, "arbitrator shutting down");
                    return;
                }
            }
        }
    }

    fn set_state(&mut self, state: ArbitratorState) {
        self.state = state;
        *self.shared.state.lock().expect("arbitrator state lock") = state;
    }

    fn update_resolver_report(&self) {
        let report = self
            .active_resolvers
            .iter()
            .map(|active| ResolverReport {
                kind: active.resolver.kind(),
                htlc_index: active.resolver.htlc_index(),
                htlc_amount: active.resolver.htlc_amount(),
            })
            .collect();
        *self.shared.resolvers.lock().expect("resolver report lock") = report;
    }

    fn handle_force_close_req(&mut self, req: ForceCloseReq) {
        if self.state != ArbitratorState::Default {
            let _ = req
                .err_resp
                .try_send(Err(ContractError::AlreadyForceClosed));
            return;
        }

        self.pending_force_close = Some(req);
        self.advance_state(Trigger::User, self.best_height, None);
    }

    fn handle_coop_close(&mut self, info: CooperativeCloseInfo) {
        info!(chan_point = %self.cfg.chan_point, "cooperative close confirmed");

        let mut summary = info.channel_close_summary;
        summary.close_type = CloseType::CooperativeClose;
        if let Err(err) = (self.cfg.mark_channel_closed)(&summary) {
            error!(%err, "unable to mark channel closed");
            return;
        }

        self.advance_state(Trigger::CoopClose, self.best_height, None);
    }

    fn handle_remote_close(&mut self, info: RemoteUnilateralCloseInfo) {
        info!(
            chan_point = %self.cfg.chan_point,
            spender = %info.spend_detail.spender_tx_hash,
            "remote commitment confirmed"
        );

        let resolutions = ContractResolutions {
            commit_hash: info.spend_detail.spender_tx_hash,
            commit_resolution: info.commit_resolution,
            htlc_resolutions: info.htlc_resolutions,
        };
        if let Err(err) = self.log.log_contract_resolutions(&resolutions) {
            error!(%err, "unable to write contract resolutions");
            return;
        }
        if let Err(err) = self.log.insert_confirmed_commit_set(&info.commit_set) {
            error!(%err, "unable to write confirmed commit set");
            return;
        }

        let mut summary = info.channel_close_summary;
        summary.close_type = CloseType::RemoteForceClose;
        if let Err(err) = (self.cfg.mark_channel_closed)(&summary) {
            error!(%err, "unable to mark channel closed");
            return;
        }

        let height = info.spend_detail.spending_height;
        self.advance_state(Trigger::RemoteClose, height, Some(&info.commit_set));
    }

    fn handle_local_close(&mut self, info: LocalUnilateralCloseInfo) {
        info!(chan_point = %self.cfg.chan_point, "local commitment confirmed");

        let force_close = info.local_force_close_summary;
        let resolutions = ContractResolutions {
            commit_hash: force_close.close_tx.txid(),
            commit_resolution: force_close.commit_resolution,
            htlc_resolutions: force_close.htlc_resolutions,
        };
        if let Err(err) = self.log.log_contract_resolutions(&resolutions) {
            error!(%err, "unable to write contract resolutions");
            return;
        }
        if let Err(err) = self.log.insert_confirmed_commit_set(&info.commit_set) {
            error!(%err, "unable to write confirmed commit set");
            return;
        }

        let mut summary = info.channel_close_summary;
        summary.close_type = CloseType::LocalForceClose;
        if let Err(err) = (self.cfg.mark_channel_closed)(&summary) {
            error!(%err, "unable to mark channel closed");
            return;
        }

        let height = info.spend_detail.spending_height;
        self.advance_state(Trigger::LocalClose, height, Some(&info.commit_set));
    }

    fn handle_breach(&mut self, breach: BreachRetribution) {
        info!(
            chan_point = %self.cfg.chan_point,
            breach_txid = %breach.breach_txid,
            "breach detected, deferring to retribution"
        );
        self.advance_state(Trigger::Breach, breach.breach_height, None);
    }

    fn handle_block_epoch(&mut self, epoch: BlockEpoch) {
        self.best_height = epoch.height;

        if self.state == ArbitratorState::WaitingFullResolution {
            self.step_epoch_resolvers(epoch.height);
        }

        self.advance_state(Trigger::Chain, epoch.height, None);
    }

    fn handle_spend(&mut self, id: u64, spend: SpendDetail) {
        let pos = match self
            .active_resolvers
            .iter()
            .position(|active| active.id == id && matches!(active.wait, Wait::Spend))
        {
            Some(pos) => pos,
            None => return,
        };
        self.step_resolver(pos, ResolverEvent::Spend(&spend));

        if self.state == ArbitratorState::WaitingFullResolution && self.active_resolvers.is_empty()
        {
            self.advance_state(Trigger::Chain, self.best_height, None);
        }
    }

    fn step_epoch_resolvers(&mut self, height: u32) {
        let eligible: Vec<u64> = self
            .active_resolvers
            .iter()
            .filter(|active| matches!(active.wait, Wait::Epoch(expiry) if height >= expiry))
            .map(|active| active.id)
            .collect();
        for id in eligible {
            if let Some(pos) = self.active_resolvers.iter().position(|a| a.id == id) {
                self.step_resolver(pos, ResolverEvent::Epoch(height));
            }
        }
    }

    /// Walk the state machine until it stops moving. Each transition is
    /// committed before the next step runs; a failed commit halts the walk
    /// and leaves the arbitrator in its prior durable state.
    fn advance_state(&mut self, trigger: Trigger, height: u32, commit_set: Option<&CommitSet>) {
        loop {
            let prior = self.state;
            let next = match self.state_step(trigger, height, commit_set) {
                Ok(next) => next,
                Err(err) => {
                    error!(
                        chan_point = %self.cfg.chan_point,
                        state = %prior,
                        %err,
                        "unable to advance arbitrator state"
                    );
                    return;
                }
            };
            if next == prior {
                return;
            }

            debug_assert!(prior.is_valid_transition(next));
            if let Err(err) = self.log.commit_state(next) {
                error!(
                    chan_point = %self.cfg.chan_point,
                    state = %prior,
                    %err,
                    "unable to commit arbitrator state"
                );
                return;
            }
            debug!(
                chan_point = %self.cfg.chan_point,
                from = %prior,
                to = %next,
                "arbitrator state advanced"
            );
            self.set_state(next);
        }
    }

    fn state_step(
        &mut self,
        trigger: Trigger,
        height: u32,
        commit_set: Option<&CommitSet>,
    ) -> Result<ArbitratorState, ContractError> {
        use ArbitratorState::*;

        let next = match self.state {
            Default => match trigger {
                Trigger::Chain => {
                    if self.should_broadcast_commitment(height) {
                        BroadcastCommit
                    } else {
                        Default
                    }
                }
                Trigger::User => BroadcastCommit,
                Trigger::CoopClose | Trigger::Breach => FullyResolved,
                Trigger::RemoteClose | Trigger::LocalClose => ContractClosed,
            },

            BroadcastCommit => match trigger {
                Trigger::Chain | Trigger::User => self.broadcast_commitment()?,
                Trigger::CoopClose | Trigger::Breach => FullyResolved,
                Trigger::RemoteClose | Trigger::LocalClose => ContractClosed,
            },

            CommitmentBroadcasted => match trigger {
                Trigger::Chain | Trigger::User => CommitmentBroadcasted,
                Trigger::CoopClose | Trigger::Breach => FullyResolved,
                Trigger::RemoteClose | Trigger::LocalClose => ContractClosed,
            },

            ContractClosed => self.start_resolution(commit_set)?,

            WaitingFullResolution => {
                if trigger == Trigger::Chain && self.active_resolvers.is_empty() {
                    FullyResolved
                } else {
                    WaitingFullResolution
                }
            }

            FullyResolved => {
                (self.cfg.mark_channel_resolved)()?;
                FullyResolved
            }
        };

        Ok(next)
    }

    /// The dangling HTLC rule: examine the combined HTLC activity across
    /// all three possible confirmation commitments. Any outgoing HTLC whose
    /// timeout is within the broadcast delta of the current height forces
    /// us on chain, otherwise a pre-image-less HTLC on the counterparty's
    /// commitment could expire with no transaction of ours exposing it.
    fn should_broadcast_commitment(&self, height: u32) -> bool {
        for (set, htlcs) in &self.htlc_sets {
            for htlc in htlcs {
                if htlc.incoming {
                    continue;
                }
                if htlc.refund_timeout <= height + self.cfg.outgoing_broadcast_delta {
                    info!(
                        chan_point = %self.cfg.chan_point,
                        htlc_index = htlc.htlc_index,
                        expiry = htlc.refund_timeout,
                        height,
                        ?set,
                        "outgoing htlc about to expire, going on chain"
                    );
                    return true;
                }
            }
        }
        false
    }

    /// Sign, publish and persist our commitment. A double spend error means
    /// a commitment is already in flight and counts as success; any other
    /// publish error is reported to the caller while the arbitrator still
    /// advances and waits for whichever commitment confirms.
    fn broadcast_commitment(&mut self) -> Result<ArbitratorState, ContractError> {
        let summary = match (self.cfg.force_close_chan)() {
            Ok(summary) => summary,
            Err(err) => {
                if let Some(req) = self.pending_force_close.take() {
                    let _ = req.err_resp.try_send(Err(ContractError::Other(err.to_string())));
                }
                return Err(err);
            }
        };
        let close_tx = summary.close_tx;

        let publish_err = match (self.cfg.publish_tx)(&close_tx) {
            Ok(()) => None,
            Err(PublishError::DoubleSpend) => {
                debug!(
                    chan_point = %self.cfg.chan_point,
                    "commitment already spent the funding output"
                );
                None
            }
            Err(err) => Some(err),
        };

        (self.cfg.mark_commitment_broadcasted)(&close_tx)?;

        if let Some(req) = self.pending_force_close.take() {
            match publish_err {
                None => {
                    let _ = req.close_tx_resp.try_send(close_tx);
                    let _ = req.err_resp.try_send(Ok(()));
                }
                Some(err) => {
                    let _ = req.err_resp.try_send(Err(err.into()));
                }
            }
        }

        Ok(ArbitratorState::CommitmentBroadcasted)
    }

    /// Entry into the resolution phase: fetch the logged resolutions,
    /// cancel upstream whatever can never be claimed on chain, and
    /// materialize one resolver per remaining output.
    fn start_resolution(
        &mut self,
        commit_set: Option<&CommitSet>,
    ) -> Result<ArbitratorState, ContractError> {
        let resolutions = self.log.fetch_contract_resolutions()?;
        let confirmed = match commit_set {
            Some(commit_set) => commit_set.clone(),
            None => self.log.fetch_confirmed_commit_set()?.unwrap_or_default(),
        };

        if resolutions.is_empty() && confirmed.is_empty() {
            return Ok(ArbitratorState::FullyResolved);
        }

        let msgs = self.fail_now_msgs(&resolutions, &confirmed);
        if !msgs.is_empty() {
            debug!(
                chan_point = %self.cfg.chan_point,
                num_msgs = msgs.len(),
                "cancelling htlcs with no on-chain claim"
            );
            (self.cfg.deliver_resolution_msg)(msgs)?;
        }

        let resolvers = self.build_resolvers(&resolutions);
        if !resolvers.is_empty() {
            self.log.insert_unresolved_contracts(&resolvers)?;
        }
        self.launch_resolvers(resolvers);

        Ok(ArbitratorState::WaitingFullResolution)
    }

    /// Immediate FAIL resolutions: outgoing dust on the confirmed
    /// commitment, and outgoing HTLCs that only exist on a commitment that
    /// did not confirm.
    fn fail_now_msgs(
        &self,
        resolutions: &ContractResolutions,
        confirmed: &CommitSet,
    ) -> Vec<ResolutionMsg> {
        let confirmed_htlcs = confirmed.confirmed_htlcs();
        let mut failed: HashSet<u64> = HashSet::new();
        let mut msgs = Vec::new();

        for htlc in confirmed_htlcs {
            if !htlc.incoming && htlc.is_dust() && failed.insert(htlc.htlc_index) {
                msgs.push(self.fail_msg(htlc.htlc_index));
            }
        }

        for (key, htlcs) in &self.combined_htlc_sets(confirmed) {
            if Some(*key) == confirmed.conf_commit_key {
                continue;
            }
            for htlc in htlcs {
                if htlc.incoming {
                    continue;
                }
                let on_confirmed = confirmed_htlcs
                    .iter()
                    .any(|c| !c.incoming && c.htlc_index == htlc.htlc_index);
                let has_resolution = resolutions
                    .htlc_resolutions
                    .outgoing
                    .iter()
                    .any(|r| r.htlc_index == htlc.htlc_index);
                if !on_confirmed && !has_resolution && failed.insert(htlc.htlc_index) {
                    msgs.push(self.fail_msg(htlc.htlc_index));
                }
            }
        }

        msgs
    }

    // The confirmed commit set is authoritative, but HTLC updates received
    // off-chain before the close fill in sets the watcher did not report.
    fn combined_htlc_sets(&self, confirmed: &CommitSet) -> HashMap<HtlcSetKey, Vec<Htlc>> {
        let mut sets = self.htlc_sets.clone();
        for (key, htlcs) in &confirmed.htlc_sets {
            sets.insert(*key, htlcs.clone());
        }
        sets
    }

    fn fail_msg(&self, htlc_index: u64) -> ResolutionMsg {
        ResolutionMsg {
            source_chan: self.cfg.short_chan_id,
            htlc_index,
            failure: Some(FailureReason::PermanentChannelFailure),
            pre_image: None,
        }
    }

    fn build_resolvers(&self, resolutions: &ContractResolutions) -> Vec<ContractResolver> {
        let chan_point = self.cfg.chan_point;
        let mut resolvers = Vec::new();

        if let Some(resolution) = &resolutions.commit_resolution {
            resolvers.push(ContractResolver::CommitSweep(CommitSweepResolver {
                chan_point,
                resolution: resolution.clone(),
            }));
        }
        for htlc in &resolutions.htlc_resolutions.outgoing {
            resolvers.push(ContractResolver::OutgoingContest(OutgoingContestResolver {
                chan_point,
                htlc: htlc.clone(),
            }));
        }
        for htlc in &resolutions.htlc_resolutions.incoming {
            resolvers.push(ContractResolver::IncomingContest(IncomingContestResolver {
                chan_point,
                htlc: htlc.clone(),
            }));
        }

        resolvers
    }

    /// Rebuild the resolver set from the log after a restart, supplementing
    /// each with the runtime information derivable from the confirmed
    /// commit set.
    fn relaunch_resolvers(&mut self) -> Result<(), ContractError> {
        let mut resolvers = self.log.fetch_unresolved_contracts()?;
        let confirmed = self.log.fetch_confirmed_commit_set()?.unwrap_or_default();
        for resolver in &mut resolvers {
            resolver.supplement(confirmed.confirmed_htlcs());
        }

        info!(
            chan_point = %self.cfg.chan_point,
            num_resolvers = resolvers.len(),
            "relaunching resolvers"
        );
        self.launch_resolvers(resolvers);
        Ok(())
    }

    fn launch_resolvers(&mut self, resolvers: Vec<ContractResolver>) {
        for resolver in resolvers {
            let id = self.next_resolver_id;
            self.next_resolver_id += 1;
            self.active_resolvers.push(ActiveResolver {
                id,
                resolver,
                // Replaced by the launch step before any event can route.
                wait: Wait::Epoch(u32::MAX),
            });
            let pos = self.active_resolvers.len() - 1;
            self.step_resolver(pos, ResolverEvent::Launch);
        }
    }

    fn step_resolver(&mut self, pos: usize, event: ResolverEvent) {
        let ctx = ResolverCtx {
            cfg: &self.cfg,
            best_height: self.best_height,
        };
        let active = &mut self.active_resolvers[pos];
        let progress = match active.resolver.step(event, &ctx) {
            Ok(progress) => progress,
            Err(err) => {
                error!(
                    chan_point = %self.cfg.chan_point,
                    kind = %active.resolver.kind(),
                    %err,
                    "resolver step failed"
                );
                return;
            }
        };

        match progress {
            ResolverProgress::AwaitEpoch(expiry) => {
                active.wait = Wait::Epoch(expiry);
            }
            ResolverProgress::AwaitSpend(outpoint) => {
                active.wait = Wait::Spend;
                let id = active.id;
                self.watch_spend(id, &outpoint);
            }
            ResolverProgress::Replace(replacement) => {
                let old = self.active_resolvers[pos].resolver.clone();
                if let Err(err) = self.log.swap_contract(&old, &replacement) {
                    error!(%err, "unable to swap resolver in log");
                    return;
                }
                self.active_resolvers[pos].resolver = *replacement;
                self.step_resolver(pos, ResolverEvent::Launch);
            }
            ResolverProgress::Done => {
                let active = self.active_resolvers.remove(pos);
                if let Err(err) = self.log.resolve_contract(&active.resolver) {
                    error!(%err, "unable to mark resolver resolved");
                }
                debug!(
                    chan_point = %self.cfg.chan_point,
                    kind = %active.resolver.kind(),
                    "resolver finished"
                );
            }
        }

        self.update_resolver_report();
    }

    fn watch_spend(&self, id: u64, outpoint: &OutPoint) {
        let mut rx = self.cfg.notifier.register_spend(outpoint);
        let tx = self.spend_tx.clone();
        let quit = self.quit.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe_spend = rx.recv() => match maybe_spend {
                        Some(spend) => {
                            if tx.send((id, spend)).await.is_err() {
                                return;
                            }
                        }
                        None => return,
                    },
                    _ = quit.cancelled() => return,
                }
            }
        });
    }
}
