use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chain::{Hash256, MilliAtoms, OutPoint, ShortChannelId, SpendDetail};
use crate::channel::{
    CommitOutputResolution, Htlc, IncomingHtlcResolution, OutgoingHtlcResolution,
};

use super::arbitrator::ChannelArbitratorConfig;
use super::log::ContractError;

/// Why an HTLC is being failed back to the upstream link.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FailureReason {
    /// The HTLC could never be claimed on chain.
    PermanentChannelFailure,
    /// The HTLC was swept through its timeout path.
    HtlcTimedOut,
}

/// Instruction to the forwarding switch: fail or settle the upstream leg of
/// an HTLC that was resolved on chain.
#[derive(Clone, Debug)]
pub struct ResolutionMsg {
    pub source_chan: ShortChannelId,
    pub htlc_index: u64,
    pub failure: Option<FailureReason>,
    pub pre_image: Option<Hash256>,
}

/// A sweep handed to the utxo nursery: it waits out time locks and
/// rebroadcasts until the output is in the wallet.
#[derive(Clone, Debug)]
pub struct IncubationRequest {
    pub chan_point: OutPoint,
    pub commit_resolution: Option<CommitOutputResolution>,
    pub outgoing_htlc: Option<OutgoingHtlcResolution>,
    pub incoming_htlc: Option<IncomingHtlcResolution>,
    pub broadcast_height: u32,
}

/// What a resolver needs from the arbitrator while stepping.
pub struct ResolverCtx<'a> {
    pub cfg: &'a ChannelArbitratorConfig,
    pub best_height: u32,
}

/// The input driving a resolver step.
pub enum ResolverEvent<'a> {
    /// First step after creation or relaunch.
    Launch,
    /// A new block at the given height.
    Epoch(u32),
    /// The output the resolver was waiting on has been spent.
    Spend(&'a SpendDetail),
}

/// What a resolver is waiting for after a step.
#[derive(Debug)]
pub enum ResolverProgress {
    AwaitSpend(OutPoint),
    AwaitEpoch(u32),
    /// The resolver transformed; the arbitrator swaps it in the log and
    /// launches the replacement.
    Replace(Box<ContractResolver>),
    /// Terminal, nothing left to watch.
    Done,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResolverKind {
    CommitSweep,
    OutgoingContest,
    OutgoingTimeout,
    IncomingContest,
    Success,
}

impl ::core::fmt::Display for ResolverKind {
    fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        let name = match self {
            ResolverKind::CommitSweep => "CommitSweep",
            ResolverKind::OutgoingContest => "OutgoingContest",
            ResolverKind::OutgoingTimeout => "OutgoingTimeout",
            ResolverKind::IncomingContest => "IncomingContest",
            ResolverKind::Success => "Success",
        };
        write!(f, "{}", name)
    }
}

/// Sweeps the to-self output of our own commitment once its CSV delay
/// matures.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitSweepResolver {
    pub chan_point: OutPoint,
    pub resolution: CommitOutputResolution,
}

/// Watches an outgoing HTLC on the confirmed commitment until its expiry
/// height, then hands it to the timeout path.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutgoingContestResolver {
    pub chan_point: OutPoint,
    pub htlc: OutgoingHtlcResolution,
}

/// Sweeps an expired outgoing HTLC and fails it back upstream once the
/// sweep confirms.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutgoingTimeoutResolver {
    pub chan_point: OutPoint,
    pub htlc: OutgoingHtlcResolution,
    /// 1 while waiting for the HTLC output spend, 2 while waiting for the
    /// second level transaction to be swept.
    pub stage: u8,
}

/// Watches an incoming HTLC for its pre-image to become known before the
/// expiry height.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IncomingContestResolver {
    pub chan_point: OutPoint,
    pub htlc: IncomingHtlcResolution,
}

/// Sweeps an incoming HTLC whose pre-image is known, settling it upstream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SuccessResolver {
    pub chan_point: OutPoint,
    pub htlc: IncomingHtlcResolution,
    pub pre_image: Hash256,
    pub stage: u8,
}

/// The closed family of per-output resolvers. A resolver is a small state
/// machine the arbitrator drives: every step reports what it waits for
/// next, or that it finished (possibly transforming into a successor).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ContractResolver {
    CommitSweep(CommitSweepResolver),
    OutgoingContest(OutgoingContestResolver),
    OutgoingTimeout(OutgoingTimeoutResolver),
    IncomingContest(IncomingContestResolver),
    Success(SuccessResolver),
}

impl ContractResolver {
    pub fn kind(&self) -> ResolverKind {
        match self {
            ContractResolver::CommitSweep(_) => ResolverKind::CommitSweep,
            ContractResolver::OutgoingContest(_) => ResolverKind::OutgoingContest,
            ContractResolver::OutgoingTimeout(_) => ResolverKind::OutgoingTimeout,
            ContractResolver::IncomingContest(_) => ResolverKind::IncomingContest,
            ContractResolver::Success(_) => ResolverKind::Success,
        }
    }

    /// Stable log key. Resolvers for the same output share a key so a
    /// transformation replaces its predecessor in place.
    pub fn resolver_key(&self) -> Vec<u8> {
        let outpoint = match self {
            ContractResolver::CommitSweep(r) => r.resolution.self_outpoint,
            ContractResolver::OutgoingContest(r) => r.htlc.claim_outpoint,
            ContractResolver::OutgoingTimeout(r) => r.htlc.claim_outpoint,
            ContractResolver::IncomingContest(r) => r.htlc.claim_outpoint,
            ContractResolver::Success(r) => r.htlc.claim_outpoint,
        };
        outpoint.to_bytes().to_vec()
    }

    pub fn htlc_index(&self) -> Option<u64> {
        match self {
            ContractResolver::CommitSweep(_) => None,
            ContractResolver::OutgoingContest(r) => Some(r.htlc.htlc_index),
            ContractResolver::OutgoingTimeout(r) => Some(r.htlc.htlc_index),
            ContractResolver::IncomingContest(r) => Some(r.htlc.htlc_index),
            ContractResolver::Success(r) => Some(r.htlc.htlc_index),
        }
    }

    pub fn htlc_amount(&self) -> Option<MilliAtoms> {
        match self {
            ContractResolver::CommitSweep(_) => None,
            ContractResolver::OutgoingContest(r) => Some(r.htlc.amount),
            ContractResolver::OutgoingTimeout(r) => Some(r.htlc.amount),
            ContractResolver::IncomingContest(r) => Some(r.htlc.amount),
            ContractResolver::Success(r) => Some(r.htlc.amount),
        }
    }

    /// A persisted resolver only carries what the log wrote. Whatever can
    /// be re-derived at runtime, like the HTLC amount on the confirmed
    /// commitment, is refilled here after a restart.
    pub fn supplement(&mut self, confirmed_htlcs: &[Htlc]) {
        let (index, amount, incoming) = match self {
            ContractResolver::CommitSweep(_) => return,
            ContractResolver::OutgoingContest(r) => (r.htlc.htlc_index, &mut r.htlc.amount, false),
            ContractResolver::OutgoingTimeout(r) => (r.htlc.htlc_index, &mut r.htlc.amount, false),
            ContractResolver::IncomingContest(r) => (r.htlc.htlc_index, &mut r.htlc.amount, true),
            ContractResolver::Success(r) => (r.htlc.htlc_index, &mut r.htlc.amount, true),
        };
        if let Some(htlc) = confirmed_htlcs
            .iter()
            .find(|h| h.incoming == incoming && h.htlc_index == index)
        {
            *amount = htlc.amount;
        }
    }

    pub fn step(
        &mut self,
        event: ResolverEvent,
        ctx: &ResolverCtx,
    ) -> Result<ResolverProgress, ContractError> {
        match self {
            ContractResolver::CommitSweep(r) => r.step(event, ctx),
            ContractResolver::OutgoingContest(r) => r.step(event, ctx),
            ContractResolver::OutgoingTimeout(r) => r.step(event, ctx),
            ContractResolver::IncomingContest(r) => r.step(event, ctx),
            ContractResolver::Success(r) => r.step(event, ctx),
        }
    }
}

impl CommitSweepResolver {
    fn step(
        &mut self,
        event: ResolverEvent,
        ctx: &ResolverCtx,
    ) -> Result<ResolverProgress, ContractError> {
        match event {
            ResolverEvent::Launch => {
                (ctx.cfg.incubate_outputs)(&IncubationRequest {
                    chan_point: self.chan_point,
                    commit_resolution: Some(self.resolution.clone()),
                    outgoing_htlc: None,
                    incoming_htlc: None,
                    broadcast_height: ctx.best_height,
                })?;
                Ok(ResolverProgress::AwaitSpend(self.resolution.self_outpoint))
            }
            ResolverEvent::Spend(_) => Ok(ResolverProgress::Done),
            ResolverEvent::Epoch(_) => {
                Ok(ResolverProgress::AwaitSpend(self.resolution.self_outpoint))
            }
        }
    }
}

impl OutgoingContestResolver {
    fn step(
        &mut self,
        event: ResolverEvent,
        _ctx: &ResolverCtx,
    ) -> Result<ResolverProgress, ContractError> {
        let height = match event {
            ResolverEvent::Launch => return Ok(ResolverProgress::AwaitEpoch(self.htlc.expiry)),
            ResolverEvent::Epoch(height) => height,
            ResolverEvent::Spend(_) => return Ok(ResolverProgress::AwaitEpoch(self.htlc.expiry)),
        };

        if height < self.htlc.expiry {
            return Ok(ResolverProgress::AwaitEpoch(self.htlc.expiry));
        }

        debug!(
            htlc_index = self.htlc.htlc_index,
            expiry = self.htlc.expiry,
            "outgoing htlc expired, sweeping through timeout path"
        );
        Ok(ResolverProgress::Replace(Box::new(
            ContractResolver::OutgoingTimeout(OutgoingTimeoutResolver {
                chan_point: self.chan_point,
                htlc: self.htlc.clone(),
                stage: 1,
            }),
        )))
    }
}

impl OutgoingTimeoutResolver {
    fn step(
        &mut self,
        event: ResolverEvent,
        ctx: &ResolverCtx,
    ) -> Result<ResolverProgress, ContractError> {
        match event {
            ResolverEvent::Launch => {
                (ctx.cfg.incubate_outputs)(&IncubationRequest {
                    chan_point: self.chan_point,
                    commit_resolution: None,
                    outgoing_htlc: Some(self.htlc.clone()),
                    incoming_htlc: None,
                    broadcast_height: ctx.best_height,
                })?;
                Ok(ResolverProgress::AwaitSpend(self.htlc.claim_outpoint))
            }
            ResolverEvent::Spend(_) if self.stage == 1 => {
                // The htlc output is gone from the commitment; the upstream
                // link can fail the htlc now.
                (ctx.cfg.deliver_resolution_msg)(vec![ResolutionMsg {
                    source_chan: ctx.cfg.short_chan_id,
                    htlc_index: self.htlc.htlc_index,
                    failure: Some(FailureReason::HtlcTimedOut),
                    pre_image: None,
                }])?;

                match &self.htlc.signed_timeout_tx {
                    // Our commitment confirmed: the sweep goes through a
                    // second level transaction which must itself be swept.
                    Some(timeout_tx) => {
                        self.stage = 2;
                        Ok(ResolverProgress::AwaitSpend(OutPoint::new(
                            timeout_tx.txid(),
                            0,
                        )))
                    }
                    None => Ok(ResolverProgress::Done),
                }
            }
            ResolverEvent::Spend(_) => Ok(ResolverProgress::Done),
            ResolverEvent::Epoch(_) => Ok(ResolverProgress::AwaitSpend(self.htlc.claim_outpoint)),
        }
    }
}

impl IncomingContestResolver {
    fn step(
        &mut self,
        event: ResolverEvent,
        ctx: &ResolverCtx,
    ) -> Result<ResolverProgress, ContractError> {
        if let Some(pre_image) = (ctx.cfg.lookup_pre_image)(&self.htlc.payment_hash) {
            return Ok(ResolverProgress::Replace(Box::new(
                ContractResolver::Success(SuccessResolver {
                    chan_point: self.chan_point,
                    htlc: self.htlc.clone(),
                    pre_image,
                    stage: 1,
                }),
            )));
        }

        match event {
            ResolverEvent::Epoch(height) if height >= self.htlc.expiry => {
                // Expired without a pre-image: the output is the remote
                // side's to reclaim, nothing left for us to do.
                debug!(
                    htlc_index = self.htlc.htlc_index,
                    "incoming htlc expired without pre-image"
                );
                Ok(ResolverProgress::Done)
            }
            _ => Ok(ResolverProgress::AwaitEpoch(self.htlc.expiry)),
        }
    }
}

impl SuccessResolver {
    fn step(
        &mut self,
        event: ResolverEvent,
        ctx: &ResolverCtx,
    ) -> Result<ResolverProgress, ContractError> {
        match event {
            ResolverEvent::Launch => {
                (ctx.cfg.deliver_resolution_msg)(vec![ResolutionMsg {
                    source_chan: ctx.cfg.short_chan_id,
                    htlc_index: self.htlc.htlc_index,
                    failure: None,
                    pre_image: Some(self.pre_image),
                }])?;
                (ctx.cfg.incubate_outputs)(&IncubationRequest {
                    chan_point: self.chan_point,
                    commit_resolution: None,
                    outgoing_htlc: None,
                    incoming_htlc: Some(self.htlc.clone()),
                    broadcast_height: ctx.best_height,
                })?;
                Ok(ResolverProgress::AwaitSpend(self.htlc.claim_outpoint))
            }
            ResolverEvent::Spend(_) if self.stage == 1 => match &self.htlc.signed_success_tx {
                Some(success_tx) => {
                    self.stage = 2;
                    Ok(ResolverProgress::AwaitSpend(OutPoint::new(
                        success_tx.txid(),
                        0,
                    )))
                }
                None => Ok(ResolverProgress::Done),
            },
            ResolverEvent::Spend(_) => Ok(ResolverProgress::Done),
            ResolverEvent::Epoch(_) => Ok(ResolverProgress::AwaitSpend(self.htlc.claim_outpoint)),
        }
    }
}
