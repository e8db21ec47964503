use secp256k1::{ecdsa::Signature, Message, PublicKey, SecretKey, SECP256K1};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::chain::{sha256, Atoms, Hash256, MilliAtoms, OutPoint, Transaction, TxIn, TxOut};
use crate::store::StoreError;

use super::revocation::RevocationError;
use super::store::ChannelStateStore;
use super::types::{
    CircuitKey, CommitDiff, CommitSigMsg, Commitment, ForwardingPackage, Htlc, LogUpdate,
    OpenChannel, UpdateMsg,
};

/// Size estimate used to derive the commitment fee from the negotiated
/// fee-per-kB. Scripts are opaque to the core, so the estimate is in terms
/// of the fixed transaction skeleton plus one output per materialized HTLC.
const BASE_COMMITMENT_SIZE: u64 = 300;
const HTLC_OUTPUT_SIZE: u64 = 40;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("invalid channel state: {0}")]
    InvalidState(String),
    #[error("the htlc count exceeds the limit of this channel")]
    HtlcCountExceedLimit,
    #[error("the htlc value in flight exceeds the limit of this channel")]
    HtlcValueInFlightExceedLimit,
    #[error("the htlc amount is below the channel minimum")]
    HtlcAmountTooLow,
    #[error("balance insufficient to cover the htlc and the channel reserve")]
    InsufficientBalance,
    #[error("unknown htlc index {0}")]
    UnknownHtlc(u64),
    #[error("pre-image does not match the htlc payment hash")]
    PreimageMismatch,
    #[error("counterparty commitment signature is invalid")]
    InvalidCommitSig,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("revocation error: {0}")]
    Revocation(#[from] RevocationError),
}

/// Per-side lifecycle of the off-chain protocol.
#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum MachineState {
    /// Updates flow and signatures are exchanged.
    Open,
    /// A shutdown was sent or received, the channel drains to a final
    /// cooperative transaction.
    Closing,
    /// The final cooperative close transaction is signed.
    Closed,
    /// A commitment transaction was broadcast unilaterally.
    ForceClosed,
}

/// How the to-self output of a broadcast commitment is reclaimed: wait out
/// the CSV delay, then sweep.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitOutputResolution {
    pub self_outpoint: OutPoint,
    pub amount: Atoms,
    pub maturity_delay: u32,
}

/// Everything needed to resolve an outgoing HTLC after our commitment hits
/// the chain: contest until expiry, then sweep through the timeout path.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutgoingHtlcResolution {
    pub htlc_index: u64,
    pub amount: MilliAtoms,
    pub expiry: u32,
    pub claim_outpoint: OutPoint,
    /// Pre-signed second-level transaction, present when our own commitment
    /// confirmed. Absent for the remote commitment, where the output is
    /// claimable directly.
    pub signed_timeout_tx: Option<Transaction>,
}

/// Everything needed to resolve an incoming HTLC: sweep through the success
/// path once the pre-image is known, or let it time out.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct IncomingHtlcResolution {
    pub htlc_index: u64,
    pub amount: MilliAtoms,
    pub expiry: u32,
    pub payment_hash: Hash256,
    pub claim_outpoint: OutPoint,
    pub signed_success_tx: Option<Transaction>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct HtlcResolutions {
    pub incoming: Vec<IncomingHtlcResolution>,
    pub outgoing: Vec<OutgoingHtlcResolution>,
}

impl HtlcResolutions {
    pub fn is_empty(&self) -> bool {
        self.incoming.is_empty() && self.outgoing.is_empty()
    }
}

/// The product of a local force close: the signed commitment to broadcast
/// and the material to resolve each of its outputs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalForceCloseSummary {
    pub chan_point: OutPoint,
    pub close_tx: Transaction,
    pub commit_resolution: Option<CommitOutputResolution>,
    pub htlc_resolutions: HtlcResolutions,
}

struct PendingUpdate {
    log_update: LogUpdate,
    circuit: Option<CircuitKey>,
}

/// The per-channel commitment state machine. Single writer: exactly one
/// task drives a channel, the store transaction discipline covers the rest.
///
/// The machine queues local updates, folds them into signed commitments,
/// and mirrors every accepted transition into the channel state store
/// before reporting success.
pub struct ChannelMachine {
    channel: OpenChannel,
    state: MachineState,
    multi_sig_secret: SecretKey,
    pending_updates: Vec<PendingUpdate>,
    local_log_index: u64,
    local_htlc_index: u64,
}

impl ChannelMachine {
    pub fn new(channel: OpenChannel, multi_sig_secret: SecretKey) -> Self {
        let local_log_index = channel.local_commitment.local_log_index;
        let local_htlc_index = channel.local_commitment.local_htlc_index;
        Self {
            channel,
            state: MachineState::Open,
            multi_sig_secret,
            pending_updates: Vec::new(),
            local_log_index,
            local_htlc_index,
        }
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    pub fn channel(&self) -> &OpenChannel {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut OpenChannel {
        &mut self.channel
    }

    fn check_open(&self) -> Result<(), ChannelError> {
        match self.state {
            MachineState::Open | MachineState::Closing => Ok(()),
            state => Err(ChannelError::InvalidState(format!(
                "channel updates not allowed in state {:?}",
                state
            ))),
        }
    }

    /// Queue an outgoing HTLC. Indices are assigned here and are strictly
    /// increasing for the lifetime of the channel; the constraints checked
    /// are the ones the counterparty imposed on us.
    pub fn add_htlc(
        &mut self,
        amount: MilliAtoms,
        payment_hash: Hash256,
        refund_timeout: u32,
        onion_blob: Vec<u8>,
        incoming_circuit: Option<CircuitKey>,
    ) -> Result<u64, ChannelError> {
        if self.state != MachineState::Open {
            return Err(ChannelError::InvalidState(
                "cannot add htlc on a closing channel".to_string(),
            ));
        }

        let constraints = &self.channel.remote_chan_cfg.constraints;
        if amount < constraints.min_htlc {
            return Err(ChannelError::HtlcAmountTooLow);
        }

        let pending_adds: Vec<&PendingUpdate> = self
            .pending_updates
            .iter()
            .filter(|u| matches!(u.log_update.update_msg, UpdateMsg::AddHtlc { .. }))
            .collect();

        let committed_outgoing = self
            .channel
            .remote_commitment
            .htlcs
            .iter()
            .filter(|h| !h.incoming)
            .count();
        if committed_outgoing + pending_adds.len() + 1 > constraints.max_accepted_htlcs as usize {
            return Err(ChannelError::HtlcCountExceedLimit);
        }

        let in_flight: MilliAtoms = self
            .channel
            .remote_commitment
            .htlcs
            .iter()
            .filter(|h| !h.incoming)
            .map(|h| h.amount)
            .chain(pending_adds.iter().filter_map(|u| {
                match u.log_update.update_msg {
                    UpdateMsg::AddHtlc { amount, .. } => Some(amount),
                    _ => None,
                }
            }))
            .sum();
        if in_flight + amount > constraints.max_pending_amount {
            return Err(ChannelError::HtlcValueInFlightExceedLimit);
        }

        let reserve_matoms = constraints.chan_reserve * 1000;
        let available = self
            .channel
            .remote_commitment
            .local_balance
            .saturating_sub(in_flight);
        if available < amount + reserve_matoms {
            return Err(ChannelError::InsufficientBalance);
        }

        let htlc_index = self.local_htlc_index;
        self.local_htlc_index += 1;
        let log_index = self.local_log_index;
        self.local_log_index += 1;

        self.pending_updates.push(PendingUpdate {
            log_update: LogUpdate {
                log_index,
                update_msg: UpdateMsg::AddHtlc {
                    htlc_id: htlc_index,
                    amount,
                    payment_hash,
                    expiry: refund_timeout,
                    onion_blob,
                },
            },
            circuit: incoming_circuit,
        });

        debug!(
            htlc_index,
            amount,
            chan_point = %self.channel.funding_outpoint,
            "queued outgoing htlc"
        );
        Ok(htlc_index)
    }

    /// Queue the settlement of an incoming HTLC with its pre-image.
    pub fn settle_htlc(&mut self, htlc_index: u64, pre_image: Hash256) -> Result<(), ChannelError> {
        self.check_open()?;

        let htlc = self
            .channel
            .local_commitment
            .htlcs
            .iter()
            .find(|h| h.incoming && h.htlc_index == htlc_index)
            .ok_or(ChannelError::UnknownHtlc(htlc_index))?;
        if Hash256::hash(pre_image) != htlc.payment_hash {
            return Err(ChannelError::PreimageMismatch);
        }

        let log_index = self.local_log_index;
        self.local_log_index += 1;
        self.pending_updates.push(PendingUpdate {
            log_update: LogUpdate {
                log_index,
                update_msg: UpdateMsg::SettleHtlc {
                    htlc_id: htlc_index,
                    pre_image,
                },
            },
            circuit: None,
        });
        Ok(())
    }

    /// Queue the failure of an incoming HTLC back to the sender.
    pub fn fail_htlc(&mut self, htlc_index: u64, reason: Vec<u8>) -> Result<(), ChannelError> {
        self.check_open()?;

        self.channel
            .local_commitment
            .htlcs
            .iter()
            .find(|h| h.incoming && h.htlc_index == htlc_index)
            .ok_or(ChannelError::UnknownHtlc(htlc_index))?;

        let log_index = self.local_log_index;
        self.local_log_index += 1;
        self.pending_updates.push(PendingUpdate {
            log_update: LogUpdate {
                log_index,
                update_msg: UpdateMsg::FailHtlc {
                    htlc_id: htlc_index,
                    reason,
                },
            },
            circuit: None,
        });
        Ok(())
    }

    /// Fold the queued updates into the counterparty's next commitment, sign
    /// it, and stage the diff in the store. Returns the signature message to
    /// put on the wire.
    pub fn sign_next_commitment(
        &mut self,
        store: &impl ChannelStateStore,
    ) -> Result<CommitSigMsg, ChannelError> {
        self.check_open()?;

        let prev = &self.channel.remote_commitment;
        let mut htlcs = prev.htlcs.clone();
        let mut local_balance = prev.local_balance;
        let mut remote_balance = prev.remote_balance;

        for update in &self.pending_updates {
            match &update.log_update.update_msg {
                UpdateMsg::AddHtlc {
                    htlc_id,
                    amount,
                    payment_hash,
                    expiry,
                    onion_blob,
                } => {
                    local_balance -= amount;
                    htlcs.push(Htlc {
                        signature: Vec::new(),
                        incoming: false,
                        amount: *amount,
                        payment_hash: *payment_hash,
                        refund_timeout: *expiry,
                        output_index: -1,
                        log_index: update.log_update.log_index,
                        htlc_index: *htlc_id,
                        onion_blob: onion_blob.clone(),
                    });
                }
                UpdateMsg::SettleHtlc { htlc_id, .. } => {
                    let htlc = remove_htlc(&mut htlcs, *htlc_id, true)?;
                    local_balance += htlc.amount;
                }
                UpdateMsg::FailHtlc { htlc_id, .. } => {
                    let htlc = remove_htlc(&mut htlcs, *htlc_id, true)?;
                    remote_balance += htlc.amount;
                }
            }
        }

        let height = prev.commit_height + 1;
        let fee_per_kb = prev.fee_per_kb;
        let mut commitment = build_commitment(
            &self.channel,
            height,
            local_balance,
            remote_balance,
            fee_per_kb,
            htlcs,
            false,
        );
        commitment.local_log_index = self.local_log_index;
        commitment.local_htlc_index = self.local_htlc_index;
        commitment.remote_log_index = prev.remote_log_index;
        commitment.remote_htlc_index = prev.remote_htlc_index;

        let commit_sig = sign_tx(&commitment.commit_tx, &self.multi_sig_secret);
        let htlc_sigs = commitment
            .htlcs
            .iter()
            .filter(|h| !h.is_dust())
            .map(|h| sign_htlc_output(&commitment.commit_tx, h, &self.multi_sig_secret))
            .collect();
        commitment.commit_sig = commit_sig.clone();

        let sig_msg = CommitSigMsg {
            chan_id: self.channel.funding_outpoint.txid,
            commit_sig,
            htlc_sigs,
        };

        let diff = CommitDiff {
            commitment,
            commit_sig: sig_msg.clone(),
            log_updates: self
                .pending_updates
                .iter()
                .map(|u| u.log_update.clone())
                .collect(),
            opened_circuit_keys: self
                .pending_updates
                .iter()
                .filter_map(|u| u.circuit)
                .collect(),
            closed_circuit_keys: Vec::new(),
        };

        store.append_remote_commit_chain(&mut self.channel, diff)?;
        self.pending_updates.clear();

        Ok(sig_msg)
    }

    /// Validate and persist a commitment the counterparty signed for us. The
    /// store rejects any height that is not exactly one above the current.
    pub fn receive_new_commitment(
        &mut self,
        store: &impl ChannelStateStore,
        commitment: Commitment,
    ) -> Result<(), ChannelError> {
        self.check_open()?;

        let remote_key = self.channel.remote_chan_cfg.multi_sig_key.pub_key;
        if !verify_tx_sig(&commitment.commit_tx, &commitment.commit_sig, &remote_key) {
            return Err(ChannelError::InvalidCommitSig);
        }

        store.update_commitment(&mut self.channel, commitment)?;
        Ok(())
    }

    /// Reveal our revocation material for the commitment at `height`,
    /// rendering it unpublishable without penalty.
    pub fn revoke_commitment(&self, height: u64) -> Result<(Hash256, PublicKey), ChannelError> {
        let pre_image = self.channel.revocation_producer.at_index(height)?;
        let next_point = commitment_point(&self.channel.revocation_producer.at_index(height + 2)?);
        Ok((pre_image, next_point))
    }

    /// Process the counterparty's revocation of its previous commitment:
    /// absorb the pre-image, rotate the revocation points, and lock in the
    /// staged diff. The returned forwarding package is the switch's to
    /// deliver.
    pub fn receive_revocation(
        &mut self,
        store: &impl ChannelStateStore,
        pre_image: Hash256,
        next_revocation_point: PublicKey,
    ) -> Result<ForwardingPackage, ChannelError> {
        self.check_open()?;

        let diff = store.remote_commit_chain_tip(&self.channel)?;
        self.channel.revocation_store.add_next_entry(pre_image)?;

        self.channel.remote_current_revocation = self.channel.remote_next_revocation;
        self.channel.remote_next_revocation = Some(next_revocation_point);

        let (adds, settle_fails): (Vec<LogUpdate>, Vec<LogUpdate>) = diff
            .log_updates
            .into_iter()
            .partition(|u| matches!(u.update_msg, UpdateMsg::AddHtlc { .. }));

        let fwd_pkg = ForwardingPackage::new(
            self.channel.short_chan_id(),
            self.channel.remote_commitment.commit_height,
            adds,
            settle_fails,
        );

        store.advance_commit_chain_tail(&mut self.channel, fwd_pkg.clone())?;
        Ok(fwd_pkg)
    }

    /// A shutdown message moved the channel into the draining phase.
    pub fn shutdown(&mut self) -> Result<(), ChannelError> {
        match self.state {
            MachineState::Open => {
                self.state = MachineState::Closing;
                Ok(())
            }
            MachineState::Closing => Ok(()),
            state => Err(ChannelError::InvalidState(format!(
                "cannot shut down channel in state {:?}",
                state
            ))),
        }
    }

    /// Produce the final cooperative close transaction once the channel has
    /// drained.
    pub fn complete_cooperative_close(
        &mut self,
        fee: Atoms,
    ) -> Result<Transaction, ChannelError> {
        if self.state != MachineState::Closing {
            return Err(ChannelError::InvalidState(
                "cooperative close requires a prior shutdown".to_string(),
            ));
        }
        if !self.channel.local_commitment.htlcs.is_empty() {
            return Err(ChannelError::InvalidState(
                "cooperative close with htlcs still pending".to_string(),
            ));
        }

        let commitment = &self.channel.local_commitment;
        let mut local_out = commitment.local_balance / 1000;
        let mut remote_out = commitment.remote_balance / 1000;
        if self.channel.is_initiator {
            local_out = local_out.saturating_sub(fee);
        } else {
            remote_out = remote_out.saturating_sub(fee);
        }

        let mut outputs = Vec::new();
        if local_out > self.channel.local_chan_cfg.constraints.dust_limit {
            outputs.push(TxOut {
                value: local_out,
                pk_script: payment_script(&self.channel.local_chan_cfg.payment_base_point.pub_key),
            });
        }
        if remote_out > self.channel.remote_chan_cfg.constraints.dust_limit {
            outputs.push(TxOut {
                value: remote_out,
                pk_script: payment_script(&self.channel.remote_chan_cfg.payment_base_point.pub_key),
            });
        }

        let close_tx = Transaction {
            version: 2,
            inputs: vec![TxIn {
                previous_outpoint: self.channel.funding_outpoint,
                signature_script: Vec::new(),
                sequence: u32::MAX,
            }],
            outputs,
            lock_time: 0,
        };

        self.state = MachineState::Closed;
        Ok(close_tx)
    }

    /// Unilaterally close: return the current signed commitment and the
    /// resolution material for each of its outputs. The caller (the channel
    /// arbitrator) owns broadcast and sweep orchestration.
    pub fn force_close(&mut self) -> Result<LocalForceCloseSummary, ChannelError> {
        if matches!(self.state, MachineState::Closed) {
            return Err(ChannelError::InvalidState(
                "channel already cooperatively closed".to_string(),
            ));
        }
        self.state = MachineState::ForceClosed;
        Ok(force_close_summary(&self.channel, &self.multi_sig_secret))
    }
}

fn remove_htlc(htlcs: &mut Vec<Htlc>, htlc_index: u64, incoming: bool) -> Result<Htlc, ChannelError> {
    let pos = htlcs
        .iter()
        .position(|h| h.incoming == incoming && h.htlc_index == htlc_index)
        .ok_or(ChannelError::UnknownHtlc(htlc_index))?;
    Ok(htlcs.remove(pos))
}

/// Derive the public commitment point for a per-commitment secret.
pub fn commitment_point(secret: &Hash256) -> PublicKey {
    let key = SecretKey::from_slice(secret.as_ref()).expect("valid commitment secret");
    key.public_key(SECP256K1)
}

fn sign_tx(tx: &Transaction, key: &SecretKey) -> Vec<u8> {
    let digest = tx.txid();
    let msg = Message::from_digest_slice(digest.as_ref()).expect("32 byte digest");
    SECP256K1
        .sign_ecdsa(&msg, key)
        .serialize_compact()
        .to_vec()
}

fn sign_htlc_output(commit_tx: &Transaction, htlc: &Htlc, key: &SecretKey) -> Vec<u8> {
    let mut preimage = commit_tx.txid().into_inner().to_vec();
    preimage.extend_from_slice(&htlc.output_index.to_be_bytes());
    let digest = sha256(&preimage);
    let msg = Message::from_digest_slice(&digest).expect("32 byte digest");
    SECP256K1
        .sign_ecdsa(&msg, key)
        .serialize_compact()
        .to_vec()
}

fn verify_tx_sig(tx: &Transaction, sig: &[u8], key: &PublicKey) -> bool {
    let digest = tx.txid();
    let msg = match Message::from_digest_slice(digest.as_ref()) {
        Ok(msg) => msg,
        Err(_) => return false,
    };
    let signature = match Signature::from_compact(sig) {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    SECP256K1.verify_ecdsa(&msg, &signature, key).is_ok()
}

fn delayed_script(delay_key: &PublicKey, csv_delay: u16) -> Vec<u8> {
    let mut script = vec![0x51];
    script.extend_from_slice(&csv_delay.to_be_bytes());
    script.extend_from_slice(&delay_key.serialize());
    script
}

fn payment_script(payment_key: &PublicKey) -> Vec<u8> {
    let mut script = vec![0x52];
    script.extend_from_slice(&payment_key.serialize());
    script
}

fn htlc_script(payment_hash: &Hash256) -> Vec<u8> {
    let mut script = vec![0x53];
    script.extend_from_slice(payment_hash.as_ref());
    script
}

/// Assemble a commitment snapshot: balances and HTLCs laid out on a
/// deterministic transaction, dust filtered by the owner's dust limit and
/// output indices assigned in layout order.
pub fn build_commitment(
    channel: &OpenChannel,
    height: u64,
    local_balance: MilliAtoms,
    remote_balance: MilliAtoms,
    fee_per_kb: Atoms,
    mut htlcs: Vec<Htlc>,
    local: bool,
) -> Commitment {
    let (owner_cfg, other_cfg) = if local {
        (&channel.local_chan_cfg, &channel.remote_chan_cfg)
    } else {
        (&channel.remote_chan_cfg, &channel.local_chan_cfg)
    };
    let dust_limit = owner_cfg.constraints.dust_limit;

    let materialized = htlcs
        .iter()
        .filter(|h| h.amount / 1000 > dust_limit)
        .count() as u64;
    let size = BASE_COMMITMENT_SIZE + HTLC_OUTPUT_SIZE * materialized;
    let commit_fee = size * fee_per_kb / 1000;

    let (owner_balance, other_balance) = if local {
        (local_balance, remote_balance)
    } else {
        (remote_balance, local_balance)
    };
    // The initiator pays the commitment fee out of its own output.
    let fee_matoms = commit_fee * 1000;
    let (owner_balance, other_balance) = if channel.is_initiator == local {
        (owner_balance.saturating_sub(fee_matoms), other_balance)
    } else {
        (owner_balance, other_balance.saturating_sub(fee_matoms))
    };

    let mut outputs = Vec::new();
    if owner_balance / 1000 > dust_limit {
        outputs.push(TxOut {
            value: owner_balance / 1000,
            pk_script: delayed_script(
                &owner_cfg.delay_base_point.pub_key,
                owner_cfg.constraints.csv_delay,
            ),
        });
    }
    if other_balance / 1000 > dust_limit {
        outputs.push(TxOut {
            value: other_balance / 1000,
            pk_script: payment_script(&other_cfg.payment_base_point.pub_key),
        });
    }

    htlcs.sort_by(|a, b| {
        (a.amount, a.payment_hash, a.htlc_index).cmp(&(b.amount, b.payment_hash, b.htlc_index))
    });
    for htlc in htlcs.iter_mut() {
        if htlc.amount / 1000 > dust_limit {
            htlc.output_index = outputs.len() as i32;
            outputs.push(TxOut {
                value: htlc.amount / 1000,
                pk_script: htlc_script(&htlc.payment_hash),
            });
        } else {
            htlc.output_index = -1;
        }
    }

    let commit_tx = Transaction {
        version: 2,
        inputs: vec![TxIn {
            previous_outpoint: channel.funding_outpoint,
            signature_script: Vec::new(),
            sequence: (height & 0xff_ffff) as u32,
        }],
        outputs,
        lock_time: 0,
    };

    Commitment {
        commit_height: height,
        local_log_index: 0,
        local_htlc_index: 0,
        remote_log_index: 0,
        remote_htlc_index: 0,
        local_balance,
        remote_balance,
        commit_fee,
        fee_per_kb,
        commit_tx,
        commit_sig: Vec::new(),
        htlcs,
    }
}

/// Resolution material for broadcasting the current local commitment.
pub fn force_close_summary(
    channel: &OpenChannel,
    multi_sig_secret: &SecretKey,
) -> LocalForceCloseSummary {
    let commitment = &channel.local_commitment;
    let mut close_tx = commitment.commit_tx.clone();
    if close_tx.inputs.is_empty() {
        close_tx.inputs.push(TxIn {
            previous_outpoint: channel.funding_outpoint,
            signature_script: Vec::new(),
            sequence: u32::MAX,
        });
    }
    close_tx.inputs[0].signature_script = sign_tx(&commitment.commit_tx, multi_sig_secret);
    let close_txid = close_tx.txid();

    let dust_limit = channel.local_chan_cfg.constraints.dust_limit;
    let commit_resolution = if commitment.local_balance / 1000 > dust_limit {
        Some(CommitOutputResolution {
            self_outpoint: OutPoint::new(close_txid, 0),
            amount: commitment.local_balance / 1000,
            maturity_delay: channel.local_chan_cfg.constraints.csv_delay as u32,
        })
    } else {
        None
    };

    let mut resolutions = HtlcResolutions::default();
    for htlc in &commitment.htlcs {
        if htlc.is_dust() {
            continue;
        }
        let claim_outpoint = OutPoint::new(close_txid, htlc.output_index as u32);
        if htlc.incoming {
            resolutions.incoming.push(IncomingHtlcResolution {
                htlc_index: htlc.htlc_index,
                amount: htlc.amount,
                expiry: htlc.refund_timeout,
                payment_hash: htlc.payment_hash,
                claim_outpoint,
                signed_success_tx: Some(second_level_tx(
                    claim_outpoint,
                    htlc.amount / 1000,
                    0,
                    multi_sig_secret,
                )),
            });
        } else {
            resolutions.outgoing.push(OutgoingHtlcResolution {
                htlc_index: htlc.htlc_index,
                amount: htlc.amount,
                expiry: htlc.refund_timeout,
                claim_outpoint,
                signed_timeout_tx: Some(second_level_tx(
                    claim_outpoint,
                    htlc.amount / 1000,
                    htlc.refund_timeout,
                    multi_sig_secret,
                )),
            });
        }
    }

    LocalForceCloseSummary {
        chan_point: channel.funding_outpoint,
        close_tx,
        commit_resolution,
        htlc_resolutions: resolutions,
    }
}

fn second_level_tx(
    claim_outpoint: OutPoint,
    value: Atoms,
    lock_time: u32,
    key: &SecretKey,
) -> Transaction {
    let mut tx = Transaction {
        version: 2,
        inputs: vec![TxIn {
            previous_outpoint: claim_outpoint,
            signature_script: Vec::new(),
            sequence: 0,
        }],
        outputs: vec![TxOut {
            value,
            pk_script: payment_script(&key.public_key(SECP256K1)),
        }],
        lock_time,
    };
    let sig = sign_tx(&tx, key);
    tx.inputs[0].signature_script = sig;
    tx
}
