use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::chain::{
    BlockEpoch, ChainNotifier, Hash256, OutPoint, SpendDetail, TxConfirmation,
};
use crate::contractcourt::log::{
    ArbitratorLog, ArbitratorState, CommitSet, ContractError, ContractResolutions,
};
use crate::contractcourt::resolvers::ContractResolver;
use crate::store::ChannelArbitratorLog;

/// In-memory arbitrator log with injectable failures, mirroring the store
/// interface the arbitrator persists through.
pub struct MockArbitratorLog {
    inner: Mutex<MockLogInner>,
    new_states: mpsc::UnboundedSender<ArbitratorState>,
}

struct MockLogInner {
    state: ArbitratorState,
    resolutions: Option<ContractResolutions>,
    resolvers: HashMap<Vec<u8>, ContractResolver>,
    commit_set: Option<CommitSet>,
    fail_log: bool,
    fail_fetch: bool,
    fail_commit_state: Option<ArbitratorState>,
}

impl MockArbitratorLog {
    pub fn new(
        state: ArbitratorState,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ArbitratorState>) {
        let (new_states_tx, new_states_rx) = mpsc::unbounded_channel();
        let log = Arc::new(Self {
            inner: Mutex::new(MockLogInner {
                state,
                resolutions: None,
                resolvers: HashMap::new(),
                commit_set: None,
                fail_log: false,
                fail_fetch: false,
                fail_commit_state: None,
            }),
            new_states: new_states_tx,
        });
        (log, new_states_rx)
    }

    pub fn state(&self) -> ArbitratorState {
        self.inner.lock().unwrap().state
    }

    pub fn set_fail_log(&self, fail: bool) {
        self.inner.lock().unwrap().fail_log = fail;
    }

    pub fn set_fail_fetch(&self, fail: bool) {
        self.inner.lock().unwrap().fail_fetch = fail;
    }

    pub fn set_fail_commit_state(&self, state: Option<ArbitratorState>) {
        self.inner.lock().unwrap().fail_commit_state = state;
    }
}

impl ArbitratorLog for MockArbitratorLog {
    fn current_state(&self) -> Result<ArbitratorState, ContractError> {
        Ok(self.inner.lock().unwrap().state)
    }

    fn commit_state(&self, state: ArbitratorState) -> Result<(), ContractError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_commit_state == Some(state) {
            return Err(ContractError::Log(format!(
                "intentional commit error at state {}",
                state
            )));
        }
        inner.state = state;
        let _ = self.new_states.send(state);
        Ok(())
    }

    fn fetch_unresolved_contracts(&self) -> Result<Vec<ContractResolver>, ContractError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .resolvers
            .values()
            .cloned()
            .collect())
    }

    fn insert_unresolved_contracts(
        &self,
        resolvers: &[ContractResolver],
    ) -> Result<(), ContractError> {
        let mut inner = self.inner.lock().unwrap();
        for resolver in resolvers {
            inner
                .resolvers
                .insert(resolver.resolver_key(), resolver.clone());
        }
        Ok(())
    }

    fn swap_contract(
        &self,
        old: &ContractResolver,
        new: &ContractResolver,
    ) -> Result<(), ContractError> {
        let mut inner = self.inner.lock().unwrap();
        inner.resolvers.remove(&old.resolver_key());
        inner.resolvers.insert(new.resolver_key(), new.clone());
        Ok(())
    }

    fn resolve_contract(&self, resolver: &ContractResolver) -> Result<(), ContractError> {
        self.inner
            .lock()
            .unwrap()
            .resolvers
            .remove(&resolver.resolver_key());
        Ok(())
    }

    fn log_contract_resolutions(
        &self,
        resolutions: &ContractResolutions,
    ) -> Result<(), ContractError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_log {
            return Err(ContractError::Log("intentional log failure".to_string()));
        }
        inner.resolutions = Some(resolutions.clone());
        Ok(())
    }

    fn fetch_contract_resolutions(&self) -> Result<ContractResolutions, ContractError> {
        let inner = self.inner.lock().unwrap();
        if inner.fail_fetch {
            return Err(ContractError::Log("intentional fetch failure".to_string()));
        }
        inner
            .resolutions
            .clone()
            .ok_or(ContractError::NoResolutions)
    }

    fn insert_confirmed_commit_set(&self, commit_set: &CommitSet) -> Result<(), ContractError> {
        self.inner.lock().unwrap().commit_set = Some(commit_set.clone());
        Ok(())
    }

    fn fetch_confirmed_commit_set(&self) -> Result<Option<CommitSet>, ContractError> {
        Ok(self.inner.lock().unwrap().commit_set.clone())
    }

    fn wipe_history(&self) -> Result<(), ContractError> {
        Ok(())
    }
}

/// A wrapper around a fully concrete store-backed log that mirrors state
/// commits into a channel so tests can assert transition order.
pub struct TestLog {
    inner: ChannelArbitratorLog,
    new_states: mpsc::UnboundedSender<ArbitratorState>,
}

impl TestLog {
    pub fn new(
        inner: ChannelArbitratorLog,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ArbitratorState>) {
        let (new_states_tx, new_states_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                inner,
                new_states: new_states_tx,
            }),
            new_states_rx,
        )
    }
}

impl ArbitratorLog for TestLog {
    fn current_state(&self) -> Result<ArbitratorState, ContractError> {
        self.inner.current_state()
    }

    fn commit_state(&self, state: ArbitratorState) -> Result<(), ContractError> {
        self.inner.commit_state(state)?;
        let _ = self.new_states.send(state);
        Ok(())
    }

    fn fetch_unresolved_contracts(&self) -> Result<Vec<ContractResolver>, ContractError> {
        self.inner.fetch_unresolved_contracts()
    }

    fn insert_unresolved_contracts(
        &self,
        resolvers: &[ContractResolver],
    ) -> Result<(), ContractError> {
        self.inner.insert_unresolved_contracts(resolvers)
    }

    fn swap_contract(
        &self,
        old: &ContractResolver,
        new: &ContractResolver,
    ) -> Result<(), ContractError> {
        self.inner.swap_contract(old, new)
    }

    fn resolve_contract(&self, resolver: &ContractResolver) -> Result<(), ContractError> {
        self.inner.resolve_contract(resolver)
    }

    fn log_contract_resolutions(
        &self,
        resolutions: &ContractResolutions,
    ) -> Result<(), ContractError> {
        self.inner.log_contract_resolutions(resolutions)
    }

    fn fetch_contract_resolutions(&self) -> Result<ContractResolutions, ContractError> {
        self.inner.fetch_contract_resolutions()
    }

    fn insert_confirmed_commit_set(&self, commit_set: &CommitSet) -> Result<(), ContractError> {
        self.inner.insert_confirmed_commit_set(commit_set)
    }

    fn fetch_confirmed_commit_set(&self) -> Result<Option<CommitSet>, ContractError> {
        self.inner.fetch_confirmed_commit_set()
    }

    fn wipe_history(&self) -> Result<(), ContractError> {
        self.inner.wipe_history()
    }
}

/// Chain notifier double. Spend notifications are routed to the most recent
/// live registration, block epochs fan out to every registration.
#[derive(Default)]
pub struct MockNotifier {
    epoch_senders: Mutex<Vec<mpsc::Sender<BlockEpoch>>>,
    spend_senders: Mutex<Vec<mpsc::Sender<SpendDetail>>>,
}

impl MockNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn notify_epoch(&self, height: u32) {
        let senders: Vec<_> = self.epoch_senders.lock().unwrap().clone();
        for sender in senders {
            let _ = sender.send(BlockEpoch {
                height,
                hash: Hash256::default(),
            })
            .await;
        }
    }

    /// Deliver a spend to the newest live registration, waiting for one to
    /// appear if the registering task has not caught up yet.
    pub async fn notify_spend(&self, detail: SpendDetail) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let senders: Vec<_> = self.spend_senders.lock().unwrap().clone();
            for sender in senders.iter().rev() {
                if sender.try_send(detail.clone()).is_ok() {
                    return;
                }
            }
            if Instant::now() > deadline {
                panic!("no live spend registration to notify");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl ChainNotifier for MockNotifier {
    fn register_block_epochs(&self) -> mpsc::Receiver<BlockEpoch> {
        let (tx, rx) = mpsc::channel(16);
        self.epoch_senders.lock().unwrap().push(tx);
        rx
    }

    fn register_spend(&self, _outpoint: &OutPoint) -> mpsc::Receiver<SpendDetail> {
        let (tx, rx) = mpsc::channel(16);
        self.spend_senders.lock().unwrap().push(tx);
        rx
    }

    fn register_confirmation(
        &self,
        _txid: Hash256,
        _num_confs: u32,
    ) -> mpsc::Receiver<TxConfirmation> {
        mpsc::channel(1).1
    }
}
