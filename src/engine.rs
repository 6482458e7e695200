use crate::chain::Chain;
use crate::crypto::Hash;
use crate::types::{
    Block, CommitCertificate, Epoch, ExtendedBlock, Height, Message, Proposal, ValidatorId, Vote,
    VoteSet,
};
use crate::validator::ValidatorManager;
use crate::config::Config;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// The network collaborator the engine broadcasts proposals and votes
/// through. `broadcast` is assumed non-blocking; if the transport can
/// block it must offload that itself.
#[async_trait]
pub trait NetworkHandle: Send + Sync {
    fn id(&self) -> &str;
    async fn broadcast(&self, msg: Message);
}

/// The per-epoch state machine driving block production and finalization.
/// This is the public handle: `add_message`/`finalized_blocks` enqueue/
/// dequeue against the loop spawned by `start`; `get_tip` reads the one
/// field shared with outside threads under a mutex.
pub struct Engine<C, V, N> {
    id: ValidatorId,
    chain: Arc<C>,
    validators: Arc<V>,
    network: Arc<N>,
    config: Config,

    tip: Arc<Mutex<ExtendedBlock>>,

    inbox_tx: mpsc::Sender<Message>,
    inbox_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    finalized_tx: mpsc::Sender<ExtendedBlock>,
    finalized_rx: Mutex<Option<mpsc::Receiver<ExtendedBlock>>>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,

    join: Mutex<Option<JoinHandle<()>>>,
}

impl<C, V, N> Engine<C, V, N>
where
    C: Chain + 'static,
    V: ValidatorManager + 'static,
    N: NetworkHandle + 'static,
{
    pub fn new(id: ValidatorId, chain: Arc<C>, validators: Arc<V>, network: Arc<N>, config: Config) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel(config.consensus_message_queue_size);
        let (finalized_tx, finalized_rx) = mpsc::channel(config.consensus_message_queue_size);
        let (stop_tx, stop_rx) = watch::channel(false);
        let root = chain.root();
        Self {
            id,
            chain,
            validators,
            network,
            config,
            tip: Arc::new(Mutex::new(root)),
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
            finalized_tx,
            finalized_rx: Mutex::new(Some(finalized_rx)),
            stop_tx,
            stop_rx,
            join: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn chain(&self) -> &Arc<C> {
        &self.chain
    }

    pub fn network(&self) -> &Arc<N> {
        &self.network
    }

    pub fn get_tip(&self) -> ExtendedBlock {
        self.tip.lock().unwrap().clone()
    }

    /// Enqueue a message. Never blocks while the queue has capacity;
    /// otherwise blocks the caller.
    pub async fn add_message(&self, msg: Message) {
        if self.inbox_tx.send(msg).await.is_err() {
            log::warn!("engine {} inbox closed; message dropped", self.id);
        }
    }

    /// Returns the bounded output channel of finalized blocks, in
    /// finalization order. Callable once; a second call returns `None`.
    pub fn finalized_blocks(&self) -> Option<mpsc::Receiver<ExtendedBlock>> {
        self.finalized_rx.lock().unwrap().take()
    }

    /// Launch the main loop as a background task.
    pub fn start(self: &Arc<Self>) {
        let mut join_guard = self.join.lock().unwrap();
        if join_guard.is_some() {
            log::warn!("engine {} already started", self.id);
            return;
        }
        let Some(inbox_rx) = self.inbox_rx.lock().unwrap().take() else {
            log::warn!("engine {} already started", self.id);
            return;
        };

        let mut state = EngineLoop {
            id: self.id.clone(),
            chain: Arc::clone(&self.chain),
            validators: Arc::clone(&self.validators),
            network: Arc::clone(&self.network),
            config: self.config,
            tip_shared: Arc::clone(&self.tip),
            self_tx: self.inbox_tx.clone(),
            epoch: 1,
            tip: self.tip.lock().unwrap().clone(),
            highest_cc_block: self.chain.root(),
            last_finalized_block: self.chain.root(),
            last_vote_height: 0,
            collected_votes: HashMap::new(),
            epoch_votes: HashMap::new(),
            vote_log: HashMap::new(),
            stopped: false,
        };
        let finalized_tx = self.finalized_tx.clone();
        let stop_rx = self.stop_rx.clone();

        *join_guard = Some(tokio::spawn(async move {
            state.run(inbox_rx, finalized_tx, stop_rx).await;
        }));
    }

    /// Request cooperative shutdown. Does not block.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Block until the main loop has exited.
    pub async fn wait(&self) {
        let handle = self.join.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Owns every field the main loop mutates exclusively: vote log, collected
/// votes, epoch votes, epoch, tip, highest-CC block, last-finalized block,
/// last-vote height.
struct EngineLoop<C, V, N> {
    id: ValidatorId,
    chain: Arc<C>,
    validators: Arc<V>,
    network: Arc<N>,
    config: Config,
    tip_shared: Arc<Mutex<ExtendedBlock>>,
    self_tx: mpsc::Sender<Message>,

    epoch: Epoch,
    tip: ExtendedBlock,
    highest_cc_block: ExtendedBlock,
    last_finalized_block: ExtendedBlock,
    last_vote_height: Height,
    collected_votes: HashMap<Hash, VoteSet>,
    epoch_votes: HashMap<ValidatorId, Vote>,
    /// Reserved for our own cast votes, to detect equivocation across
    /// restarts. Never populated today — see DESIGN.md, Open Question 6.
    #[allow(dead_code)]
    vote_log: HashMap<Height, Vote>,
    stopped: bool,
}

impl<C, V, N> EngineLoop<C, V, N>
where
    C: Chain + 'static,
    V: ValidatorManager + 'static,
    N: NetworkHandle + 'static,
{
    async fn run(
        &mut self,
        mut inbox: mpsc::Receiver<Message>,
        finalized_tx: mpsc::Sender<ExtendedBlock>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        loop {
            self.enter_epoch().await;

            let sleep = tokio::time::sleep(self.config.max_epoch_length());
            tokio::pin!(sleep);

            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            self.stopped = true;
                            return;
                        }
                    }
                    maybe_msg = inbox.recv() => {
                        match maybe_msg {
                            Some(msg) => {
                                if self.dispatch(msg, &finalized_tx).await {
                                    break;
                                }
                            }
                            None => {
                                self.stopped = true;
                                return;
                            }
                        }
                    }
                    _ = &mut sleep => {
                        log::info!("engine {}: epoch {} timer expired", self.id, self.epoch);
                        self.vote().await;
                        break;
                    }
                }
            }
        }
    }

    async fn enter_epoch(&mut self) {
        log::info!("engine {}: entering epoch {}", self.id, self.epoch);
        if self.validators.get_proposer_for_epoch(self.epoch).id == self.id {
            self.propose().await;
        }
    }

    /// Returns `true` if this message should end the current epoch wait
    /// early. Only a `Vote` can ever do so.
    async fn dispatch(&mut self, msg: Message, finalized_tx: &mpsc::Sender<ExtendedBlock>) -> bool {
        match msg {
            Message::Proposal(p) => {
                self.on_proposal(p, finalized_tx).await;
                false
            }
            Message::Block(b) => {
                self.on_block(b);
                false
            }
            Message::CommitCertificate(cc) => {
                self.process_commit_certificate(cc, finalized_tx).await;
                false
            }
            Message::Vote(v) => self.on_vote(v, finalized_tx).await,
        }
    }

    fn on_block(&mut self, block: Block) {
        let hash = block.hash;
        let epoch = block.epoch;
        match self.chain.add_block(block) {
            Ok(_) => {}
            Err(e) if matches!(e, crate::chain::ChainError::Duplicate) => {
                log::debug!("block {hash} already known");
            }
            Err(e) => {
                log::warn!("dropping block {hash}: {e}");
                return;
            }
        }
        if epoch != self.epoch {
            log::info!("accepted out-of-epoch block {hash} (epoch {epoch}, current {})", self.epoch);
        }
    }

    async fn on_proposal(&mut self, p: Proposal, finalized_tx: &mpsc::Sender<ExtendedBlock>) {
        let expected = self.validators.get_proposer_for_epoch(self.epoch).id.clone();
        if p.proposer_id != expected {
            log::warn!(
                "ignoring proposal from non-proposer {} (expected {expected})",
                p.proposer_id
            );
            return;
        }

        self.on_block(p.block);
        if let Some(cc) = p.highest_cc {
            self.process_commit_certificate(cc, finalized_tx).await;
        }
        self.vote().await;
    }

    /// Shared CC-processing path, reached either from an incoming
    /// `CommitCertificate` message or a vote that just completed a quorum.
    async fn process_commit_certificate(
        &mut self,
        cc: CommitCertificate,
        finalized_tx: &mpsc::Sender<ExtendedBlock>,
    ) {
        let ext = match self.chain.attach_cc(cc) {
            Ok(ext) => ext,
            Err(e) => {
                log::warn!("failed to attach commit certificate: {e}");
                return;
            }
        };
        self.process_cc_block(ext, finalized_tx).await;
    }

    async fn process_cc_block(&mut self, cc_block: ExtendedBlock, finalized_tx: &mpsc::Sender<ExtendedBlock>) {
        if cc_block.height() > self.highest_cc_block.height() {
            self.highest_cc_block = cc_block.clone();
        }

        if cc_block.block.parent_hash != Hash::default() {
            match self.chain.find_block(&cc_block.block.parent_hash) {
                Ok(Some(parent)) if parent.has_cc() => {
                    self.finalize_block(parent, finalized_tx).await;
                }
                Ok(_) => {}
                Err(e) => log::warn!("failed to look up parent for finalization check: {e}"),
            }
        }

        // Epoch advancement here is silent: it updates state the next
        // genuine end-of-epoch event (timer or vote quorum) will observe,
        // rather than forcing immediate re-entry. See DESIGN.md, Open
        // Question 3.
        if cc_block.epoch() >= self.epoch {
            self.epoch = cc_block.epoch() + 1;
        }
    }

    async fn finalize_block(&mut self, b: ExtendedBlock, finalized_tx: &mpsc::Sender<ExtendedBlock>) {
        if self.stopped {
            return;
        }
        if b.hash() == self.last_finalized_block.hash() {
            return;
        }
        log::info!("engine {}: finalized block {} at height {}", self.id, b.hash(), b.height());
        self.last_finalized_block = b.clone();
        // Non-blocking: the output channel is an observer, not a durable log.
        if finalized_tx.try_send(b).is_err() {
            log::debug!("finalized-blocks channel full or closed; drop is intentional");
        }
    }

    async fn on_vote(&mut self, v: Vote, finalized_tx: &mpsc::Sender<ExtendedBlock>) -> bool {
        // The active validator set is always fetched for epoch 0 (see
        // DESIGN.md, Open Question 5). Read once up front so it doesn't
        // overlap with the field-local borrows below.
        let quorum_epoch: Epoch = 0;

        self.epoch_votes.insert(v.voter_id.clone(), v.clone());

        let mut end_epoch = false;
        if v.epoch >= self.epoch {
            let mut transient = VoteSet::new();
            for vote in self.epoch_votes.values() {
                if vote.epoch >= v.epoch {
                    transient.insert(vote.clone());
                }
            }
            if self.validators.has_majority(quorum_epoch, &transient) {
                self.epoch = v.epoch + 1;
                end_epoch = true;
            }
        }

        let Some(target) = v.block else {
            return end_epoch;
        };

        let known = match self.chain.find_block(&target.hash) {
            Ok(known) => known,
            Err(e) => {
                log::warn!("chain lookup failed for vote target {}: {e}", target.hash);
                return end_epoch;
            }
        };
        if known.is_none() {
            log::warn!("vote for unknown block {} dropped (arrived before its block)", target.hash);
            return end_epoch;
        }

        let set = self.collected_votes.entry(target.hash).or_default();
        set.insert(v);

        if self.validators.has_majority(quorum_epoch, set) {
            let cc = CommitCertificate {
                block_hash: target.hash,
                votes: set.clone(),
            };
            self.process_commit_certificate(cc, finalized_tx).await;
        }

        end_epoch
    }

    /// The deepest descendant of the highest CC'd block — the
    /// longest-chain-from-highest-CC fork-choice rule.
    fn set_tip(&mut self) -> ExtendedBlock {
        let tip = self
            .chain
            .find_deepest_descendant(&self.highest_cc_block.hash())
            .ok()
            .flatten()
            .unwrap_or_else(|| self.highest_cc_block.clone());
        self.tip = tip.clone();
        if let Ok(mut shared) = self.tip_shared.lock() {
            *shared = tip.clone();
        }
        tip
    }

    async fn vote(&mut self) {
        let previous_tip = self.tip.clone();
        let tip = self.set_tip();

        let vote = if previous_tip.hash() == tip.hash() || self.last_vote_height >= tip.height() {
            Vote {
                block: None,
                voter_id: self.id.clone(),
                epoch: self.epoch,
            }
        } else {
            self.last_vote_height = tip.height();
            Vote {
                block: Some(tip.block.target()),
                voter_id: self.id.clone(),
                epoch: self.epoch,
            }
        };

        self.network.broadcast(Message::Vote(vote.clone())).await;
        // Self-delivery goes through the same inbox as peer messages: our
        // own vote is counted only once it is dequeued, after whatever peer
        // messages were already ahead of it.
        if let Err(e) = self.self_tx.try_send(Message::Vote(vote)) {
            log::warn!("engine {}: failed to self-deliver vote: {e}", self.id);
        }
    }

    async fn propose(&mut self) {
        let tip = self.set_tip();
        let block = Block::new(
            tip.hash(),
            self.chain.chain_id().to_string(),
            tip.height() + 1,
            self.epoch,
            self.id.clone(),
            Vec::new(),
        );
        let highest_cc = self.highest_cc_block.cc.clone();
        let proposal = Proposal {
            block,
            proposer_id: self.id.clone(),
            highest_cc,
        };

        self.network
            .broadcast(Message::Proposal(proposal.clone()))
            .await;
        if let Err(e) = self.self_tx.try_send(Message::Proposal(proposal)) {
            log::warn!("engine {}: failed to self-deliver proposal: {e}", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemChain;
    use crate::types::{Validator, VoteTarget};
    use crate::validator::{StaticValidatorManager, ValidatorSet};

    struct NoopNetwork;

    #[async_trait]
    impl NetworkHandle for NoopNetwork {
        fn id(&self) -> &str {
            "noop"
        }
        async fn broadcast(&self, _msg: Message) {}
    }

    fn committee_of(n: usize) -> Arc<StaticValidatorManager> {
        let validators = (0..n)
            .map(|i| Validator::new(format!("v{i}"), 1).unwrap())
            .collect();
        Arc::new(StaticValidatorManager::new(ValidatorSet::new(validators)))
    }

    /// Builds a bare `EngineLoop` for direct, synchronous-style dispatch in
    /// tests. The returned receiver must be kept alive by the caller for the
    /// test's duration — nothing drains it, but dropping it would turn every
    /// self-delivery `try_send` into a (harmless, but noisy) error.
    fn test_state(
        id: &str,
        chain: &Arc<MemChain>,
        validators: &Arc<StaticValidatorManager>,
    ) -> (
        EngineLoop<MemChain, StaticValidatorManager, NoopNetwork>,
        mpsc::Receiver<Message>,
    ) {
        let root = chain.root();
        let (self_tx, self_rx) = mpsc::channel(16);
        let state = EngineLoop {
            id: id.to_string(),
            chain: Arc::clone(chain),
            validators: Arc::clone(validators),
            network: Arc::new(NoopNetwork),
            config: Config::default(),
            tip_shared: Arc::new(Mutex::new(root.clone())),
            self_tx,
            epoch: 1,
            tip: root.clone(),
            highest_cc_block: root.clone(),
            last_finalized_block: root,
            last_vote_height: 0,
            collected_votes: HashMap::new(),
            epoch_votes: HashMap::new(),
            vote_log: HashMap::new(),
            stopped: false,
        };
        (state, self_rx)
    }

    #[tokio::test]
    async fn two_chain_rule_finalizes_grandparent_on_second_cc() {
        let chain = Arc::new(MemChain::new("test"));
        let validators = committee_of(4);
        let (mut state, _self_rx) = test_state("v1", &chain, &validators);
        let (finalized_tx, mut finalized_rx) = mpsc::channel(16);
        let genesis = chain.root();

        // Epoch 1: v1 (the proposer) proposes block1 on top of genesis.
        let block1 = Block::new(genesis.hash(), chain.chain_id(), 1, 1, "v1", vec![]);
        state
            .dispatch(
                Message::Proposal(Proposal {
                    block: block1.clone(),
                    proposer_id: "v1".into(),
                    highest_cc: None,
                }),
                &finalized_tx,
            )
            .await;
        assert_eq!(state.tip.hash(), block1.hash);

        // v0, v2, v3 vote for block1 — already a strict two-thirds majority
        // of the four-validator committee without counting v1's own vote.
        for voter in ["v0", "v2", "v3"] {
            state
                .dispatch(
                    Message::Vote(Vote {
                        block: Some(block1.target()),
                        voter_id: voter.into(),
                        epoch: 1,
                    }),
                    &finalized_tx,
                )
                .await;
        }
        assert!(chain.find_block(&block1.hash).unwrap().unwrap().has_cc());
        assert!(
            finalized_rx.try_recv().is_err(),
            "a block's own CC must not finalize it — only its child's CC does"
        );
        assert_eq!(state.epoch, 2, "epoch advances once block1's CC is processed");

        // Epoch 2: v2 (the new proposer) proposes block2 on top of block1,
        // carrying a copy of block1's CC.
        let cc1 = chain.find_block(&block1.hash).unwrap().unwrap().cc.unwrap();
        let block2 = Block::new(block1.hash, chain.chain_id(), 2, 2, "v2", vec![]);
        state
            .dispatch(
                Message::Proposal(Proposal {
                    block: block2.clone(),
                    proposer_id: "v2".into(),
                    highest_cc: Some(cc1),
                }),
                &finalized_tx,
            )
            .await;

        for voter in ["v0", "v2", "v3"] {
            state
                .dispatch(
                    Message::Vote(Vote {
                        block: Some(block2.target()),
                        voter_id: voter.into(),
                        epoch: 2,
                    }),
                    &finalized_tx,
                )
                .await;
        }

        let finalized = finalized_rx
            .try_recv()
            .expect("block1 should now be finalized via the two-chain rule");
        assert_eq!(finalized.hash(), block1.hash);
    }

    #[tokio::test]
    async fn proposal_from_non_proposer_is_ignored() {
        let chain = Arc::new(MemChain::new("test"));
        let validators = committee_of(4);
        let (mut state, _self_rx) = test_state("v0", &chain, &validators);
        let (finalized_tx, _finalized_rx) = mpsc::channel(16);
        let genesis = chain.root();

        // Epoch 1's proposer is v1 (index 1), not v2.
        let block = Block::new(genesis.hash(), chain.chain_id(), 1, 1, "v2", vec![]);
        state
            .dispatch(
                Message::Proposal(Proposal {
                    block: block.clone(),
                    proposer_id: "v2".into(),
                    highest_cc: None,
                }),
                &finalized_tx,
            )
            .await;

        assert!(chain.find_block(&block.hash).unwrap().is_none());
        assert_eq!(state.tip.hash(), genesis.hash());
    }

    #[tokio::test]
    async fn vote_for_unknown_block_is_dropped_without_panicking() {
        let chain = Arc::new(MemChain::new("test"));
        let validators = committee_of(4);
        let (mut state, _self_rx) = test_state("v0", &chain, &validators);
        let (finalized_tx, _finalized_rx) = mpsc::channel(16);

        let phantom = VoteTarget {
            hash: Hash([9; 32]),
            height: 1,
        };
        let end_epoch = state
            .dispatch(
                Message::Vote(Vote {
                    block: Some(phantom),
                    voter_id: "v1".into(),
                    epoch: 1,
                }),
                &finalized_tx,
            )
            .await;

        assert!(!end_epoch);
        assert!(state.collected_votes.is_empty());
        // Epoch-advancement accounting still records the voter, even though
        // the block-level vote was dropped.
        assert_eq!(state.epoch_votes.len(), 1);
    }

    #[tokio::test]
    async fn later_vote_from_same_voter_overwrites_earlier_epoch_vote_entry() {
        let chain = Arc::new(MemChain::new("test"));
        let validators = committee_of(4);
        let (mut state, _self_rx) = test_state("v0", &chain, &validators);
        let (finalized_tx, _finalized_rx) = mpsc::channel(16);

        state
            .dispatch(
                Message::Vote(Vote {
                    block: None,
                    voter_id: "v2".into(),
                    epoch: 1,
                }),
                &finalized_tx,
            )
            .await;
        state
            .dispatch(
                Message::Vote(Vote {
                    block: None,
                    voter_id: "v2".into(),
                    epoch: 3,
                }),
                &finalized_tx,
            )
            .await;

        assert_eq!(state.epoch_votes.len(), 1);
        assert_eq!(state.epoch_votes.get("v2").unwrap().epoch, 3);
    }

    #[tokio::test]
    async fn vote_quorum_of_nil_votes_still_advances_the_epoch() {
        let chain = Arc::new(MemChain::new("test"));
        let validators = committee_of(4);
        let (mut state, _self_rx) = test_state("v0", &chain, &validators);
        let (finalized_tx, _finalized_rx) = mpsc::channel(16);

        for voter in ["v0", "v1", "v2"] {
            state
                .dispatch(
                    Message::Vote(Vote {
                        block: None,
                        voter_id: voter.into(),
                        epoch: 1,
                    }),
                    &finalized_tx,
                )
                .await;
        }

        assert_eq!(state.epoch, 2);
    }

    #[tokio::test]
    async fn fork_choice_prefers_the_deepest_descendant_of_the_highest_cc_block() {
        let chain = Arc::new(MemChain::new("test"));
        let validators = committee_of(4);
        let (mut state, _self_rx) = test_state("v0", &chain, &validators);
        let genesis = chain.root();

        let a = Block::new(genesis.hash(), chain.chain_id(), 1, 1, "v1", vec![]);
        let b = Block::new(a.hash, chain.chain_id(), 2, 2, "v2", vec![]);
        chain.add_block(a).unwrap();
        chain.add_block(b.clone()).unwrap();

        let tip = state.set_tip();
        assert_eq!(tip.hash(), b.hash);
    }
}
