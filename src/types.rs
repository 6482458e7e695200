use crate::crypto::{Hash, hash_data};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Epoch counter identifying a proposer slot.
pub type Epoch = u32;

/// Block height, counted from genesis at height 0.
pub type Height = u64;

/// Opaque validator identity. Binding it to cryptographic authentication is
/// layered above this crate.
pub type ValidatorId = String;

/// A validator: an identity plus a positive voting weight.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub id: ValidatorId,
    pub weight: u64,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ValidatorError {
    #[error("validator weight must be positive")]
    NonPositiveWeight,
}

impl Validator {
    pub fn new(id: impl Into<ValidatorId>, weight: u64) -> Result<Self, ValidatorError> {
        if weight == 0 {
            return Err(ValidatorError::NonPositiveWeight);
        }
        Ok(Self {
            id: id.into(),
            weight,
        })
    }
}

/// The target of a vote: a specific block at a specific height.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteTarget {
    pub hash: Hash,
    pub height: Height,
}

/// A vote, carrying `None` for a nil-vote (GLOSSARY): participation without
/// endorsing a new block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub block: Option<VoteTarget>,
    pub voter_id: ValidatorId,
    pub epoch: Epoch,
}

impl Vote {
    pub fn is_nil(&self) -> bool {
        self.block.is_none()
    }
}

/// Votes for one block, keyed by voter id — last-writer-wins on re-insert
/// (the equivocation policy: a later vote from the same voter always
/// replaces an earlier one).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VoteSet {
    votes: HashMap<ValidatorId, Vote>,
}

impl VoteSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a vote, overwriting any previous vote from the same voter.
    /// Returns the previous vote, if any (the one just overwritten).
    pub fn insert(&mut self, vote: Vote) -> Option<Vote> {
        self.votes.insert(vote.voter_id.clone(), vote)
    }

    pub fn get(&self, voter_id: &str) -> Option<&Vote> {
        self.votes.get(voter_id)
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &Vote> {
        self.votes.values()
    }

    pub fn voter_ids(&self) -> impl Iterator<Item = &ValidatorId> {
        self.votes.keys()
    }
}

/// A bundle of votes for one block that meets quorum. Immutable once
/// formed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitCertificate {
    pub block_hash: Hash,
    pub votes: VoteSet,
}

/// A block in the block DAG. `hash` is derived from the remaining fields at
/// construction time (content addressing) — see DESIGN.md, Open Question 1.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
    pub hash: Hash,
    pub parent_hash: Hash,
    pub chain_id: String,
    pub height: Height,
    pub epoch: Epoch,
    pub proposer_id: ValidatorId,
    /// Opaque header payload; transaction/business semantics are out of
    /// scope for this crate.
    pub payload: Vec<u8>,
}

#[derive(Serialize)]
struct BlockContent<'a> {
    parent_hash: Hash,
    chain_id: &'a str,
    height: Height,
    epoch: Epoch,
    proposer_id: &'a str,
    payload: &'a [u8],
}

impl Block {
    pub fn new(
        parent_hash: Hash,
        chain_id: impl Into<String>,
        height: Height,
        epoch: Epoch,
        proposer_id: impl Into<ValidatorId>,
        payload: Vec<u8>,
    ) -> Self {
        let chain_id = chain_id.into();
        let proposer_id = proposer_id.into();
        let hash = hash_data(&BlockContent {
            parent_hash,
            chain_id: &chain_id,
            height,
            epoch,
            proposer_id: &proposer_id,
            payload: &payload,
        });
        Self {
            hash,
            parent_hash,
            chain_id,
            height,
            epoch,
            proposer_id,
            payload,
        }
    }

    pub fn target(&self) -> VoteTarget {
        VoteTarget {
            hash: self.hash,
            height: self.height,
        }
    }
}

/// A `Block` plus the DAG links and (possibly absent) CC attached to it.
/// Lives in the `Chain` index; a CC may be attached after insertion.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtendedBlock {
    pub block: Block,
    pub cc: Option<CommitCertificate>,
    pub children: Vec<Hash>,
}

impl ExtendedBlock {
    pub fn new(block: Block) -> Self {
        Self {
            block,
            cc: None,
            children: Vec::new(),
        }
    }

    pub fn hash(&self) -> Hash {
        self.block.hash
    }

    pub fn height(&self) -> Height {
        self.block.height
    }

    pub fn epoch(&self) -> Epoch {
        self.block.epoch
    }

    pub fn has_cc(&self) -> bool {
        self.cc.is_some()
    }
}

/// One proposer's proposal for an epoch: a block plus, if the proposer knows
/// one, a copy of the CC for the highest committed block.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Proposal {
    pub block: Block,
    pub proposer_id: ValidatorId,
    pub highest_cc: Option<CommitCertificate>,
}

/// The tagged variant over the engine's incoming message stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    Proposal(Proposal),
    Vote(Vote),
    Block(Block),
    CommitCertificate(CommitCertificate),
}
