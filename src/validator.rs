use crate::types::{Epoch, Validator, ValidatorId, VoteSet};
use std::collections::HashMap;

/// An immutable set of validators and their total voting weight.
#[derive(Clone, Debug)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
    total_weight: u64,
    index: HashMap<ValidatorId, usize>,
}

impl ValidatorSet {
    pub fn new(validators: Vec<Validator>) -> Self {
        let total_weight = validators.iter().map(|v| v.weight).sum();
        let index = validators
            .iter()
            .enumerate()
            .map(|(i, v)| (v.id.clone(), i))
            .collect();
        Self {
            validators,
            total_weight,
            index,
        }
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    pub fn get(&self, id: &str) -> Option<&Validator> {
        self.index.get(id).map(|&i| &self.validators[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn nth(&self, i: usize) -> &Validator {
        &self.validators[i % self.validators.len()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Validator> {
        self.validators.iter()
    }

    /// Strict two-thirds majority by validator weight.
    pub fn has_majority(&self, votes: &VoteSet) -> bool {
        let weight: u64 = votes
            .voter_ids()
            .filter_map(|id| self.get(id))
            .map(|v| v.weight)
            .sum();
        // Strict majority: weight * 3 > total_weight * 2
        weight.saturating_mul(3) > self.total_weight.saturating_mul(2)
    }
}

/// Deterministic proposer rotation, a pure function of `(epoch, validator set)`.
/// The validator set is constant across epochs here — validator-diff
/// handoff at a commit boundary is future work (see DESIGN.md, Open
/// Question 5).
pub trait ValidatorManager: Send + Sync {
    fn get_validator_set_for_epoch(&self, epoch: Epoch) -> &ValidatorSet;

    fn get_proposer_for_epoch(&self, epoch: Epoch) -> &Validator {
        let set = self.get_validator_set_for_epoch(epoch);
        set.nth(epoch as usize)
    }

    fn has_majority(&self, epoch: Epoch, votes: &VoteSet) -> bool {
        self.get_validator_set_for_epoch(epoch).has_majority(votes)
    }
}

/// A validator manager backed by one fixed, static `ValidatorSet`.
pub struct StaticValidatorManager {
    set: ValidatorSet,
}

impl StaticValidatorManager {
    pub fn new(set: ValidatorSet) -> Self {
        Self { set }
    }
}

impl ValidatorManager for StaticValidatorManager {
    fn get_validator_set_for_epoch(&self, _epoch: Epoch) -> &ValidatorSet {
        &self.set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Vote;

    fn committee(n: usize) -> ValidatorSet {
        ValidatorSet::new(
            (0..n)
                .map(|i| Validator::new(format!("v{i}"), 1).unwrap())
                .collect(),
        )
    }

    #[test]
    fn proposer_rotates_deterministically() {
        let mgr = StaticValidatorManager::new(committee(4));
        assert_eq!(mgr.get_proposer_for_epoch(0).id, "v0");
        assert_eq!(mgr.get_proposer_for_epoch(1).id, "v1");
        assert_eq!(mgr.get_proposer_for_epoch(4).id, "v0");
    }

    #[test]
    fn majority_requires_strictly_more_than_two_thirds() {
        let set = committee(3);
        let mut votes = VoteSet::new();
        // 1 of 3 is not a majority.
        votes.insert(Vote {
            block: None,
            voter_id: "v0".into(),
            epoch: 0,
        });
        assert!(!set.has_majority(&votes));

        // 2 of 3 (weight 2/3) does not strictly exceed two-thirds: 2*3 > 3*2
        // is 6 > 6, which is false.
        votes.insert(Vote {
            block: None,
            voter_id: "v1".into(),
            epoch: 0,
        });
        assert!(!set.has_majority(&votes));

        // 3 of 4 (weight 3/4) does strictly exceed two-thirds: 3*3 > 4*2 is
        // 9 > 8.
        let set = committee(4);
        let mut votes = VoteSet::new();
        for voter in ["v0", "v1", "v2"] {
            votes.insert(Vote {
                block: None,
                voter_id: voter.into(),
                epoch: 0,
            });
        }
        assert!(set.has_majority(&votes));
    }

    #[test]
    fn votes_from_unknown_voters_do_not_count() {
        let set = committee(3);
        let mut votes = VoteSet::new();
        votes.insert(Vote {
            block: None,
            voter_id: "ghost".into(),
            epoch: 0,
        });
        assert!(!set.has_majority(&votes));
    }
}
