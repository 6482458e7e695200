use crate::crypto::Hash;
use crate::store::StoreView;
use crate::types::{Height, ValidatorId};
use serde::{Deserialize, Serialize};

/// A plain account record. Transaction/business semantics are out of scope
/// here; this is the state container, not the rules that mutate it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub nonce: u64,
    pub balance: u128,
}

/// A split-contract resource. Its business rules (who may update/delete it,
/// what the participant shares mean) are out of scope; only the container
/// operations below are specified.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitContract {
    pub resource_id: String,
    pub participants: Vec<(ValidatorId, u32)>,
    pub expires_at_height: Height,
}

/// A pending slash intent, collected during a block's execution and drained
/// by the outer block-assembly layer after `commit()`. The semantics of
/// what triggers a slash intent are out of scope here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlashIntent {
    pub offender: ValidatorId,
    pub reason: String,
}

/// A pending change to the active validator set, drained after `Commit()`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidatorDiffEntry {
    Add { id: ValidatorId, weight: u64 },
    Remove { id: ValidatorId },
}

const ACCOUNT_PREFIX: &str = "account/";
const SPLIT_CONTRACT_PREFIX: &str = "split_contract/";

fn account_key(id: &str) -> Vec<u8> {
    format!("{ACCOUNT_PREFIX}{id}").into_bytes()
}

fn split_contract_key(resource_id: &str) -> Vec<u8> {
    format!("{SPLIT_CONTRACT_PREFIX}{resource_id}").into_bytes()
}

/// Maintains three independent `StoreView`s over the same committed state so
/// three streams of transaction execution (delivered / checked / screened)
/// can proceed without interfering with one another.
pub struct LedgerState<S: StoreView + Clone> {
    chain_id: String,
    delivered: S,
    checked: S,
    screened: S,
    slash_intents: Vec<SlashIntent>,
    validator_diff: Vec<ValidatorDiffEntry>,
    coinbase_processed: bool,
}

impl<S: StoreView + Clone> LedgerState<S> {
    pub fn new(chain_id: impl Into<String>, genesis: S) -> Self {
        let checked = genesis.copy();
        let screened = genesis.copy();
        Self {
            chain_id: chain_id.into(),
            delivered: genesis,
            checked,
            screened,
            slash_intents: Vec::new(),
            validator_diff: Vec::new(),
            coinbase_processed: false,
        }
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    pub fn height(&self) -> Height {
        self.delivered.height()
    }

    pub fn delivered(&self) -> &S {
        &self.delivered
    }

    pub fn delivered_mut(&mut self) -> &mut S {
        &mut self.delivered
    }

    pub fn checked(&self) -> &S {
        &self.checked
    }

    pub fn checked_mut(&mut self) -> &mut S {
        &mut self.checked
    }

    pub fn screened(&self) -> &S {
        &self.screened
    }

    pub fn screened_mut(&mut self) -> &mut S {
        &mut self.screened
    }

    /// Re-anchor `delivered` to `fresh_delivered` (a view the caller obtained
    /// from the backing versioned store at the target `(height, root)`),
    /// then clone it into `checked`/`screened`; clears scratch state.
    /// Constructing a view on a root the store never persisted is a
    /// storage-integrity violation and is fatal at the store, not recovered
    /// here.
    pub fn reset_state(&mut self, fresh_delivered: S) {
        self.checked = fresh_delivered.copy();
        self.screened = fresh_delivered.copy();
        self.delivered = fresh_delivered;
        self.slash_intents.clear();
        self.validator_diff.clear();
        self.coinbase_processed = false;
    }

    /// Persist `delivered`, advance its height, and re-clone it into
    /// `checked`/`screened`. Scratch state is intentionally *not* cleared
    /// here — callers drain it via the explicit accessors after `commit()`
    /// returns.
    pub fn commit(&mut self) -> Hash {
        let root = self.delivered.save();
        self.delivered.increment_height();
        self.checked = self.delivered.copy();
        self.screened = self.delivered.copy();
        root
    }

    pub fn get_account(&self, id: &str) -> Option<Account> {
        self.delivered
            .get(&account_key(id))
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
    }

    pub fn set_account(&mut self, id: &str, account: Account) {
        let bytes = serde_json::to_vec(&account).expect("Account must serialize");
        self.delivered.set(account_key(id), bytes);
    }

    pub fn get_split_contract(&self, resource_id: &str) -> Option<SplitContract> {
        self.delivered
            .get(&split_contract_key(resource_id))
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
    }

    fn set_split_contract(&mut self, contract: &SplitContract) {
        let bytes = serde_json::to_vec(contract).expect("SplitContract must serialize");
        self.delivered
            .set(split_contract_key(&contract.resource_id), bytes);
    }

    /// Rejects duplicates by `resource_id`. Returns `true` exactly once per
    /// distinct `resource_id`.
    pub fn add_split_contract(&mut self, contract: SplitContract) -> bool {
        if self.get_split_contract(&contract.resource_id).is_some() {
            return false;
        }
        self.set_split_contract(&contract);
        true
    }

    /// Rejects updates to a contract that does not exist.
    pub fn update_split_contract(&mut self, contract: SplitContract) -> bool {
        if self.get_split_contract(&contract.resource_id).is_none() {
            return false;
        }
        self.set_split_contract(&contract);
        true
    }

    pub fn delete_split_contract(&mut self, resource_id: &str) -> bool {
        if self.get_split_contract(resource_id).is_none() {
            return false;
        }
        self.delivered.delete(&split_contract_key(resource_id));
        true
    }

    /// Delete every split contract whose `expires_at_height` has passed.
    /// Returns the ids of the contracts removed.
    ///
    /// This walks an explicit index rather than the whole keyspace, since a
    /// `StoreView` only exposes point lookups — see `split_contract_index`.
    pub fn delete_expired_split_contracts(
        &mut self,
        height: Height,
        known_resource_ids: &[String],
    ) -> Vec<String> {
        let mut expired = Vec::new();
        for id in known_resource_ids {
            if let Some(contract) = self.get_split_contract(id) {
                if contract.expires_at_height <= height {
                    self.delivered.delete(&split_contract_key(id));
                    expired.push(id.clone());
                }
            }
        }
        expired
    }

    pub fn add_slash_intent(&mut self, intent: SlashIntent) {
        self.slash_intents.push(intent);
    }

    pub fn get_slash_intents(&self) -> &[SlashIntent] {
        &self.slash_intents
    }

    pub fn clear_slash_intents(&mut self) {
        self.slash_intents.clear();
    }

    pub fn coinbase_transaction_processed(&self) -> bool {
        self.coinbase_processed
    }

    pub fn set_coinbase_transaction_processed(&mut self, processed: bool) {
        self.coinbase_processed = processed;
    }

    pub fn get_and_clear_validator_diff(&mut self) -> Vec<ValidatorDiffEntry> {
        std::mem::take(&mut self.validator_diff)
    }

    pub fn set_validator_diff(&mut self, diff: Vec<ValidatorDiffEntry>) {
        self.validator_diff = diff;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStoreView;

    fn ledger() -> LedgerState<MemStoreView> {
        LedgerState::new("test-chain", MemStoreView::genesis())
    }

    #[test]
    fn reset_state_yields_byte_equal_views() {
        let mut l = ledger();
        l.delivered_mut().set(b"x".to_vec(), b"1".to_vec());
        let fresh = MemStoreView::genesis();
        l.reset_state(fresh);
        assert_eq!(l.delivered().get(b"x"), None);
        assert_eq!(l.checked().get(b"x"), l.delivered().get(b"x"));
        assert_eq!(l.screened().get(b"x"), l.delivered().get(b"x"));
    }

    #[test]
    fn commit_reclones_into_checked_and_screened() {
        let mut l = ledger();
        l.set_account("alice", Account { nonce: 1, balance: 10 });
        l.commit();
        assert_eq!(l.height(), 1);
        assert_eq!(l.checked().get(&account_key("alice")), l.delivered().get(&account_key("alice")));
        assert_eq!(l.screened().get(&account_key("alice")), l.delivered().get(&account_key("alice")));

        // checked is an independent fork: mutating it must not affect delivered.
        l.checked_mut().set(b"only-in-checked".to_vec(), b"1".to_vec());
        assert_eq!(l.delivered().get(b"only-in-checked"), None);
    }

    #[test]
    fn commit_does_not_clear_scratch_state() {
        let mut l = ledger();
        l.add_slash_intent(SlashIntent {
            offender: "v1".into(),
            reason: "equivocation".into(),
        });
        l.commit();
        assert_eq!(l.get_slash_intents().len(), 1);
        l.clear_slash_intents();
        assert!(l.get_slash_intents().is_empty());
    }

    #[test]
    fn add_split_contract_is_exactly_once_per_resource_id() {
        let mut l = ledger();
        let contract = SplitContract {
            resource_id: "r1".into(),
            participants: vec![("a".into(), 50), ("b".into(), 50)],
            expires_at_height: 100,
        };
        assert!(l.add_split_contract(contract.clone()));
        assert!(!l.add_split_contract(contract));
    }

    #[test]
    fn update_split_contract_rejects_missing() {
        let mut l = ledger();
        let contract = SplitContract {
            resource_id: "r1".into(),
            participants: vec![],
            expires_at_height: 1,
        };
        assert!(!l.update_split_contract(contract));
    }

    #[test]
    fn delete_expired_split_contracts_sweeps_past_height() {
        let mut l = ledger();
        l.add_split_contract(SplitContract {
            resource_id: "expired".into(),
            participants: vec![],
            expires_at_height: 10,
        });
        l.add_split_contract(SplitContract {
            resource_id: "alive".into(),
            participants: vec![],
            expires_at_height: 1000,
        });

        let removed =
            l.delete_expired_split_contracts(50, &["expired".to_string(), "alive".to_string()]);
        assert_eq!(removed, vec!["expired".to_string()]);
        assert!(l.get_split_contract("expired").is_none());
        assert!(l.get_split_contract("alive").is_some());
    }
}
