use crate::crypto::Hash;
use crate::types::{Block, CommitCertificate, ExtendedBlock};
use redb::TableDefinition;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("block already exists")]
    Duplicate,
    #[error("parent block not found: {0}")]
    Orphan(Hash),
    #[error("block not found: {0}")]
    NotFound(Hash),
    #[error("redb error: {0}")]
    Redb(Box<redb::Error>),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("storage error: {0}")]
    Io(String),
}

impl From<redb::Error> for ChainError {
    fn from(e: redb::Error) -> Self {
        Self::Redb(Box::new(e))
    }
}
impl From<redb::DatabaseError> for ChainError {
    fn from(e: redb::DatabaseError) -> Self {
        Self::Redb(Box::new(e.into()))
    }
}
impl From<redb::TableError> for ChainError {
    fn from(e: redb::TableError) -> Self {
        Self::Redb(Box::new(e.into()))
    }
}
impl From<redb::StorageError> for ChainError {
    fn from(e: redb::StorageError) -> Self {
        Self::Redb(Box::new(e.into()))
    }
}
impl From<redb::TransactionError> for ChainError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Redb(Box::new(e.into()))
    }
}
impl From<redb::CommitError> for ChainError {
    fn from(e: redb::CommitError) -> Self {
        Self::Redb(Box::new(e.into()))
    }
}

/// The block-DAG index the engine drives fork choice and finalization from,
/// treated as an external collaborator; this crate supplies the in-memory
/// and `redb`-persisted implementations it needs to run standalone.
pub trait Chain: Send + Sync {
    fn chain_id(&self) -> &str;

    fn root(&self) -> ExtendedBlock;

    /// Insert a block into the DAG. Fails if its parent is unknown (orphan)
    /// or the block already exists.
    fn add_block(&self, block: Block) -> Result<ExtendedBlock, ChainError>;

    fn find_block(&self, hash: &Hash) -> Result<Option<ExtendedBlock>, ChainError>;

    /// Persist mutations to an already-inserted block (e.g. an attached CC).
    fn save_block(&self, block: &ExtendedBlock) -> Result<(), ChainError>;

    fn attach_cc(&self, cc: CommitCertificate) -> Result<ExtendedBlock, ChainError> {
        let mut ext = self
            .find_block(&cc.block_hash)?
            .ok_or(ChainError::NotFound(cc.block_hash))?;
        ext.cc = Some(cc);
        self.save_block(&ext)?;
        Ok(ext)
    }

    /// The deepest descendant reachable from `hash` in the DAG; ties broken
    /// first-seen.
    fn find_deepest_descendant(&self, hash: &Hash) -> Result<Option<ExtendedBlock>, ChainError>;
}

// -----------------------------------------------------------------------------
// In-memory Chain (default for tests and for a single local run).
// -----------------------------------------------------------------------------

struct MemChainInner {
    blocks: HashMap<Hash, ExtendedBlock>,
    root_hash: Hash,
}

/// In-memory DAG index, suitable for tests and single-process runs.
#[derive(Clone)]
pub struct MemChain {
    chain_id: Arc<str>,
    inner: Arc<Mutex<MemChainInner>>,
}

impl MemChain {
    /// Create a chain seeded with a genesis block at height 0, epoch 0.
    pub fn new(chain_id: impl Into<String>) -> Self {
        let chain_id: Arc<str> = chain_id.into().into();
        let genesis = Block::new(Hash::default(), chain_id.as_ref(), 0, 0, "genesis", vec![]);
        let root_hash = genesis.hash;
        let mut blocks = HashMap::new();
        blocks.insert(root_hash, ExtendedBlock::new(genesis));
        Self {
            chain_id,
            inner: Arc::new(Mutex::new(MemChainInner { blocks, root_hash })),
        }
    }
}

impl Chain for MemChain {
    fn chain_id(&self) -> &str {
        &self.chain_id
    }

    fn root(&self) -> ExtendedBlock {
        let inner = self.inner.lock().unwrap();
        inner.blocks[&inner.root_hash].clone()
    }

    fn add_block(&self, block: Block) -> Result<ExtendedBlock, ChainError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.blocks.contains_key(&block.hash) {
            return Err(ChainError::Duplicate);
        }
        if block.parent_hash != Hash::default() && !inner.blocks.contains_key(&block.parent_hash) {
            return Err(ChainError::Orphan(block.parent_hash));
        }
        let hash = block.hash;
        let parent_hash = block.parent_hash;
        let ext = ExtendedBlock::new(block);
        inner.blocks.insert(hash, ext.clone());
        if let Some(parent) = inner.blocks.get_mut(&parent_hash) {
            parent.children.push(hash);
        }
        Ok(ext)
    }

    fn find_block(&self, hash: &Hash) -> Result<Option<ExtendedBlock>, ChainError> {
        Ok(self.inner.lock().unwrap().blocks.get(hash).cloned())
    }

    fn save_block(&self, block: &ExtendedBlock) -> Result<(), ChainError> {
        let mut inner = self.inner.lock().unwrap();
        inner.blocks.insert(block.hash(), block.clone());
        Ok(())
    }

    fn find_deepest_descendant(&self, hash: &Hash) -> Result<Option<ExtendedBlock>, ChainError> {
        let inner = self.inner.lock().unwrap();
        let Some(start) = inner.blocks.get(hash) else {
            return Ok(None);
        };
        // Breadth-first so equal-height descendants are compared in
        // first-seen (insertion) order; `best` is replaced only on strict
        // `>`, so the first block to reach a given height keeps it.
        let mut best = start.clone();
        let mut queue: VecDeque<ExtendedBlock> = VecDeque::from([start.clone()]);
        while let Some(node) = queue.pop_front() {
            if node.height() > best.height() {
                best = node.clone();
            }
            for child_hash in &node.children {
                if let Some(child) = inner.blocks.get(child_hash) {
                    queue.push_back(child.clone());
                }
            }
        }
        Ok(Some(best))
    }
}

// -----------------------------------------------------------------------------
// redb-backed Chain (persistent).
// -----------------------------------------------------------------------------

const TABLE_BLOCKS: TableDefinition<&[u8; 32], Vec<u8>> = TableDefinition::new("blocks");
const TABLE_CHILDREN: TableDefinition<&[u8; 32], Vec<u8>> = TableDefinition::new("children");
const TABLE_META: TableDefinition<&str, Vec<u8>> = TableDefinition::new("meta");

pub struct RedbChain {
    db: redb::Database,
    chain_id: String,
    root_hash: Hash,
}

impl RedbChain {
    pub fn new<P: AsRef<Path>>(path: P, chain_id: impl Into<String>) -> Result<Self, ChainError> {
        let chain_id = chain_id.into();
        let p = path.as_ref();
        if let Some(parent) = p.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ChainError::Io(format!("failed to create chain dir: {e}")))?;
        }
        let db = redb::Database::create(p)?;
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(TABLE_BLOCKS)?;
            let _ = write_txn.open_table(TABLE_CHILDREN)?;
            let _ = write_txn.open_table(TABLE_META)?;
        }
        write_txn.commit()?;

        let genesis = Block::new(Hash::default(), chain_id.clone(), 0, 0, "genesis", vec![]);
        let root_hash = genesis.hash;
        let chain = Self {
            db,
            chain_id,
            root_hash,
        };
        if chain.find_block(&root_hash)?.is_none() {
            chain.save_block(&ExtendedBlock::new(genesis))?;
        }
        Ok(chain)
    }
}

impl Chain for RedbChain {
    fn chain_id(&self) -> &str {
        &self.chain_id
    }

    fn root(&self) -> ExtendedBlock {
        self.find_block(&self.root_hash)
            .ok()
            .flatten()
            .expect("genesis block must exist: chain storage corrupted")
    }

    fn add_block(&self, block: Block) -> Result<ExtendedBlock, ChainError> {
        if self.find_block(&block.hash)?.is_some() {
            return Err(ChainError::Duplicate);
        }
        if block.parent_hash != Hash::default() && self.find_block(&block.parent_hash)?.is_none() {
            return Err(ChainError::Orphan(block.parent_hash));
        }
        let parent_hash = block.parent_hash;
        let hash = block.hash;
        let ext = ExtendedBlock::new(block);
        self.save_block(&ext)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TABLE_CHILDREN)?;
            let mut children: Vec<Hash> = table
                .get(&parent_hash.0)?
                .map(|v| bincode::deserialize(&v.value()))
                .transpose()?
                .unwrap_or_default();
            children.push(hash);
            table.insert(&parent_hash.0, bincode::serialize(&children)?)?;
        }
        write_txn.commit()?;
        Ok(ext)
    }

    fn find_block(&self, hash: &Hash) -> Result<Option<ExtendedBlock>, ChainError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TABLE_BLOCKS)?;
        if let Some(val) = table.get(&hash.0)? {
            let mut ext: ExtendedBlock = bincode::deserialize(&val.value())?;
            drop(table);
            let children_table = read_txn.open_table(TABLE_CHILDREN)?;
            if let Some(v) = children_table.get(&hash.0)? {
                ext.children = bincode::deserialize(&v.value())?;
            }
            Ok(Some(ext))
        } else {
            Ok(None)
        }
    }

    fn save_block(&self, block: &ExtendedBlock) -> Result<(), ChainError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TABLE_BLOCKS)?;
            table.insert(&block.hash().0, bincode::serialize(block)?)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn find_deepest_descendant(&self, hash: &Hash) -> Result<Option<ExtendedBlock>, ChainError> {
        let Some(start) = self.find_block(hash)? else {
            return Ok(None);
        };
        // Breadth-first so equal-height descendants are compared in
        // first-seen (insertion) order; `best` is replaced only on strict
        // `>`, so the first block to reach a given height keeps it.
        let mut best = start.clone();
        let mut queue: VecDeque<ExtendedBlock> = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            if node.height() > best.height() {
                best = node.clone();
            }
            for child_hash in &node.children {
                if let Some(child) = self.find_block(child_hash)? {
                    queue.push_back(child);
                }
            }
        }
        Ok(Some(best))
    }
}

/// Meta table reserved for persisting engine-owned consensus state
/// (`voteLog`, last-voted-height, epoch) across restarts. Unused today —
/// see DESIGN.md, Open Question 6.
#[allow(dead_code)]
const META_CONSENSUS_STATE_KEY: &str = "consensus_state";
