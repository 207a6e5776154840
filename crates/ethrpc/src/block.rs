use {
    alloy::{
        eips::{BlockId, BlockNumberOrTag},
        primitives::B256,
    },
    std::time::Instant,
};

/// The state of the chain at which information should be retrieved.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub enum Block {
    /// The most recent state. Consumers resolve this to a concrete block
    /// number once so that everything read for one request is consistent.
    Recent,
    Number(u64),
}

impl From<Block> for BlockId {
    fn from(val: Block) -> Self {
        match val {
            Block::Recent => BlockId::Number(BlockNumberOrTag::Latest),
            Block::Number(number) => BlockId::number(number),
        }
    }
}

impl From<u64> for Block {
    fn from(number: u64) -> Self {
        Self::Number(number)
    }
}

/// Block information.
#[derive(Clone, Copy, Debug, Eq)]
pub struct BlockInfo {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: u64,
    /// When the system noticed the new block.
    pub observed_at: Instant,
}

impl BlockInfo {
    /// Number of the block this one builds on.
    pub fn parent_number(&self) -> u64 {
        self.number.saturating_sub(1)
    }
}

impl Default for BlockInfo {
    fn default() -> Self {
        Self {
            number: Default::default(),
            hash: Default::default(),
            parent_hash: Default::default(),
            timestamp: Default::default(),
            observed_at: Instant::now(),
        }
    }
}

impl PartialEq<Self> for BlockInfo {
    fn eq(&self, other: &Self) -> bool {
        self.number == other.number
            && self.hash == other.hash
            && self.parent_hash == other.parent_hash
            && self.timestamp == other.timestamp
    }
}

impl From<alloy::rpc::types::Header> for BlockInfo {
    fn from(value: alloy::rpc::types::Header) -> Self {
        Self {
            number: value.number,
            hash: value.hash,
            parent_hash: value.parent_hash,
            timestamp: value.timestamp,
            observed_at: Instant::now(),
        }
    }
}

impl From<alloy::rpc::types::Block> for BlockInfo {
    fn from(value: alloy::rpc::types::Block) -> Self {
        value.header.into()
    }
}
