//! Pure log reduction.
//!
//! A reducer turns a decoded event and the state before it into the state
//! after it. Reducers never read the chain; whenever the prior state alone is
//! not enough they report [`Reduction::Inconsistent`] and the subscriber falls
//! back to regenerating the state from chain reads.

use {
    crate::StateGenerating,
    alloy::{
        primitives::{Address, B256},
        rpc::types::Log,
        sol_types::SolEventInterface,
    },
    anyhow::Result,
    ethrpc::{Block, BlockInfo},
    std::fmt::Debug,
};

/// Outcome of applying one log to a state.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Reduction<S> {
    /// The log changed the state.
    Updated(S),
    /// The log was understood but did not change anything.
    Unchanged,
    /// Nothing handles this log.
    Unhandled,
    /// The log cannot be applied to the prior state. The state of the block
    /// has to be regenerated from chain reads.
    Inconsistent(String),
}

impl<S> Reduction<S> {
    pub fn map<T>(self, f: impl FnOnce(S) -> T) -> Reduction<T> {
        match self {
            Self::Updated(state) => Reduction::Updated(f(state)),
            Self::Unchanged => Reduction::Unchanged,
            Self::Unhandled => Reduction::Unhandled,
            Self::Inconsistent(reason) => Reduction::Inconsistent(reason),
        }
    }

    /// Convenience for reducers that compute a new state which may or may not
    /// differ from the old one.
    pub fn updated_if_changed(prior: &S, state: S) -> Self
    where
        S: PartialEq,
    {
        match prior == &state {
            true => Self::Unchanged,
            false => Self::Updated(state),
        }
    }
}

/// Where a log was emitted.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LogMeta {
    pub address: Address,
    pub block_number: u64,
    pub block_hash: B256,
    pub transaction_hash: Option<B256>,
    pub log_index: Option<u64>,
}

impl LogMeta {
    pub fn new(log: &Log, block: &BlockInfo) -> Self {
        Self {
            address: log.address(),
            block_number: log.block_number.unwrap_or(block.number),
            block_hash: log.block_hash.unwrap_or(block.hash),
            transaction_hash: log.transaction_hash,
            log_index: log.log_index,
        }
    }
}

/// Table of pure event handlers for one kind of entity.
///
/// `Event` is usually the `*Events` enum that `sol!` generates for an
/// interface, so that implementations dispatch with an exhaustive `match`.
pub trait LogReducer: Send + Sync + 'static {
    type State;
    type Event: SolEventInterface;

    fn reduce(
        &self,
        state: &Self::State,
        event: Self::Event,
        meta: &LogMeta,
    ) -> Reduction<Self::State>;
}

/// Decodes a log into one of the events of `E`.
///
/// Logs of other events are silently skipped. Logs that claim to be one of
/// the events but fail to decode are logged and skipped as well.
pub fn decode<E: SolEventInterface>(log: &Log) -> Option<E> {
    let selector = log.topics().first()?;
    if !E::SELECTORS.contains(selector) {
        return None;
    }
    match E::decode_raw_log(log.topics(), &log.data().data) {
        Ok(event) => Some(event),
        Err(err) => {
            tracing::warn!(
                ?err,
                address = ?log.address(),
                tx = ?log.transaction_hash,
                "failed to decode log"
            );
            None
        }
    }
}

/// Everything a [`Subscriber`](crate::Subscriber) needs to keep one entity's
/// state up to date.
#[async_trait::async_trait]
pub trait EventSourced: Send + Sync + 'static {
    type State: Clone + Debug + Send + Sync + 'static;

    /// Applies a raw log to the state.
    fn apply(&self, state: &Self::State, log: &Log, meta: &LogMeta) -> Reduction<Self::State>;

    async fn generate_state(&self, block: Block) -> Result<Self::State>;
}

/// A reducer paired with the generator building the same state from chain
/// reads.
pub struct Events<R, G> {
    pub reducer: R,
    pub generator: G,
}

impl<R, G> Events<R, G> {
    pub fn new(reducer: R, generator: G) -> Self {
        Self { reducer, generator }
    }
}

#[async_trait::async_trait]
impl<R, G> EventSourced for Events<R, G>
where
    R: LogReducer,
    R::State: Clone + Debug + Send + Sync + 'static,
    G: StateGenerating<State = R::State> + 'static,
{
    type State = R::State;

    fn apply(&self, state: &Self::State, log: &Log, meta: &LogMeta) -> Reduction<Self::State> {
        match decode::<R::Event>(log) {
            Some(event) => self.reducer.reduce(state, event, meta),
            None => Reduction::Unhandled,
        }
    }

    async fn generate_state(&self, block: Block) -> Result<Self::State> {
        self.generator.generate_state(block).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use {
        super::*,
        alloy::{
            primitives::{Bytes, LogData, U256},
            sol_types::SolEvent,
        },
    };

    alloy::sol! {
        interface ICounter {
            event Increment(uint256 amount);
            event Reset();
            event Unrelated(uint256 value);
        }
    }

    pub fn log(address: Address, topics: Vec<B256>, data: Vec<u8>) -> Log {
        Log {
            inner: alloy::primitives::Log {
                address,
                data: LogData::new_unchecked(topics, Bytes::from(data)),
            },
            ..Default::default()
        }
    }

    pub fn increment(amount: u64) -> Log {
        log(
            Address::ZERO,
            vec![ICounter::Increment::SIGNATURE_HASH],
            U256::from(amount).to_be_bytes::<32>().to_vec(),
        )
    }

    /// An `Increment` log whose data is too short to decode.
    pub fn malformed_increment() -> Log {
        log(
            Address::ZERO,
            vec![ICounter::Increment::SIGNATURE_HASH],
            vec![1, 2, 3],
        )
    }

    pub struct Counter;

    impl LogReducer for Counter {
        type State = u64;
        type Event = ICounter::ICounterEvents;

        fn reduce(&self, state: &u64, event: Self::Event, _: &LogMeta) -> Reduction<u64> {
            match event {
                ICounter::ICounterEvents::Increment(event) => match u64::try_from(event.amount)
                    .ok()
                    .and_then(|amount| state.checked_add(amount))
                {
                    Some(state) => Reduction::Updated(state),
                    None => Reduction::Inconsistent("counter overflow".into()),
                },
                ICounter::ICounterEvents::Reset(_) => Reduction::updated_if_changed(state, 0),
                ICounter::ICounterEvents::Unrelated(_) => Reduction::Unchanged,
            }
        }
    }

    pub struct NoGenerator;

    #[async_trait::async_trait]
    impl StateGenerating for NoGenerator {
        type State = u64;

        async fn generate_state(&self, _: Block) -> Result<u64> {
            anyhow::bail!("no chain")
        }
    }

    pub fn counter() -> Events<Counter, NoGenerator> {
        Events::new(Counter, NoGenerator)
    }

    #[test]
    fn applies_known_events() {
        let meta = LogMeta::default();
        assert_eq!(
            counter().apply(&1, &increment(2), &meta),
            Reduction::Updated(3)
        );
        assert_eq!(
            counter().apply(&u64::MAX, &increment(1), &meta),
            Reduction::Inconsistent("counter overflow".into())
        );

        let reset = log(Address::ZERO, vec![ICounter::Reset::SIGNATURE_HASH], vec![]);
        assert_eq!(counter().apply(&5, &reset, &meta), Reduction::Updated(0));
        assert_eq!(counter().apply(&0, &reset, &meta), Reduction::Unchanged);
    }

    #[test]
    fn unknown_logs_are_unhandled() {
        let meta = LogMeta::default();
        let unknown = log(Address::ZERO, vec![B256::repeat_byte(1)], vec![]);
        let anonymous = log(Address::ZERO, vec![], vec![]);

        assert_eq!(counter().apply(&1, &unknown, &meta), Reduction::Unhandled);
        assert_eq!(counter().apply(&1, &anonymous, &meta), Reduction::Unhandled);
    }

    #[test]
    fn malformed_logs_are_unhandled() {
        assert_eq!(
            counter().apply(&1, &malformed_increment(), &LogMeta::default()),
            Reduction::Unhandled
        );
    }

    #[test]
    fn meta_falls_back_to_block_header() {
        let block = BlockInfo {
            number: 9,
            hash: B256::repeat_byte(9),
            ..Default::default()
        };
        let mut log = increment(1);
        log.log_index = Some(4);

        let meta = LogMeta::new(&log, &block);
        assert_eq!(meta.block_number, 9);
        assert_eq!(meta.block_hash, B256::repeat_byte(9));
        assert_eq!(meta.log_index, Some(4));

        log.block_number = Some(10);
        assert_eq!(LogMeta::new(&log, &block).block_number, 10);
    }

    #[test]
    fn reduction_map_keeps_outcome() {
        assert_eq!(Reduction::Updated(2).map(|x| x * 2), Reduction::Updated(4));
        assert_eq!(
            Reduction::<u8>::Inconsistent("x".into()).map(u16::from),
            Reduction::Inconsistent("x".into())
        );
        assert_eq!(Reduction::<u8>::Unhandled.map(u16::from), Reduction::Unhandled);
    }
}
