//! Reserves of a single Uniswap V2 style pair.
//!
//! Every swap, mint and burn of a pair ends with a `Sync` event carrying the
//! new reserves, so the reducer only has to replace them.

use {
    alloy::primitives::Address,
    anyhow::{Context as _, Result},
    ethrpc::{
        Block,
        multicall::{Batcher, Request},
    },
    state_cache::{
        BlockLogSource,
        Events,
        LogMeta,
        LogReducer,
        Reduction,
        StateGenerating,
        Subscriber,
        SubscriberConfig,
    },
    std::sync::Arc,
};

alloy::sol! {
    interface IUniswapV2Pair {
        event Sync(uint112 reserve0, uint112 reserve1);

        function getReserves()
            external
            view
            returns (uint112 reserve0, uint112 reserve1, uint32 blockTimestampLast);
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Reserves {
    pub reserve0: u128,
    pub reserve1: u128,
}

impl From<IUniswapV2Pair::getReservesReturn> for Reserves {
    fn from(reserves: IUniswapV2Pair::getReservesReturn) -> Self {
        Self {
            reserve0: reserves.reserve0.to(),
            reserve1: reserves.reserve1.to(),
        }
    }
}

pub struct SyncReducer;

impl LogReducer for SyncReducer {
    type Event = IUniswapV2Pair::IUniswapV2PairEvents;
    type State = Reserves;

    fn reduce(&self, state: &Reserves, event: Self::Event, _: &LogMeta) -> Reduction<Reserves> {
        match event {
            IUniswapV2Pair::IUniswapV2PairEvents::Sync(sync) => Reduction::updated_if_changed(
                state,
                Reserves {
                    reserve0: sync.reserve0.to(),
                    reserve1: sync.reserve1.to(),
                },
            ),
        }
    }
}

/// Reads the reserves of a pair with `getReserves`.
pub struct ReservesFetcher {
    pub pair: Address,
    pub batcher: Batcher,
}

#[async_trait::async_trait]
impl StateGenerating for ReservesFetcher {
    type State = Reserves;

    async fn generate_state(&self, block: Block) -> Result<Reserves> {
        let request =
            Request::sol(self.pair, &IUniswapV2Pair::getReservesCall {}).map(Reserves::from);
        self.batcher
            .fetch(vec![request], block)
            .await
            .with_context(|| format!("failed to read reserves of {}", self.pair))?
            .pop()
            .context("missing reserves")
    }
}

pub type PairHandler = Events<SyncReducer, ReservesFetcher>;

pub type PairSubscriber = Subscriber<PairHandler>;

/// Subscriber following the reserves of `pair`.
pub fn subscriber(
    pair: Address,
    batcher: Batcher,
    log_source: Arc<dyn BlockLogSource>,
    config: SubscriberConfig,
) -> Arc<PairSubscriber> {
    Arc::new(Subscriber::new(
        format!("uniswap_v2:{pair}"),
        "uniswap_v2",
        Events::new(SyncReducer, ReservesFetcher { pair, batcher }),
        vec![pair],
        log_source,
        config,
    ))
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        alloy::{
            primitives::{U256, aliases::U112},
            rpc::types::Log,
            sol_types::SolEvent,
        },
        state_cache::EventSourced,
    };

    fn sync(reserve0: u64, reserve1: u64) -> Log {
        let event = IUniswapV2Pair::Sync {
            reserve0: U112::from(reserve0),
            reserve1: U112::from(reserve1),
        };
        Log {
            inner: alloy::primitives::Log {
                address: Address::repeat_byte(1),
                data: event.encode_log_data(),
            },
            ..Default::default()
        }
    }

    fn handler() -> PairHandler {
        let executor = ethrpc::multicall::MockMulticallExecuting::new();
        Events::new(
            SyncReducer,
            ReservesFetcher {
                pair: Address::repeat_byte(1),
                batcher: Batcher::new(Arc::new(executor), 10).unwrap(),
            },
        )
    }

    #[test]
    fn sync_replaces_reserves() {
        let state = Reserves {
            reserve0: 1000,
            reserve1: 5,
        };
        assert_eq!(
            handler().apply(&state, &sync(900, 6), &LogMeta::default()),
            Reduction::Updated(Reserves {
                reserve0: 900,
                reserve1: 6,
            })
        );
        assert_eq!(
            handler().apply(&state, &sync(1000, 5), &LogMeta::default()),
            Reduction::Unchanged
        );
    }

    #[test]
    fn reserves_use_full_width() {
        let max = U112::MAX;
        let reserves = Reserves::from(IUniswapV2Pair::getReservesReturn {
            reserve0: max,
            reserve1: U112::ZERO,
            blockTimestampLast: 0,
        });
        assert_eq!(U256::from(reserves.reserve0), U256::from(max));
        assert_eq!(reserves.reserve1, 0);
    }
}
