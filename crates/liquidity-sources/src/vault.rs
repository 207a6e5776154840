//! Price and holdings of a vault that values one token with an oracle.
//!
//! The oracle answer and the vault's token balance come from different
//! contracts and are reduced independently, each through its own lens into
//! [`VaultState`].

use {
    alloy::primitives::{Address, I256, U256},
    anyhow::{Context as _, Result},
    ethrpc::{
        Block,
        multicall::{Batcher, Request},
    },
    state_cache::{
        BlockLogSource,
        ComposedSubscriber,
        Composition,
        Events,
        LogMeta,
        LogReducer,
        Reduction,
        StateGenerating,
        Subscriber,
        SubscriberConfig,
        lens,
    },
    std::sync::Arc,
};

alloy::sol! {
    interface IPriceFeed {
        event AnswerUpdated(int256 indexed current, uint256 indexed roundId, uint256 updatedAt);

        function latestAnswer() external view returns (int256);
    }

    interface IERC20 {
        event Transfer(address indexed from, address indexed to, uint256 value);

        function balanceOf(address owner) external view returns (uint256);
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VaultState {
    pub holder: Address,
    pub price: I256,
    pub balance: U256,
}

impl VaultState {
    /// Value of the holdings in oracle units. `None` for a negative price.
    pub fn value(&self) -> Option<U256> {
        let price = U256::try_from(self.price).ok()?;
        self.balance.checked_mul(price)
    }
}

pub struct AnswerReducer;

impl LogReducer for AnswerReducer {
    type Event = IPriceFeed::IPriceFeedEvents;
    type State = I256;

    fn reduce(&self, price: &I256, event: Self::Event, _: &LogMeta) -> Reduction<I256> {
        match event {
            IPriceFeed::IPriceFeedEvents::AnswerUpdated(answer) => {
                Reduction::updated_if_changed(price, answer.current)
            }
        }
    }
}

pub struct AnswerFetcher {
    pub feed: Address,
    pub batcher: Batcher,
}

#[async_trait::async_trait]
impl StateGenerating for AnswerFetcher {
    type State = I256;

    async fn generate_state(&self, block: Block) -> Result<I256> {
        let request = Request::sol(self.feed, &IPriceFeed::latestAnswerCall {});
        self.batcher
            .fetch(vec![request], block)
            .await
            .with_context(|| format!("failed to read answer of {}", self.feed))?
            .pop()
            .context("missing answer")
    }
}

/// Balance of one holder, tracked through the token's transfers.
pub struct BalanceReducer {
    pub holder: Address,
}

impl LogReducer for BalanceReducer {
    type Event = IERC20::IERC20Events;
    type State = U256;

    fn reduce(&self, balance: &U256, event: Self::Event, _: &LogMeta) -> Reduction<U256> {
        let IERC20::IERC20Events::Transfer(transfer) = event;
        let incoming = transfer.to == self.holder;
        let outgoing = transfer.from == self.holder;
        match (incoming, outgoing) {
            (true, true) | (false, false) => Reduction::Unchanged,
            (true, false) => match balance.checked_add(transfer.value) {
                Some(updated) => Reduction::updated_if_changed(balance, updated),
                None => Reduction::Inconsistent("balance overflow".to_string()),
            },
            (false, true) => match balance.checked_sub(transfer.value) {
                Some(updated) => Reduction::updated_if_changed(balance, updated),
                None => Reduction::Inconsistent(format!(
                    "transfer of {} exceeds balance {balance}",
                    transfer.value
                )),
            },
        }
    }
}

pub struct BalanceFetcher {
    pub token: Address,
    pub holder: Address,
    pub batcher: Batcher,
}

#[async_trait::async_trait]
impl StateGenerating for BalanceFetcher {
    type State = U256;

    async fn generate_state(&self, block: Block) -> Result<U256> {
        let request = Request::sol(
            self.token,
            &IERC20::balanceOfCall {
                owner: self.holder,
            },
        );
        self.batcher
            .fetch(vec![request], block)
            .await
            .with_context(|| format!("failed to read balance of {}", self.holder))?
            .pop()
            .context("missing balance")
    }
}

pub type VaultSubscriber = ComposedSubscriber<VaultState>;

/// Composition of the oracle answer of `feed` and the `token` balance of
/// `holder`.
pub fn composition(
    feed: Address,
    token: Address,
    holder: Address,
    batcher: Batcher,
) -> Result<Composition<VaultState>> {
    Composition::new(VaultState {
        holder,
        ..Default::default()
    })
    .with_part(
        lens!(VaultState, price),
        vec![feed],
        Events::new(
            AnswerReducer,
            AnswerFetcher {
                feed,
                batcher: batcher.clone(),
            },
        ),
    )?
    .with_part(
        lens!(VaultState, balance),
        vec![token],
        Events::new(
            BalanceReducer { holder },
            BalanceFetcher {
                token,
                holder,
                batcher,
            },
        ),
    )
}

pub fn subscriber(
    feed: Address,
    token: Address,
    holder: Address,
    batcher: Batcher,
    log_source: Arc<dyn BlockLogSource>,
    config: SubscriberConfig,
) -> Result<Arc<VaultSubscriber>> {
    let composition = composition(feed, token, holder, batcher)?;
    Ok(Arc::new(Subscriber::composed(
        format!("vault:{holder}"),
        "vault",
        composition,
        log_source,
        config,
    )))
}

#[cfg(test)]
mod tests {
    use {super::*, maplit::hashmap};

    const HOLDER: Address = Address::repeat_byte(0xaa);
    const OTHER: Address = Address::repeat_byte(0xbb);

    fn transfer(from: Address, to: Address, value: u64) -> IERC20::IERC20Events {
        IERC20::IERC20Events::Transfer(IERC20::Transfer {
            from,
            to,
            value: U256::from(value),
        })
    }

    fn reduce(balance: u64, event: IERC20::IERC20Events) -> Reduction<U256> {
        BalanceReducer { holder: HOLDER }.reduce(&U256::from(balance), event, &LogMeta::default())
    }

    #[test]
    fn transfers_move_the_holders_balance() {
        assert_eq!(
            reduce(10, transfer(OTHER, HOLDER, 5)),
            Reduction::Updated(U256::from(15))
        );
        assert_eq!(
            reduce(10, transfer(HOLDER, OTHER, 4)),
            Reduction::Updated(U256::from(6))
        );
        assert_eq!(reduce(10, transfer(HOLDER, HOLDER, 4)), Reduction::Unchanged);
        assert_eq!(reduce(10, transfer(OTHER, OTHER, 4)), Reduction::Unchanged);
        assert_eq!(reduce(10, transfer(OTHER, HOLDER, 0)), Reduction::Unchanged);
    }

    #[test]
    fn overdrawn_balance_is_inconsistent() {
        assert_eq!(
            reduce(3, transfer(HOLDER, OTHER, 4)),
            Reduction::Inconsistent("transfer of 4 exceeds balance 3".to_string())
        );
    }

    #[test]
    fn value_of_holdings() {
        let cases = hashmap! {
            (2_i64, 3_u64) => Some(U256::from(6)),
            (-2, 3) => None,
            (0, 3) => Some(U256::ZERO),
        };
        for ((price, balance), value) in cases {
            let state = VaultState {
                holder: HOLDER,
                price: I256::try_from(price).unwrap(),
                balance: U256::from(balance),
            };
            assert_eq!(state.value(), value);
        }
    }
}
