//! Delivery of per block logs to subscribers.

use {
    alloy::{
        primitives::{Address, B256},
        providers::Provider,
        rpc::types::{Filter, Log},
    },
    anyhow::{Context as _, Result},
    ethrpc::{AlloyProvider, BlockInfo, BlockRetrieving},
    futures::{Stream, StreamExt, future},
    std::{
        collections::{BTreeMap, BTreeSet, HashSet},
        sync::{Arc, Mutex, Weak},
    },
    tracing::instrument,
};

// We expect that there is never a reorg that changes more than the last n blocks.
pub const MAX_REORG_BLOCK_COUNT: u64 = 64;

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SubscriptionId(pub u64);

/// Receiver of the logs of its watched addresses.
///
/// For every block `on_log` is called once per log in on-chain order followed
/// by a single `finish_block`. Blocks are delivered in increasing order except
/// after a reorg, which restarts delivery at the first block that changed.
#[async_trait::async_trait]
pub trait LogSubscribing: Send + Sync {
    fn name(&self) -> &str;

    fn on_log(&self, log: &Log, block: &BlockInfo);

    async fn finish_block(&self, block: &BlockInfo);
}

/// Feed of confirmed blocks and their logs.
#[cfg_attr(any(test, feature = "test-util"), mockall::automock)]
pub trait BlockLogSource: Send + Sync {
    /// Starts delivering logs emitted by `addresses` in blocks after
    /// `from_block`.
    fn subscribe(
        &self,
        subscriber: Arc<dyn LogSubscribing>,
        addresses: Vec<Address>,
        from_block: u64,
    ) -> Result<SubscriptionId>;

    /// Adds addresses to an existing subscription.
    fn extend(&self, id: SubscriptionId, addresses: Vec<Address>) -> Result<()>;

    fn unsubscribe(&self, id: SubscriptionId);
}

/// Access to blocks and their logs.
#[cfg_attr(any(test, feature = "test-util"), mockall::automock)]
#[async_trait::async_trait]
pub trait LogFetching: Send + Sync {
    /// The canonical block with the given number.
    async fn block(&self, number: u64) -> Result<BlockInfo>;

    /// All logs the given addresses emitted in the block.
    async fn logs(&self, block: &BlockInfo, addresses: &[Address]) -> Result<Vec<Log>>;
}

pub struct AlloyLogFetcher(pub AlloyProvider);

#[async_trait::async_trait]
impl LogFetching for AlloyLogFetcher {
    async fn block(&self, number: u64) -> Result<BlockInfo> {
        BlockRetrieving::block(&self.0, number).await
    }

    async fn logs(&self, block: &BlockInfo, addresses: &[Address]) -> Result<Vec<Log>> {
        if addresses.is_empty() {
            return Ok(Vec::new());
        }
        // Querying by hash instead of number guarantees that the logs belong to
        // exactly this block even if a reorg happens in the meantime.
        let filter = Filter::new()
            .at_block_hash(block.hash)
            .address(addresses.to_vec());
        self.0
            .get_logs(&filter)
            .await
            .with_context(|| format!("failed to fetch logs of block {}", block.number))
    }
}

struct Subscription {
    subscriber: Weak<dyn LogSubscribing>,
    addresses: HashSet<Address>,
    from_block: u64,
}

#[derive(Default)]
struct Subscriptions {
    next_id: u64,
    entries: BTreeMap<SubscriptionId, Subscription>,
}

/// In-process [`BlockLogSource`] routing each block's logs to the
/// subscriptions watching the emitting addresses.
///
/// Subscribers are held weakly so dropping a subscriber implicitly ends its
/// subscription.
#[derive(Default)]
pub struct LogDispatcher {
    subscriptions: Mutex<Subscriptions>,
}

impl BlockLogSource for LogDispatcher {
    fn subscribe(
        &self,
        subscriber: Arc<dyn LogSubscribing>,
        addresses: Vec<Address>,
        from_block: u64,
    ) -> Result<SubscriptionId> {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        let id = SubscriptionId(subscriptions.next_id);
        subscriptions.next_id += 1;
        tracing::debug!(?id, name = subscriber.name(), from_block, "new subscription");
        subscriptions.entries.insert(
            id,
            Subscription {
                subscriber: Arc::downgrade(&subscriber),
                addresses: addresses.into_iter().collect(),
                from_block,
            },
        );
        Ok(id)
    }

    fn extend(&self, id: SubscriptionId, addresses: Vec<Address>) -> Result<()> {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        let subscription = subscriptions
            .entries
            .get_mut(&id)
            .with_context(|| format!("unknown subscription {id:?}"))?;
        subscription.addresses.extend(addresses);
        Ok(())
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions.lock().unwrap().entries.remove(&id);
    }
}

impl LogDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Union of all watched addresses.
    pub fn addresses(&self) -> Vec<Address> {
        self.subscriptions
            .lock()
            .unwrap()
            .entries
            .values()
            .flat_map(|subscription| subscription.addresses.iter().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().unwrap().entries.len()
    }

    /// The block the earliest subscription starts after.
    fn first_block(&self) -> Option<u64> {
        self.subscriptions
            .lock()
            .unwrap()
            .entries
            .values()
            .map(|subscription| subscription.from_block)
            .min()
    }

    /// Delivers the logs of one block to all subscriptions that started before
    /// it.
    ///
    /// Every such subscriber gets its `finish_block` call, even without logs in
    /// this block, so that it can account for the block.
    #[instrument(skip_all, fields(block = block.number))]
    pub async fn process_block(&self, block: &BlockInfo, mut logs: Vec<Log>) {
        logs.sort_by_key(|log| log.log_index);

        let targets = {
            let mut subscriptions = self.subscriptions.lock().unwrap();
            subscriptions
                .entries
                .retain(|_, subscription| subscription.subscriber.strong_count() > 0);
            subscriptions
                .entries
                .values()
                .filter(|subscription| subscription.from_block < block.number)
                .filter_map(|subscription| {
                    Some((
                        subscription.subscriber.upgrade()?,
                        subscription.addresses.clone(),
                    ))
                })
                .collect::<Vec<_>>()
        };

        for (subscriber, addresses) in &targets {
            for log in logs
                .iter()
                .filter(|log| !log.removed && addresses.contains(&log.address()))
            {
                subscriber.on_log(log, block);
            }
        }
        future::join_all(
            targets
                .iter()
                .map(|(subscriber, _)| subscriber.finish_block(block)),
        )
        .await;
        tracing::debug!(subscribers = targets.len(), logs = logs.len(), "processed block");
    }

    /// Follows the chain head and dispatches the logs of every block.
    ///
    /// Heads may skip blocks; missing blocks are fetched and processed in
    /// order. The first head is preceded by all blocks after the earliest
    /// subscription's start. When a head does not build on the last processed
    /// block the dispatcher walks back to the common ancestor and reprocesses
    /// the new branch.
    pub async fn run(&self, fetcher: &dyn LogFetching, heads: impl Stream<Item = BlockInfo>) {
        let mut handled = HandledBlocks::default();
        futures::pin_mut!(heads);
        while let Some(head) = heads.next().await {
            if let Err(err) = self.advance(fetcher, &mut handled, head).await {
                tracing::warn!(?err, number = head.number, "failed to process new head");
            }
        }
    }

    async fn advance(
        &self,
        fetcher: &dyn LogFetching,
        handled: &mut HandledBlocks,
        head: BlockInfo,
    ) -> Result<()> {
        let path = handled.path_to(fetcher, head, self.first_block()).await?;
        for block in path {
            let logs = fetcher.logs(&block, &self.addresses()).await?;
            self.process_block(&block, logs).await;
            handled.push(&block);
        }
        Ok(())
    }
}

/// Recently processed blocks used to detect gaps and reorgs.
#[derive(Debug, Default)]
struct HandledBlocks(Vec<(u64, B256)>);

impl HandledBlocks {
    fn contains(&self, number: u64, hash: B256) -> bool {
        self.0.contains(&(number, hash))
    }

    fn last(&self) -> Option<(u64, B256)> {
        self.0.last().copied()
    }

    fn push(&mut self, block: &BlockInfo) {
        // delete forked blocks
        self.0.retain(|(number, _)| *number < block.number);
        self.0.push((block.number, block.hash));
        let start = self.0.len().saturating_sub(MAX_REORG_BLOCK_COUNT as usize);
        self.0.drain(..start);
    }

    /// The blocks that need processing, oldest first, to make `head` the last
    /// handled block.
    ///
    /// Before anything was handled the path starts right after `first_block`.
    async fn path_to(
        &self,
        fetcher: &dyn LogFetching,
        head: BlockInfo,
        first_block: Option<u64>,
    ) -> Result<Vec<BlockInfo>> {
        if self.contains(head.number, head.hash) {
            return Ok(Vec::new());
        }
        let last = self.last();
        let is_start = |block: &BlockInfo| match last {
            Some(_) => self.contains(block.parent_number(), block.parent_hash),
            None => first_block.is_none_or(|first| block.parent_number() <= first),
        };

        let mut path = vec![head];
        let mut cursor = head;
        while cursor.number > 0 && !is_start(&cursor) {
            let depth = match last {
                Some((last_number, _)) => last_number.saturating_sub(cursor.parent_number()),
                None => path.len() as u64,
            };
            if depth >= MAX_REORG_BLOCK_COUNT {
                tracing::warn!(
                    number = cursor.number,
                    "no common ancestor with handled blocks"
                );
                break;
            }
            cursor = fetcher.block(cursor.parent_number()).await?;
            path.push(cursor);
        }
        path.reverse();
        if path.len() > 1 {
            tracing::debug!(
                from = path[0].number,
                to = head.number,
                "filling block gap or reorg"
            );
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::reducer::tests::log, futures::FutureExt};

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl LogSubscribing for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn on_log(&self, log: &Log, block: &BlockInfo) {
            self.events
                .lock()
                .unwrap()
                .push(format!("log {} {}", block.number, log.log_index.unwrap_or_default()));
        }

        async fn finish_block(&self, block: &BlockInfo) {
            self.events
                .lock()
                .unwrap()
                .push(format!("finish {}", block.number));
        }
    }

    impl Recorder {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut self.events.lock().unwrap())
        }
    }

    fn hash(number: u64, fork: u8) -> B256 {
        let mut bytes = [fork; 32];
        bytes[31] = number as u8;
        B256::new(bytes)
    }

    fn block(number: u64, fork: u8) -> BlockInfo {
        BlockInfo {
            number,
            hash: hash(number, fork),
            parent_hash: hash(number.saturating_sub(1), fork),
            ..Default::default()
        }
    }

    fn indexed_log(address: Address, index: u64) -> Log {
        Log {
            log_index: Some(index),
            ..log(address, vec![], vec![])
        }
    }

    #[test]
    fn routes_logs_by_address_in_log_order() {
        let dispatcher = LogDispatcher::new();
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        dispatcher
            .subscribe(a.clone(), vec![Address::repeat_byte(1)], 0)
            .unwrap();
        dispatcher
            .subscribe(b.clone(), vec![Address::repeat_byte(2)], 0)
            .unwrap();

        let logs = vec![
            indexed_log(Address::repeat_byte(1), 3),
            indexed_log(Address::repeat_byte(2), 2),
            indexed_log(Address::repeat_byte(1), 1),
        ];
        dispatcher
            .process_block(&block(1, 0), logs)
            .now_or_never()
            .unwrap();

        assert_eq!(a.take(), ["log 1 1", "log 1 3", "finish 1"]);
        assert_eq!(b.take(), ["log 1 2", "finish 1"]);
    }

    #[test]
    fn skips_blocks_up_to_subscription_start() {
        let dispatcher = LogDispatcher::new();
        let recorder = Arc::new(Recorder::default());
        dispatcher
            .subscribe(recorder.clone(), vec![Address::ZERO], 5)
            .unwrap();

        for number in [5, 6] {
            dispatcher
                .process_block(&block(number, 0), vec![indexed_log(Address::ZERO, 0)])
                .now_or_never()
                .unwrap();
        }
        assert_eq!(recorder.take(), ["log 6 0", "finish 6"]);
    }

    #[test]
    fn extend_and_unsubscribe() {
        let dispatcher = LogDispatcher::new();
        let recorder = Arc::new(Recorder::default());
        let id = dispatcher
            .subscribe(recorder.clone(), vec![Address::repeat_byte(1)], 0)
            .unwrap();
        dispatcher.extend(id, vec![Address::repeat_byte(2)]).unwrap();
        assert_eq!(
            dispatcher.addresses(),
            [Address::repeat_byte(1), Address::repeat_byte(2)]
        );

        dispatcher
            .process_block(&block(1, 0), vec![indexed_log(Address::repeat_byte(2), 0)])
            .now_or_never()
            .unwrap();
        assert_eq!(recorder.take(), ["log 1 0", "finish 1"]);

        dispatcher.unsubscribe(id);
        assert!(dispatcher.extend(id, vec![]).is_err());
        dispatcher
            .process_block(&block(2, 0), vec![indexed_log(Address::repeat_byte(2), 0)])
            .now_or_never()
            .unwrap();
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn dropped_subscribers_are_removed() {
        let dispatcher = LogDispatcher::new();
        let recorder = Arc::new(Recorder::default());
        dispatcher.subscribe(recorder.clone(), vec![], 0).unwrap();
        drop(recorder);

        dispatcher
            .process_block(&block(1, 0), vec![])
            .now_or_never()
            .unwrap();
        assert_eq!(dispatcher.subscription_count(), 0);
    }

    #[tokio::test]
    async fn run_starts_after_subscription_block() {
        let dispatcher = LogDispatcher::new();
        let recorder = Arc::new(Recorder::default());
        dispatcher
            .subscribe(recorder.clone(), vec![Address::ZERO], 10)
            .unwrap();

        let mut fetcher = MockLogFetching::new();
        fetcher
            .expect_block()
            .withf(|number| *number == 11)
            .times(1)
            .returning(|number| Ok(block(number, 0)));
        fetcher.expect_logs().returning(|block, _| {
            Ok(match block.number {
                11 => vec![indexed_log(Address::ZERO, 0)],
                _ => vec![],
            })
        });

        dispatcher
            .run(&fetcher, futures::stream::iter([block(12, 0), block(13, 0)]))
            .await;
        assert_eq!(
            recorder.take(),
            ["log 11 0", "finish 11", "finish 12", "finish 13"]
        );
    }

    #[tokio::test]
    async fn run_fills_gaps_and_follows_reorgs() {
        let dispatcher = LogDispatcher::new();
        let recorder = Arc::new(Recorder::default());
        dispatcher
            .subscribe(recorder.clone(), vec![Address::ZERO], 0)
            .unwrap();

        // 1, gap to 3, then a reorg replacing 3 with a fork building 4 and 5
        // on top of it.
        let heads = futures::stream::iter([block(1, 0), block(3, 0), block(3, 0), block(5, 1)]);
        let mut fork_3 = block(3, 1);
        fork_3.parent_hash = block(2, 0).hash;
        let mut fork_4 = block(4, 1);
        fork_4.parent_hash = fork_3.hash;
        let mut fetcher = MockLogFetching::new();
        fetcher.expect_block().returning(move |number| match number {
            3 => Ok(fork_3),
            4 => Ok(fork_4),
            number => Ok(block(number, 0)),
        });
        fetcher.expect_logs().returning(|_, _| Ok(vec![]));

        dispatcher.run(&fetcher, heads).await;
        assert_eq!(
            recorder.take(),
            ["finish 1", "finish 2", "finish 3", "finish 3", "finish 4", "finish 5"]
        );
    }
}
