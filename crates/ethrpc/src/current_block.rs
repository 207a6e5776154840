use {
    crate::{AlloyProvider, BlockInfo},
    alloy::{eips::BlockNumberOrTag, providers::Provider},
    anyhow::{Context as _, Result},
    futures::Stream,
    std::{sync::Arc, time::Duration},
    tokio::sync::watch,
    tokio_stream::wrappers::WatchStream,
    tracing::Instrument,
};

pub type CurrentBlockWatcher = watch::Receiver<BlockInfo>;

/// Access to block headers of the chain.
#[cfg_attr(any(test, feature = "test-util"), mockall::automock)]
#[async_trait::async_trait]
pub trait BlockRetrieving: Send + Sync {
    /// The current head of the chain.
    async fn current_block(&self) -> Result<BlockInfo>;

    /// The canonical block with the given number.
    async fn block(&self, number: u64) -> Result<BlockInfo>;
}

#[async_trait::async_trait]
impl BlockRetrieving for AlloyProvider {
    async fn current_block(&self) -> Result<BlockInfo> {
        self.get_block_by_number(BlockNumberOrTag::Latest)
            .await
            .context("failed to fetch latest block")?
            .map(BlockInfo::from)
            .context("latest block not found")
    }

    async fn block(&self, number: u64) -> Result<BlockInfo> {
        self.get_block_by_number(BlockNumberOrTag::Number(number))
            .await
            .with_context(|| format!("failed to fetch block {number}"))?
            .map(BlockInfo::from)
            .with_context(|| format!("block {number} not found"))
    }
}

/// Creates a cloneable stream that yields the current block whenever it
/// changes.
///
/// The stream is not guaranteed to yield *every* block individually without
/// gaps but it does yield the newest block whenever it detects a block number
/// increase. Consumers that need every block (like the log dispatcher) have to
/// fill the gaps themselves.
///
/// The stream is cloneable so that we only have to poll the node once while
/// being able to share the result with several consumers.
pub async fn current_block_stream(
    retriever: Arc<dyn BlockRetrieving>,
    poll_interval: Duration,
) -> Result<CurrentBlockWatcher> {
    let first_block = retriever.current_block().await?;
    tracing::debug!(number=%first_block.number, hash=?first_block.hash, "polled block");

    let (sender, receiver) = watch::channel(first_block);
    let update_future = async move {
        let mut previous_block = first_block;
        loop {
            tokio::time::sleep(poll_interval).await;
            let block = match retriever.current_block().await {
                Ok(block) => block,
                Err(err) => {
                    tracing::warn!(?err, "failed to get current block");
                    continue;
                }
            };

            // If the block is exactly the same, ignore it.
            if previous_block.hash == block.hash {
                continue;
            }

            tracing::debug!(number=%block.number, hash=?block.hash, "polled block");
            update_block_metrics(previous_block.number, block.number);

            // Only update the stream if the number has increased.
            if block.number <= previous_block.number {
                continue;
            }

            if sender.send(block).is_err() {
                tracing::debug!("all receivers dropped, exiting polling loop");
                break;
            }

            previous_block = block;
        }
    };

    tokio::task::spawn(update_future.instrument(tracing::info_span!("current_block_stream")));
    Ok(receiver)
}

/// Returns a stream of blocks yielding the current block first.
pub fn into_stream(receiver: CurrentBlockWatcher) -> impl Stream<Item = BlockInfo> {
    WatchStream::new(receiver)
}

fn update_block_metrics(previous_block: u64, current_block: u64) {
    let metrics = Metrics::instance(observe::metrics::get_storage_registry()).unwrap();
    metrics.block_stream_current_block.set(current_block as _);

    // Block numbers that went backwards or stayed the same point at a reorg.
    if current_block <= previous_block {
        metrics
            .block_stream_reorg_depth
            .observe((previous_block - current_block + 1) as f64);
    }
}

#[derive(prometheus_metric_storage::MetricStorage)]
struct Metrics {
    /// Most recent block number seen by the block stream.
    block_stream_current_block: prometheus::IntGauge,

    /// Depth of observed reorgs.
    #[metric(buckets(1., 2., 3., 5., 10., 20., 64.))]
    block_stream_reorg_depth: prometheus::Histogram,
}
