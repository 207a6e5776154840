//! Batching of independent on-chain read calls through the Multicall3
//! contract.
//!
//! All chunks of one [`Batcher::aggregate`] call are executed against the same
//! block. A [`Block::Recent`] request is resolved to a concrete block number
//! exactly once before any chunk gets dispatched so that all values read for
//! one request are mutually consistent.

use {
    crate::{AlloyProvider, Block},
    alloy::{
        eips::BlockId,
        primitives::{Address, Bytes, address},
        providers::Provider,
        sol_types::SolCall,
    },
    anyhow::Context as _,
    futures::future,
    std::{fmt, sync::Arc},
    tracing::instrument,
};

/// Canonical Multicall3 deployment, identical on virtually every EVM chain.
pub const MULTICALL3_ADDRESS: Address = address!("0xcA11bde05977b3631167028862bE2a173976CA11");

alloy::sol! {
    #[sol(rpc)]
    interface IMulticall3 {
        struct Call {
            address target;
            bytes callData;
        }

        struct CallResult {
            bool success;
            bytes returnData;
        }

        function tryAggregate(bool requireSuccess, Call[] calldata calls)
            external
            payable
            returns (CallResult[] memory returnData);
    }
}

/// A single read call in a multicall batch.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Call {
    /// The address to call.
    pub target: Address,
    /// Data to use for the call.
    pub call_data: Bytes,
}

/// Undecoded result of a single call.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RawResult {
    pub success: bool,
    pub return_data: Bytes,
}

/// Decoded result of a single call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CallOutcome<T> {
    /// Whether the call succeeded on-chain and its return data could be
    /// decoded.
    pub success: bool,
    pub value: Option<T>,
}

impl<T> CallOutcome<T> {
    pub fn ok(value: T) -> Self {
        Self {
            success: true,
            value: Some(value),
        }
    }

    pub fn failed() -> Self {
        Self {
            success: false,
            value: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MulticallError {
    /// The node could not be reached or rejected the aggregate call as a
    /// whole.
    #[error("multicall rpc request failed")]
    Rpc(#[from] anyhow::Error),
    /// A call failed while partial failures were not allowed.
    #[error("call {index} of the multicall failed")]
    CallFailed { index: usize },
    #[error("multicall returned {actual} results for {expected} calls")]
    LengthMismatch { expected: usize, actual: usize },
}

type Decoder<T> = Box<dyn Fn(&[u8]) -> anyhow::Result<T> + Send + Sync>;

/// A call together with the logic to decode its return data.
pub struct Request<T> {
    pub target: Address,
    pub call_data: Bytes,
    decode: Decoder<T>,
}

impl<T: 'static> Request<T> {
    pub fn new(
        target: Address,
        call_data: Bytes,
        decode: impl Fn(&[u8]) -> anyhow::Result<T> + Send + Sync + 'static,
    ) -> Self {
        Self {
            target,
            call_data,
            decode: Box::new(decode),
        }
    }

    /// Converts the decoded value. Useful to put requests with different
    /// return types into one batch.
    pub fn map<U: 'static>(self, f: impl Fn(T) -> U + Send + Sync + 'static) -> Request<U> {
        let decode = self.decode;
        Request {
            target: self.target,
            call_data: self.call_data,
            decode: Box::new(move |data| decode(data).map(&f)),
        }
    }

    pub fn decode(&self, data: &[u8]) -> anyhow::Result<T> {
        (self.decode)(data)
    }

    fn call(&self) -> Call {
        Call {
            target: self.target,
            call_data: self.call_data.clone(),
        }
    }
}

impl<T: 'static> Request<T> {
    /// Request for a `sol!` generated contract call.
    pub fn sol<C>(target: Address, call: &C) -> Self
    where
        C: SolCall<Return = T>,
    {
        Self::new(target, call.abi_encode().into(), |data| {
            C::abi_decode_returns(data)
                .with_context(|| format!("failed to decode {}", C::SIGNATURE))
        })
    }
}

impl<T> fmt::Debug for Request<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("target", &self.target)
            .field("call_data", &self.call_data)
            .finish_non_exhaustive()
    }
}

/// Executes one aggregate call on-chain.
#[cfg_attr(any(test, feature = "test-util"), mockall::automock)]
#[async_trait::async_trait]
pub trait MulticallExecuting: Send + Sync {
    /// Executes all calls in a single `tryAggregate` call at the given block.
    async fn try_aggregate(
        &self,
        calls: Vec<Call>,
        block: u64,
    ) -> Result<Vec<RawResult>, MulticallError>;

    /// The current block number of the node.
    async fn block_number(&self) -> Result<u64, MulticallError>;
}

/// [`MulticallExecuting`] implementation using a Multicall3 deployment.
pub struct AlloyMulticall {
    provider: AlloyProvider,
    contract: IMulticall3::IMulticall3Instance<AlloyProvider>,
}

impl AlloyMulticall {
    pub fn new(provider: AlloyProvider, address: Address) -> Self {
        Self {
            contract: IMulticall3::new(address, provider.clone()),
            provider,
        }
    }
}

#[async_trait::async_trait]
impl MulticallExecuting for AlloyMulticall {
    async fn try_aggregate(
        &self,
        calls: Vec<Call>,
        block: u64,
    ) -> Result<Vec<RawResult>, MulticallError> {
        let calls = calls
            .into_iter()
            .map(|call| IMulticall3::Call {
                target: call.target,
                callData: call.call_data,
            })
            .collect();
        let results = self
            .contract
            .tryAggregate(false, calls)
            .block(BlockId::number(block))
            .call()
            .await
            .context("tryAggregate")?;
        Ok(results
            .into_iter()
            .map(|result| RawResult {
                success: result.success,
                return_data: result.returnData,
            })
            .collect())
    }

    async fn block_number(&self) -> Result<u64, MulticallError> {
        Ok(self
            .provider
            .get_block_number()
            .await
            .context("eth_blockNumber")?)
    }
}

/// Splits read calls into chunks of bounded size and executes them as
/// multicalls.
#[derive(Clone)]
pub struct Batcher {
    executor: Arc<dyn MulticallExecuting>,
    batch_size: usize,
}

impl Batcher {
    pub fn new(executor: Arc<dyn MulticallExecuting>, batch_size: usize) -> anyhow::Result<Self> {
        anyhow::ensure!(batch_size > 0, "multicall batch size must be positive");
        Ok(Self {
            executor,
            batch_size,
        })
    }

    /// The configured default batch size.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Resolves [`Block::Recent`] to the node's current block number.
    pub async fn resolve(&self, block: Block) -> Result<u64, MulticallError> {
        match block {
            Block::Number(number) => Ok(number),
            Block::Recent => self.executor.block_number().await,
        }
    }

    /// Executes all calls at the same block and returns their raw results in
    /// request order.
    #[instrument(skip_all, fields(calls = calls.len(), ?block))]
    pub async fn aggregate_raw(
        &self,
        calls: Vec<Call>,
        block: Block,
        batch_size: usize,
    ) -> Result<Vec<RawResult>, MulticallError> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }
        let block = self.resolve(block).await?;
        let batch_size = batch_size.max(1);

        let metrics = metrics();
        metrics.calls.inc_by(calls.len() as u64);

        // `try_join_all` yields results in the order of the futures, not in
        // the order of completion.
        let chunks = future::try_join_all(calls.chunks(batch_size).map(|chunk| {
            metrics.chunks.inc();
            let expected = chunk.len();
            let chunk = chunk.to_vec();
            async move {
                let results = self.executor.try_aggregate(chunk, block).await?;
                if results.len() != expected {
                    return Err(MulticallError::LengthMismatch {
                        expected,
                        actual: results.len(),
                    });
                }
                Ok(results)
            }
        }))
        .await?;

        let results: Vec<_> = chunks.into_iter().flatten().collect();
        let failed = results.iter().filter(|result| !result.success).count();
        metrics.failed_calls.inc_by(failed as u64);
        tracing::debug!(block, failed, "executed multicall");
        Ok(results)
    }

    /// Executes all requests at the same block and decodes their results.
    ///
    /// With `allow_partial_failure` every request gets a [`CallOutcome`]
    /// where calls that reverted or returned undecodable data are marked as
    /// unsuccessful. Without it the first such call fails the whole
    /// aggregate.
    pub async fn aggregate<T: 'static>(
        &self,
        requests: Vec<Request<T>>,
        block: Block,
        batch_size: usize,
        allow_partial_failure: bool,
    ) -> Result<Vec<CallOutcome<T>>, MulticallError> {
        let calls = requests.iter().map(Request::call).collect();
        let results = self.aggregate_raw(calls, block, batch_size).await?;

        requests
            .iter()
            .zip(results)
            .enumerate()
            .map(|(index, (request, result))| {
                if !result.success {
                    tracing::debug!(index, target = ?request.target, "call reverted");
                    return match allow_partial_failure {
                        true => Ok(CallOutcome::failed()),
                        false => Err(MulticallError::CallFailed { index }),
                    };
                }
                match request.decode(&result.return_data) {
                    Ok(value) => Ok(CallOutcome::ok(value)),
                    Err(err) if allow_partial_failure => {
                        tracing::debug!(index, ?err, "undecodable call result");
                        Ok(CallOutcome::failed())
                    }
                    Err(err) => {
                        tracing::warn!(index, ?err, "undecodable call result");
                        Err(MulticallError::CallFailed { index })
                    }
                }
            })
            .collect()
    }

    /// Executes all requests with the default batch size and requires every
    /// single one of them to succeed.
    pub async fn fetch<T: 'static>(
        &self,
        requests: Vec<Request<T>>,
        block: Block,
    ) -> Result<Vec<T>, MulticallError> {
        let outcomes = self
            .aggregate(requests, block, self.batch_size, false)
            .await?;
        outcomes
            .into_iter()
            .enumerate()
            .map(|(index, outcome)| outcome.value.ok_or(MulticallError::CallFailed { index }))
            .collect()
    }
}

#[derive(prometheus_metric_storage::MetricStorage)]
#[metric(subsystem = "multicall")]
struct Metrics {
    /// Number of individual calls sent through multicalls.
    calls: prometheus::IntCounter,

    /// Number of aggregate calls sent to the node.
    chunks: prometheus::IntCounter,

    /// Number of individual calls that reverted.
    failed_calls: prometheus::IntCounter,
}

fn metrics() -> &'static Metrics {
    Metrics::instance(observe::metrics::get_storage_registry()).unwrap()
}
