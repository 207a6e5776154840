pub mod arguments;
pub mod block;
pub mod current_block;
pub mod multicall;

pub use {
    arguments::Arguments,
    block::{Block, BlockInfo},
    current_block::{BlockRetrieving, CurrentBlockWatcher},
};
use {
    alloy::providers::{DynProvider, Provider, ProviderBuilder},
    anyhow::{Context, Result},
};

pub type AlloyProvider = DynProvider;

/// Creates a type erased alloy provider talking to the node over HTTP.
pub fn provider(url: &url::Url) -> AlloyProvider {
    ProviderBuilder::new().connect_http(url.clone()).erased()
}

/// Builds the provider and multicall batcher described by the command line
/// arguments.
pub fn connect(args: &Arguments) -> Result<(AlloyProvider, multicall::Batcher)> {
    let provider = provider(&args.node_url);
    let executor = multicall::AlloyMulticall::new(provider.clone(), args.multicall_address);
    let batcher = multicall::Batcher::new(std::sync::Arc::new(executor), args.multicall_batch_size)
        .context("invalid multicall configuration")?;
    Ok((provider, batcher))
}
